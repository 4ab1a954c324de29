//! Signature policy checks and the bridge to transaction signature hashing.
//!
//! The interpreter never hashes a transaction itself. It hands the script
//! code to a [`SignatureChecker`], which for real spends is a
//! [`TransactionSignatureChecker`] over anything implementing
//! [`SighashProvider`] (usually a `bitcoin::Transaction`).

#[cfg(feature = "std")]
use std::sync::OnceLock;

use bitcoin::{
    absolute::LOCK_TIME_THRESHOLD,
    blockdata::script::ScriptBuf,
    hashes::Hash,
    secp256k1::{self, ecdsa::Signature as EcdsaSignature, Message, PublicKey, Secp256k1},
    sighash::SighashCache,
    Transaction,
};

use crate::{
    flags::ScriptFlags, interpreter::ScriptError, script::Script, VERIFY_LOW_S, VERIFY_STRICTENC,
};

/// Input sequence that opts out of lock-time enforcement.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

const SIGHASH_ANYONECANPAY: u8 = 0x80;

type VerificationContext = Secp256k1<secp256k1::VerifyOnly>;

#[cfg(feature = "std")]
static SECP256K1: OnceLock<VerificationContext> = OnceLock::new();

fn with_verification_ctx<R>(f: impl FnOnce(&VerificationContext) -> R) -> R {
    #[cfg(feature = "std")]
    {
        f(SECP256K1.get_or_init(Secp256k1::verification_only))
    }
    #[cfg(not(feature = "std"))]
    {
        let ctx = Secp256k1::verification_only();
        f(&ctx)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SighashError {
    #[error("input index {index} out of range for {inputs} inputs")]
    InputIndex { index: usize, inputs: usize },
}

/// Transaction data the signature and lock-time opcodes depend on.
pub trait SighashProvider {
    /// Legacy signature hash of input `input_index` committing to `script_code`.
    fn signature_hash(
        &self,
        input_index: usize,
        script_code: &Script,
        sighash_type: u32,
    ) -> Result<[u8; 32], SighashError>;

    fn lock_time(&self) -> u32;

    fn version(&self) -> i32;

    fn input_sequence(&self, input_index: usize) -> Option<u32>;
}

impl SighashProvider for Transaction {
    fn signature_hash(
        &self,
        input_index: usize,
        script_code: &Script,
        sighash_type: u32,
    ) -> Result<[u8; 32], SighashError> {
        let mut script_code = script_code.clone();
        script_code.remove_code_separators();
        let script_code = ScriptBuf::from_bytes(script_code.to_bytes());

        SighashCache::new(self)
            .legacy_signature_hash(input_index, &script_code, sighash_type)
            .map(|hash| hash.to_byte_array())
            .map_err(|_| SighashError::InputIndex {
                index: input_index,
                inputs: self.input.len(),
            })
    }

    fn lock_time(&self) -> u32 {
        self.lock_time.to_consensus_u32()
    }

    fn version(&self) -> i32 {
        self.version.0
    }

    fn input_sequence(&self, input_index: usize) -> Option<u32> {
        self.input
            .get(input_index)
            .map(|input| input.sequence.to_consensus_u32())
    }
}

/// Answers the questions the interpreter cannot decide from the script alone.
///
/// Every method rejects by default, which is what evaluation without a
/// transaction should do.
pub trait SignatureChecker {
    /// `signature` carries its hash-type byte; `script_code` is the code
    /// after the last executed `OP_CODESEPARATOR`, signatures already removed.
    fn check_sig(&self, _signature: &[u8], _pubkey: &[u8], _script_code: &Script) -> bool {
        false
    }

    fn check_lock_time(&self, _lock_time: i64) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: i64) -> bool {
        false
    }
}

/// Checker for evaluation outside any transaction.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullChecker;

impl SignatureChecker for NullChecker {}

/// Checker bound to one input of a transaction.
#[derive(Debug)]
pub struct TransactionSignatureChecker<'a, P: ?Sized = Transaction> {
    provider: &'a P,
    input_index: usize,
}

impl<'a, P: SighashProvider + ?Sized> TransactionSignatureChecker<'a, P> {
    pub fn new(provider: &'a P, input_index: usize) -> Self {
        Self {
            provider,
            input_index,
        }
    }
}

impl<P: SighashProvider + ?Sized> SignatureChecker for TransactionSignatureChecker<'_, P> {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &Script) -> bool {
        let Some((&hash_type, der)) = signature.split_last() else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(mut signature) = EcdsaSignature::from_der_lax(der) else {
            return false;
        };
        signature.normalize_s();

        let Ok(digest) =
            self.provider
                .signature_hash(self.input_index, script_code, u32::from(hash_type))
        else {
            return false;
        };
        let message = Message::from_digest(digest);
        with_verification_ctx(|secp| secp.verify_ecdsa(&message, &signature, &pubkey).is_ok())
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock_time = i64::from(self.provider.lock_time());
        let threshold = i64::from(LOCK_TIME_THRESHOLD);
        if (tx_lock_time < threshold) != (lock_time < threshold) {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input would let the lock time be bypassed.
        matches!(
            self.provider.input_sequence(self.input_index),
            Some(sequence) if sequence != SEQUENCE_FINAL
        )
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let Some(tx_sequence) = self.provider.input_sequence(self.input_index) else {
            return false;
        };
        if (self.provider.version() as u32) < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return false;
        }

        let mask = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK);
        let type_flag = i64::from(SEQUENCE_LOCKTIME_TYPE_FLAG);
        let tx_masked = i64::from(tx_sequence) & mask;
        let script_masked = sequence & mask;
        if (tx_masked < type_flag) != (script_masked < type_flag) {
            return false;
        }
        script_masked <= tx_masked
    }
}

/// Encoding checks applied to a signature before it is verified.
pub fn check_signature_encoding(signature: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is a compact way to fail a CHECKSIG.
    if signature.is_empty() {
        return Ok(());
    }
    if flags.requires_strict_der() && !is_valid_signature_encoding(signature) {
        return Err(ScriptError::SigDer);
    }
    if flags.contains(VERIFY_LOW_S) && !is_low_der_signature(signature) {
        return Err(ScriptError::SigHighS);
    }
    if flags.contains(VERIFY_STRICTENC) && !is_defined_hashtype_signature(signature) {
        return Err(ScriptError::SigHashType);
    }
    Ok(())
}

pub fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if flags.contains(VERIFY_STRICTENC) && !is_valid_pubkey_encoding(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

/// Strict DER check of `signature` with its trailing hash-type byte.
///
/// Layout: `0x30 len 0x02 len_r R 0x02 len_s S hashtype`, where R and S are
/// minimal, positive big-endian integers.
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }

    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }

    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }

    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

/// S no greater than half the curve order. Assumes strict DER.
///
/// Goes through the same lax parse as verification, so a component at or
/// above the curve order zeroes the signature and it counts as low.
pub fn is_low_der_signature(sig: &[u8]) -> bool {
    if !is_valid_signature_encoding(sig) {
        return false;
    }
    let Ok(parsed) = EcdsaSignature::from_der_lax(&sig[..sig.len() - 1]) else {
        return false;
    };
    let mut normalized = parsed;
    normalized.normalize_s();
    normalized == parsed
}

pub fn is_defined_hashtype_signature(sig: &[u8]) -> bool {
    match sig.last() {
        Some(&hash_type) => matches!(hash_type & !SIGHASH_ANYONECANPAY, 0x01..=0x03),
        None => false,
    }
}

/// 33-byte compressed or 65-byte uncompressed SEC encoding.
pub fn is_valid_pubkey_encoding(pubkey: &[u8]) -> bool {
    match pubkey.len() {
        33 => matches!(pubkey[0], 0x02 | 0x03),
        65 => pubkey[0] == 0x04,
        _ => false,
    }
}
