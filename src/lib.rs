#![cfg_attr(not(feature = "std"), no_std)]
//! Bitcoin transaction script engine.
//!
//! Parses, builds and executes legacy (pre-segwit) Bitcoin scripts with the
//! same outcome as Bitcoin Core's interpreter. The byte-level entry points
//! mirror the `libbitcoinconsensus` API surface; the typed ones work on
//! [`Script`] values and any [`SignatureChecker`].

extern crate alloc;

pub mod flags;
pub mod interpreter;
pub mod num;
pub mod opcode;
pub mod script;
pub mod signature;
mod tx;

pub use flags::{ParseFlagsError, ScriptFlags};
pub use interpreter::{
    eval_script, ErrorCategory, Interpreter, ScriptError, ScriptStack, MAX_OPS_PER_SCRIPT,
    MAX_PUBKEYS_PER_MULTISIG, MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_SIZE, MAX_STACK_SIZE,
};
pub use num::{cast_to_bool, NumError, ScriptNum};
pub use opcode::{Opcode, OpcodeClass};
pub use script::{
    Chunk, InputType, MultisigInfo, ParseError, PushData, Script, ScriptType, TemplateError,
};
pub use signature::{
    NullChecker, SighashError, SighashProvider, SignatureChecker, TransactionSignatureChecker,
};
pub use tx::TransactionContext;

use log::debug;

/// Do not enable any verification.
pub const VERIFY_NONE: u32 = 0;
/// Evaluate P2SH (BIP16) subscripts.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict signature and public key encodings.
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Enforce strict DER (BIP66) compliance.
pub const VERIFY_DERSIG: u32 = 1 << 2;
/// Require signatures to use low-S form.
pub const VERIFY_LOW_S: u32 = 1 << 3;
/// Require the CHECKMULTISIG dummy argument to be empty (BIP147).
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// Require scriptSig to be push only.
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Require minimal pushes and minimally encoded numeric operands.
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Discourage use of upgradable NOP opcodes.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
/// Enable CHECKLOCKTIMEVERIFY (BIP65).
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
/// Enable CHECKSEQUENCEVERIFY (BIP112).
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;

/// Flags every block must satisfy.
pub const VERIFY_MANDATORY: u32 = VERIFY_P2SH;

/// Relay policy flags.
pub const VERIFY_STANDARD: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY;

/// All soft-fork flags that apply to legacy scripts.
pub const VERIFY_ALL_CONSENSUS: u32 = VERIFY_P2SH
    | VERIFY_DERSIG
    | VERIFY_NULLDUMMY
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY;

/// Computes flags for soft fork activation heights on the Bitcoin network.
pub fn height_to_flags(height: u32) -> u32 {
    let mut flag = VERIFY_NONE;

    if height >= 173_805 {
        flag |= VERIFY_P2SH;
    }
    if height >= 363_725 {
        flag |= VERIFY_DERSIG;
    }
    if height >= 388_381 {
        flag |= VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= 419_328 {
        flag |= VERIFY_CHECKSEQUENCEVERIFY;
    }
    if height >= 481_824 {
        flag |= VERIFY_NULLDUMMY;
    }

    flag
}

/// Detailed failure information returned by [`verify_with_flags_detailed`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    pub error: Error,
    /// Set when the scripts ran and failed, `None` for input errors.
    pub script_error: Option<ScriptError>,
}

impl From<Error> for ScriptFailure {
    fn from(error: Error) -> Self {
        ScriptFailure {
            error,
            script_error: None,
        }
    }
}

/// Verifies input `input_index` of a serialized transaction against the
/// scriptPubKey it spends, under [`VERIFY_ALL_CONSENSUS`].
pub fn verify(
    spent_output: &[u8],
    spending_transaction: &[u8],
    input_index: usize,
) -> Result<(), Error> {
    verify_with_flags(
        spent_output,
        spending_transaction,
        input_index,
        VERIFY_ALL_CONSENSUS,
    )
}

/// Same as [`verify`] but with explicit script verification flags.
pub fn verify_with_flags(
    spent_output_script: &[u8],
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), Error> {
    perform_verification(spent_output_script, spending_transaction, input_index, flags)
        .map_err(|failure| failure.error)
}

/// Same as [`verify_with_flags`] but also reports the interpreter's `ScriptError`.
pub fn verify_with_flags_detailed(
    spent_output_script: &[u8],
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), ScriptFailure> {
    perform_verification(spent_output_script, spending_transaction, input_index, flags)
}

/// Verifies a scriptSig/scriptPubKey pair with a caller-supplied checker.
pub fn verify_script(
    script_sig: &Script,
    script_pubkey: &Script,
    checker: &dyn SignatureChecker,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    Interpreter::new(flags, checker).verify_script(script_sig, script_pubkey)
}

fn perform_verification(
    spent_output_script: &[u8],
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), ScriptFailure> {
    let flags = ScriptFlags::from_bits(flags)?;
    let tx_ctx = TransactionContext::parse(spending_transaction)?;
    tx_ctx.ensure_input_index(input_index)?;
    let script_sig = tx_ctx.script_sig(input_index).ok_or(Error::ERR_TX_INDEX)?;

    let checker = tx_ctx.checker(input_index);
    let mut interpreter = Interpreter::new(flags, &checker);
    interpreter
        .verify(script_sig, spent_output_script)
        .map_err(|err| {
            debug!(
                target: "txscript::verify",
                "input {input_index} failed under {flags}: {}",
                err.code()
            );
            ScriptFailure {
                error: Error::ERR_SCRIPT,
                script_error: Some(err),
            }
        })
}

/// Errors returned by the byte-level verification API.
///
/// The variants mirror the identifiers exposed by `libbitcoinconsensus`.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The scripts were evaluated and failed.
    #[error("script verification failed")]
    ERR_SCRIPT,
    #[error("an invalid index for txTo")]
    ERR_TX_INDEX,
    #[error("txToLen did not match with the size of txTo")]
    ERR_TX_SIZE_MISMATCH,
    #[error("an error deserializing txTo")]
    ERR_TX_DESERIALIZE,
    #[error("script verification flags are invalid")]
    ERR_INVALID_FLAGS,
}
