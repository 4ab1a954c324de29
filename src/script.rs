//! Script codec.
//!
//! A [`Script`] is held as a list of [`Chunk`]s. Parsing is strict about
//! truncation but keeps whatever push width the bytes used, so
//! `Script::from_bytes(b)?.to_bytes() == b` for every parseable `b`.
//! Builders always pick the shortest push.

use alloc::{format, string::String, vec, vec::Vec};
use core::{fmt, str::FromStr};

use bitcoin::{
    hashes::{hash160, Hash},
    hex::{DisplayHex, FromHex},
};

use crate::{
    num::encode_num,
    opcode::{all::*, Opcode},
    signature::is_valid_signature_encoding,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("push at byte {offset} needs {needed} bytes but only {available} remain")]
    TruncatedPush {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("invalid hex literal `{0}`")]
    InvalidHex(String),
    #[error("unknown opcode `{0}`")]
    UnknownOpcode(String),
    #[error("`{0}` must be followed by a push length")]
    MissingLength(String),
    #[error("invalid push length `{0}`")]
    InvalidLength(String),
    #[error("push declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{len} bytes cannot be pushed with {opcode}")]
    PushWidth { opcode: Opcode, len: usize },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("multisig needs between 1 and 16 keys, got {0}")]
    KeyCount(usize),
    #[error("threshold {required} is out of range for {keys} keys")]
    Threshold { required: usize, keys: usize },
}

/// Standard output templates recognised by [`Script::classify`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    NullData,
    NonStandard,
}

/// Spending templates recognised by [`Script::classify_input`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputType {
    PubKey,
    PubKeyHash,
    MultiSig,
    ScriptHash,
    NonStandard,
}

/// Parameters of an `m <keys> n OP_CHECKMULTISIG` script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigInfo<'a> {
    pub required: usize,
    pub pubkeys: Vec<&'a [u8]>,
}

/// Payload of a data push together with the opcode that encoded it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PushData {
    opcode: Opcode,
    data: Vec<u8>,
}

impl PushData {
    /// Pushes `data` with the shortest opcode for its length.
    pub fn new(data: Vec<u8>) -> Self {
        let opcode = match data.len() {
            0 => OP_0,
            len @ 1..=75 => Opcode::from_u8(len as u8),
            76..=0xff => OP_PUSHDATA1,
            0x100..=0xffff => OP_PUSHDATA2,
            _ => OP_PUSHDATA4,
        };
        PushData { opcode, data }
    }

    /// Pushes `data` with an explicit opcode, which must be able to encode its length.
    pub fn with_opcode(opcode: Opcode, data: Vec<u8>) -> Result<Self, ParseError> {
        let fits = match opcode {
            OP_0 => data.is_empty(),
            OP_PUSHDATA1 => data.len() <= 0xff,
            OP_PUSHDATA2 => data.len() <= 0xffff,
            OP_PUSHDATA4 => u32::try_from(data.len()).is_ok(),
            op if op.is_push() => data.len() == op.to_u8() as usize,
            _ => false,
        };
        if !fits {
            return Err(ParseError::PushWidth {
                opcode,
                len: data.len(),
            });
        }
        Ok(PushData { opcode, data })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this is the shortest way to put `data` on the stack,
    /// small integers included.
    pub fn is_minimal(&self) -> bool {
        let data = self.data.as_slice();
        match data {
            [] => self.opcode == OP_0,
            [n @ 1..=16] => self.opcode == Opcode::from_u8(OP_1.to_u8() + n - 1),
            [0x81] => self.opcode == OP_1NEGATE,
            _ if data.len() <= 75 => self.opcode.to_u8() as usize == data.len(),
            _ if data.len() <= 0xff => self.opcode == OP_PUSHDATA1,
            _ if data.len() <= 0xffff => self.opcode == OP_PUSHDATA2,
            _ => true,
        }
    }

    fn encoded_len(&self) -> usize {
        let prefix = match self.opcode {
            OP_PUSHDATA1 => 2,
            OP_PUSHDATA2 => 3,
            OP_PUSHDATA4 => 5,
            _ => 1,
        };
        prefix + self.data.len()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.opcode.to_u8());
        let len = self.data.len();
        match self.opcode {
            OP_PUSHDATA1 => out.push(len as u8),
            OP_PUSHDATA2 => out.extend_from_slice(&(len as u16).to_le_bytes()),
            OP_PUSHDATA4 => out.extend_from_slice(&(len as u32).to_le_bytes()),
            _ => {}
        }
        out.extend_from_slice(&self.data);
    }
}

impl fmt::Debug for PushData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.opcode, self.data.as_hex())
    }
}

/// One element of a script: a bare opcode or a data push.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Chunk {
    Op(Opcode),
    Push(PushData),
}

impl Chunk {
    /// Shortest push of `data`.
    pub fn push(data: impl Into<Vec<u8>>) -> Self {
        Chunk::Push(PushData::new(data.into()))
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Chunk::Op(op) => *op,
            Chunk::Push(push) => push.opcode,
        }
    }

    pub fn push_data(&self) -> Option<&[u8]> {
        match self {
            Chunk::Op(_) => None,
            Chunk::Push(push) => Some(&push.data),
        }
    }

    /// Push-only in the consensus sense: any opcode up to `OP_16`.
    pub fn is_push_only(&self) -> bool {
        self.opcode() <= OP_16
    }

    /// `0..=16` for `OP_0` and `OP_1`..`OP_16`.
    fn small_int(&self) -> Option<usize> {
        match self {
            Chunk::Push(push) if push.opcode == OP_0 => Some(0),
            Chunk::Op(op) if (OP_1..=OP_16).contains(op) => {
                Some((op.to_u8() - OP_1.to_u8()) as usize + 1)
            }
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Chunk::Op(_) => 1,
            Chunk::Push(push) => push.encoded_len(),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Chunk::Op(op) => out.push(op.to_u8()),
            Chunk::Push(push) => push.write_to(out),
        }
    }
}

impl From<Opcode> for Chunk {
    /// A data-push opcode becomes a push of the zero bytes it declares:
    /// empty for `OP_0` and `OP_PUSHDATAn`, `n` zeros for the direct pushes.
    fn from(op: Opcode) -> Self {
        if !op.is_push() {
            return Chunk::Op(op);
        }
        let len = if op < OP_PUSHDATA1 { op.to_u8() as usize } else { 0 };
        Chunk::Push(PushData {
            opcode: op,
            data: vec![0; len],
        })
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Op(op) => write!(f, "{op}"),
            Chunk::Push(push) => {
                let len = push.data.len();
                match push.opcode {
                    OP_0 => f.write_str("OP_0"),
                    op @ (OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4) if len == 0 => {
                        write!(f, "{op} 0")
                    }
                    op @ (OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4) => {
                        write!(f, "{op} {len} 0x{}", push.data.as_hex())
                    }
                    _ => write!(f, "{len} 0x{}", push.data.as_hex()),
                }
            }
        }
    }
}

/// A parsed script.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Script {
    chunks: Vec<Chunk>,
}

impl Script {
    pub fn new() -> Self {
        Script { chunks: Vec::new() }
    }

    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Script { chunks }
    }

    /// Parses serialized script bytes. Fails only on a push that runs past the end.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut chunks = Vec::new();
        parse_into(bytes, &mut chunks)?;
        Ok(Script { chunks })
    }

    /// Parses as far as the bytes allow, returning the chunks read before any error.
    pub fn parse_prefix(bytes: &[u8]) -> (Self, Option<ParseError>) {
        let mut chunks = Vec::new();
        let error = parse_into(bytes, &mut chunks).err();
        (Script { chunks }, error)
    }

    pub fn from_hex(hex: &str) -> Result<Self, ParseError> {
        let bytes =
            Vec::<u8>::from_hex(hex).map_err(|_| ParseError::InvalidHex(String::from(hex)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        for chunk in &self.chunks {
            chunk.write_to(&mut out);
        }
        out
    }

    pub fn to_hex(&self) -> String {
        self.to_bytes().to_lower_hex_string()
    }

    pub fn serialized_len(&self) -> usize {
        self.chunks.iter().map(Chunk::encoded_len).sum()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    // Builders.

    /// Appends an opcode. Data-push opcodes carry a zero payload of the
    /// width they declare so the bytes always reparse to the same chunks;
    /// real payloads belong in [`Script::push_slice`].
    pub fn push_opcode(mut self, op: Opcode) -> Self {
        self.chunks.push(Chunk::from(op));
        self
    }

    /// Appends `data` using the shortest push encoding.
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        self.chunks.push(Chunk::push(data));
        self
    }

    /// Appends a number: `OP_1NEGATE`, `OP_0`..`OP_16`, or a minimal script number push.
    pub fn push_int(self, n: i64) -> Self {
        if n == -1 {
            return self.push_opcode(OP_1NEGATE);
        }
        match u8::try_from(n).ok().and_then(Opcode::from_small_int) {
            Some(op) => self.push_opcode(op),
            None => self.push_slice(&encode_num(n)),
        }
    }

    pub fn push_chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    pub fn prepend(&mut self, chunk: Chunk) {
        self.chunks.insert(0, chunk);
    }

    /// Puts an `OP_0` in front, as needed for the multisig dummy.
    pub fn prepend_op0(&mut self) {
        self.prepend(Chunk::from(OP_0));
    }

    pub fn remove_chunk(&mut self, index: usize) -> Option<Chunk> {
        (index < self.chunks.len()).then(|| self.chunks.remove(index))
    }

    /// Removes every chunk equal to `pattern`, encoding included. Returns the count.
    pub fn find_and_delete(&mut self, pattern: &Chunk) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|chunk| chunk != pattern);
        before - self.chunks.len()
    }

    pub fn remove_code_separators(&mut self) -> usize {
        self.find_and_delete(&Chunk::Op(OP_CODESEPARATOR))
    }

    // Predicates and templates.

    pub fn is_push_only(&self) -> bool {
        self.chunks.iter().all(Chunk::is_push_only)
    }

    /// Exactly `OP_HASH160 <20 bytes> OP_EQUAL`, byte for byte.
    pub fn is_p2sh(&self) -> bool {
        matches!(
            self.chunks.as_slice(),
            [Chunk::Op(OP_HASH160), Chunk::Push(hash), Chunk::Op(OP_EQUAL)]
                if hash.opcode.to_u8() == 20
        )
    }

    pub fn is_p2pkh(&self) -> bool {
        matches!(
            self.chunks.as_slice(),
            [
                Chunk::Op(OP_DUP),
                Chunk::Op(OP_HASH160),
                Chunk::Push(hash),
                Chunk::Op(OP_EQUALVERIFY),
                Chunk::Op(OP_CHECKSIG),
            ] if hash.opcode.to_u8() == 20
        )
    }

    pub fn is_p2pk(&self) -> bool {
        matches!(
            self.chunks.as_slice(),
            [Chunk::Push(key), Chunk::Op(OP_CHECKSIG)] if matches!(key.data.len(), 33 | 65)
        )
    }

    pub fn is_multisig(&self) -> bool {
        self.multisig_info().is_some()
    }

    /// `OP_RETURN` followed only by pushes.
    pub fn is_null_data(&self) -> bool {
        match self.chunks.split_first() {
            Some((Chunk::Op(OP_RETURN), rest)) => rest.iter().all(Chunk::is_push_only),
            _ => false,
        }
    }

    pub fn multisig_info(&self) -> Option<MultisigInfo<'_>> {
        let [first, keys @ .., count, Chunk::Op(OP_CHECKMULTISIG)] = self.chunks.as_slice() else {
            return None;
        };
        let required = first.small_int()?;
        let declared = count.small_int()?;
        let pubkeys = keys
            .iter()
            .map(Chunk::push_data)
            .collect::<Option<Vec<_>>>()?;
        if required == 0 || required > declared || declared != pubkeys.len() {
            return None;
        }
        Some(MultisigInfo { required, pubkeys })
    }

    pub fn classify(&self) -> ScriptType {
        if self.is_p2pkh() {
            ScriptType::PubKeyHash
        } else if self.is_p2sh() {
            ScriptType::ScriptHash
        } else if self.is_multisig() {
            ScriptType::MultiSig
        } else if self.is_p2pk() {
            ScriptType::PubKey
        } else if self.is_null_data() {
            ScriptType::NullData
        } else {
            ScriptType::NonStandard
        }
    }

    /// Data items of a standard output: key, key hash, script hash or multisig keys.
    pub fn capture(&self) -> Vec<&[u8]> {
        match self.classify() {
            ScriptType::PubKey => self.chunks[0].push_data().into_iter().collect(),
            ScriptType::PubKeyHash => self.chunks[2].push_data().into_iter().collect(),
            ScriptType::ScriptHash => self.chunks[1].push_data().into_iter().collect(),
            ScriptType::MultiSig => self
                .multisig_info()
                .map(|info| info.pubkeys)
                .unwrap_or_default(),
            ScriptType::NullData | ScriptType::NonStandard => Vec::new(),
        }
    }

    /// HASH160 of the serialization, as committed to by a P2SH output.
    pub fn script_hash(&self) -> [u8; 20] {
        hash160::Hash::hash(&self.to_bytes()).to_byte_array()
    }

    pub fn new_p2pk(pubkey: &[u8]) -> Self {
        Script::new().push_slice(pubkey).push_opcode(OP_CHECKSIG)
    }

    pub fn new_p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        Script::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(pubkey_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
    }

    pub fn new_p2sh(script_hash: &[u8; 20]) -> Self {
        Script::new()
            .push_opcode(OP_HASH160)
            .push_slice(script_hash)
            .push_opcode(OP_EQUAL)
    }

    /// P2SH output committing to `redeem_script`.
    pub fn to_p2sh(&self) -> Self {
        Script::new_p2sh(&self.script_hash())
    }

    /// `m <keys> n OP_CHECKMULTISIG`. Keys are sorted bytewise when `sort` is set.
    pub fn new_multisig<K: AsRef<[u8]>>(
        required: usize,
        pubkeys: &[K],
        sort: bool,
    ) -> Result<Self, TemplateError> {
        let mut keys: Vec<&[u8]> = pubkeys.iter().map(AsRef::as_ref).collect();
        let total = keys.len();
        if !(1..=16).contains(&total) {
            return Err(TemplateError::KeyCount(total));
        }
        if required == 0 || required > total {
            return Err(TemplateError::Threshold {
                required,
                keys: total,
            });
        }
        if sort {
            keys.sort_unstable();
        }

        let script = keys
            .into_iter()
            .fold(Script::new().push_int(required as i64), Script::push_slice);
        Ok(script
            .push_int(total as i64)
            .push_opcode(OP_CHECKMULTISIG))
    }

    pub fn new_op_return(data: &[u8]) -> Self {
        Script::new().push_opcode(OP_RETURN).push_slice(data)
    }

    // Spending-side helpers for scriptSigs.

    /// The last push parsed as a script, for P2SH scriptSigs.
    pub fn redeem_script(&self) -> Option<Script> {
        if !self.is_push_only() {
            return None;
        }
        let data = self.chunks.last()?.push_data()?;
        Script::from_bytes(data).ok()
    }

    fn is_p2sh_multisig_sig(&self) -> bool {
        self.starts_with_dummy()
            && self.chunks.len() >= 2
            && self.redeem_script().is_some_and(|redeem| redeem.is_multisig())
    }

    fn starts_with_dummy(&self) -> bool {
        matches!(self.chunks.first(), Some(Chunk::Push(push)) if push.opcode == OP_0)
    }

    /// Non-empty signatures carried by a multisig, P2SH multisig or P2PKH scriptSig.
    pub fn signatures(&self) -> Vec<&[u8]> {
        let candidates = if self.is_p2sh_multisig_sig() {
            &self.chunks[1..self.chunks.len() - 1]
        } else if self.starts_with_dummy() {
            &self.chunks[1..]
        } else if self.chunks.len() == 2 && self.is_push_only() {
            &self.chunks[..1]
        } else {
            &[]
        };
        candidates
            .iter()
            .filter_map(Chunk::push_data)
            .filter(|data| !data.is_empty())
            .collect()
    }

    pub fn count_signatures(&self) -> usize {
        self.signatures().len()
    }

    /// Signatures still needed by a partially signed input.
    ///
    /// `None` for a bare multisig output script, which is not an input.
    pub fn count_missing_signatures(&self) -> Option<usize> {
        if self.is_multisig() {
            return None;
        }
        if self.is_p2sh_multisig_sig() {
            let redeem = self.redeem_script()?;
            let required = redeem.multisig_info()?.required;
            return Some(required.saturating_sub(self.count_signatures()));
        }
        Some(usize::from(self.is_empty()))
    }

    /// Whether a P2SH multisig scriptSig carries all the signatures it needs.
    pub fn is_multisig_finished(&self) -> Option<bool> {
        self.count_missing_signatures().map(|missing| missing == 0)
    }

    /// Hash-type byte shared by every signature, `None` if they disagree or there are none.
    pub fn hash_type(&self) -> Option<u8> {
        let mut hash_types = self.signatures().into_iter().filter_map(|sig| sig.last().copied());
        let first = hash_types.next()?;
        hash_types.all(|hash_type| hash_type == first).then_some(first)
    }

    /// `<sig>` alone, the signature starting with a DER sequence tag.
    pub fn is_p2pk_input(&self) -> bool {
        matches!(
            self.chunks.as_slice(),
            [Chunk::Push(sig)] if sig.data.first() == Some(&0x30)
        )
    }

    /// `<sig> <pubkey>` with a plausibly encoded key.
    pub fn is_p2pkh_input(&self) -> bool {
        let [Chunk::Push(sig), Chunk::Push(key)] = self.chunks.as_slice() else {
            return false;
        };
        let key_ok = match (key.data.first(), key.data.len()) {
            (Some(0x02 | 0x03), 33) => true,
            (Some(0x04 | 0x06 | 0x07), 65) => true,
            _ => false,
        };
        !sig.data.is_empty() && key_ok
    }

    /// `OP_0 <sig>...` where every signature is strict DER with a hash type.
    pub fn is_multisig_input(&self) -> bool {
        self.chunks.len() >= 2
            && self.starts_with_dummy()
            && self.chunks[1..]
                .iter()
                .all(|chunk| chunk.push_data().is_some_and(is_valid_signature_encoding))
    }

    /// Anything ending in a push of a recognised output script.
    pub fn is_p2sh_input(&self) -> bool {
        if self.chunks.len() < 2 {
            return false;
        }
        self.chunks
            .last()
            .and_then(Chunk::push_data)
            .and_then(|data| Script::from_bytes(data).ok())
            .is_some_and(|redeem| redeem.classify() != ScriptType::NonStandard)
    }

    /// First matching spending template. P2PKH wins over P2SH when both fit.
    pub fn classify_input(&self) -> InputType {
        if self.is_p2pk_input() {
            InputType::PubKey
        } else if self.is_p2pkh_input() {
            InputType::PubKeyHash
        } else if self.is_multisig_input() {
            InputType::MultiSig
        } else if self.is_p2sh_input() {
            InputType::ScriptHash
        } else {
            InputType::NonStandard
        }
    }

    /// `<der||hash_type> <pubkey>`.
    pub fn new_p2pkh_input(der_signature: &[u8], hash_type: u8, pubkey: &[u8]) -> Self {
        let mut signature = Vec::with_capacity(der_signature.len() + 1);
        signature.extend_from_slice(der_signature);
        signature.push(hash_type);
        Script::new().push_slice(&signature).push_slice(pubkey)
    }

    /// `OP_0 <sig>...` for a bare multisig output. Signatures carry their hash type.
    pub fn new_multisig_input<S: AsRef<[u8]>>(signatures: &[S]) -> Self {
        signatures
            .iter()
            .fold(Script::new().push_opcode(OP_0), |script, sig| {
                script.push_slice(sig.as_ref())
            })
    }

    /// `OP_0 <sig>... <redeem script>` spending a P2SH multisig output.
    pub fn new_p2sh_multisig_input<S: AsRef<[u8]>, K: AsRef<[u8]>>(
        required: usize,
        pubkeys: &[K],
        signatures: &[S],
        sort: bool,
    ) -> Result<Self, TemplateError> {
        let redeem = Script::new_multisig(required, pubkeys, sort)?;
        Ok(Script::new_multisig_input(signatures).push_slice(&redeem.to_bytes()))
    }

    /// Signature operations, counted the way block limits count them.
    ///
    /// `CHECKMULTISIG` costs 20 unless `accurate` is set and it directly
    /// follows `OP_1`..`OP_16`, in which case it costs that key count.
    pub fn sig_op_count(&self, accurate: bool) -> usize {
        let mut count = 0;
        let mut last = OP_INVALIDOPCODE;
        for chunk in &self.chunks {
            let op = chunk.opcode();
            match op {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    count += match last.small_int() {
                        Some(keys @ 1..=16) if accurate => keys as usize,
                        _ => 20,
                    };
                }
                _ => {}
            }
            last = op;
        }
        count
    }

    /// Drops empty placeholder pushes after the leading dummy. Returns the count.
    pub fn strip_placeholders(&mut self) -> usize {
        if !self.starts_with_dummy() {
            return 0;
        }
        let before = self.chunks.len();
        let mut index = 0usize;
        self.chunks.retain(|chunk| {
            index += 1;
            index == 1 || chunk.push_data() != Some(&[][..])
        });
        before - self.chunks.len()
    }
}

fn parse_into(bytes: &[u8], chunks: &mut Vec<Chunk>) -> Result<(), ParseError> {
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos;
        let opcode = Opcode::from_u8(bytes[pos]);
        pos += 1;
        if !opcode.is_push() {
            chunks.push(Chunk::Op(opcode));
            continue;
        }

        let width = match opcode {
            OP_PUSHDATA1 => 1,
            OP_PUSHDATA2 => 2,
            OP_PUSHDATA4 => 4,
            _ => 0,
        };
        let len = if width == 0 {
            opcode.to_u8() as usize
        } else {
            let raw = read_slice(bytes, &mut pos, width, offset)?;
            raw.iter()
                .rev()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize)
        };
        let data = read_slice(bytes, &mut pos, len, offset)?.to_vec();
        chunks.push(Chunk::Push(PushData { opcode, data }));
    }

    Ok(())
}

fn read_slice<'a>(
    bytes: &'a [u8],
    pos: &mut usize,
    len: usize,
    offset: usize,
) -> Result<&'a [u8], ParseError> {
    let available = bytes.len() - *pos;
    if len > available {
        return Err(ParseError::TruncatedPush {
            offset,
            needed: len,
            available,
        });
    }
    let slice = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

impl From<Vec<Chunk>> for Script {
    fn from(chunks: Vec<Chunk>) -> Self {
        Script { chunks }
    }
}

impl FromIterator<Chunk> for Script {
    fn from_iter<I: IntoIterator<Item = Chunk>>(iter: I) -> Self {
        Script {
            chunks: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{chunk}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({self})")
    }
}

impl FromStr for Script {
    type Err = ParseError;

    /// Parses the form produced by `Display`: `OP_0`, `<len> 0x<hex>`,
    /// `OP_PUSHDATAn <len> [0x<hex>]`, mnemonics, and `0x<hex>` raw bytes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = Vec::new();
        let mut tokens = s.split_whitespace();

        while let Some(token) = tokens.next() {
            if let Some(hex) = token.strip_prefix("0x") {
                out.extend_from_slice(&decode_hex(hex)?);
                continue;
            }

            if let Ok(len) = token.parse::<usize>() {
                match len {
                    0 => out.push(OP_0.to_u8()),
                    1..=75 => {
                        let data = expect_data(&mut tokens, len)?;
                        PushData::with_opcode(Opcode::from_u8(len as u8), data)?
                            .write_to(&mut out);
                    }
                    _ => return Err(ParseError::InvalidLength(String::from(token))),
                }
                continue;
            }

            let op = Opcode::from_name(token)
                .ok_or_else(|| ParseError::UnknownOpcode(String::from(token)))?;
            match op {
                OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4 => {
                    let len_token = tokens
                        .next()
                        .ok_or_else(|| ParseError::MissingLength(String::from(token)))?;
                    let len = len_token
                        .parse::<usize>()
                        .map_err(|_| ParseError::InvalidLength(String::from(len_token)))?;
                    let data = if len == 0 {
                        Vec::new()
                    } else {
                        expect_data(&mut tokens, len)?
                    };
                    PushData::with_opcode(op, data)?.write_to(&mut out);
                }
                _ => out.push(op.to_u8()),
            }
        }

        Script::from_bytes(&out)
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, ParseError> {
    Vec::<u8>::from_hex(hex).map_err(|_| ParseError::InvalidHex(format!("0x{hex}")))
}

fn expect_data<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    declared: usize,
) -> Result<Vec<u8>, ParseError> {
    let data = match tokens.next().and_then(|t| t.strip_prefix("0x")) {
        Some(hex) => decode_hex(hex)?,
        None => vec![],
    };
    if data.len() != declared {
        return Err(ParseError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }
    Ok(data)
}
