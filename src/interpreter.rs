//! Script interpreter.

use alloc::vec::Vec;

use bitcoin::hashes::{hash160, ripemd160, sha1, sha256, sha256d, Hash};
use log::{debug, trace};

use crate::{
    flags::ScriptFlags,
    num::{cast_to_bool, encode_num, ScriptNum, MAX_LOCKTIME_NUM_SIZE, MAX_NUM_SIZE},
    opcode::{all::*, Opcode, OpcodeClass},
    script::{Chunk, Script},
    signature::{
        check_pubkey_encoding, check_signature_encoding, SignatureChecker,
        SEQUENCE_LOCKTIME_DISABLE_FLAG,
    },
    VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
    VERIFY_MINIMALDATA, VERIFY_NULLDUMMY, VERIFY_P2SH, VERIFY_SIGPUSHONLY,
};

const LOG_TARGET: &str = "txscript::interpreter";

pub const MAX_STACK_SIZE: usize = 1000;
pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Reason a script failed, one variant per consensus failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ScriptError {
    #[error("unknown error")]
    Unknown,
    #[error("script evaluated without error but finished with a false/empty top stack element")]
    EvalFalse,
    #[error("OP_RETURN was encountered")]
    OpReturn,
    #[error("script is too big")]
    ScriptSize,
    #[error("push value size limit exceeded")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("signature count negative or greater than pubkey count")]
    SigCount,
    #[error("pubkey count negative or limit exceeded")]
    PubkeyCount,
    #[error("script failed an OP_VERIFY operation")]
    Verify,
    #[error("script failed an OP_EQUALVERIFY operation")]
    EqualVerify,
    #[error("script failed an OP_CHECKSIGVERIFY operation")]
    CheckSigVerify,
    #[error("script failed an OP_CHECKMULTISIGVERIFY operation")]
    CheckMultiSigVerify,
    #[error("script failed an OP_NUMEQUALVERIFY operation")]
    NumEqualVerify,
    #[error("opcode missing or not understood")]
    BadOpcode,
    #[error("attempted to use a disabled opcode")]
    DisabledOpcode,
    #[error("operation not valid with the current stack size")]
    InvalidStackOperation,
    #[error("operation not valid with the current altstack size")]
    InvalidAltstackOperation,
    #[error("invalid OP_IF construction")]
    UnbalancedConditional,
    #[error("negative locktime")]
    NegativeLockTime,
    #[error("locktime requirement not satisfied")]
    UnsatisfiedLockTime,
    #[error("signature hash type missing or not understood")]
    SigHashType,
    #[error("non-canonical DER signature")]
    SigDer,
    #[error("data push larger than necessary")]
    MinimalData,
    #[error("only push operators allowed in signatures")]
    SigPushOnly,
    #[error("non-canonical signature: S value is unnecessarily high")]
    SigHighS,
    #[error("dummy CHECKMULTISIG argument must be zero")]
    SigNullDummy,
    #[error("public key is neither compressed or uncompressed")]
    PubkeyType,
    #[error("NOPx reserved for soft-fork upgrades")]
    DiscourageUpgradableNops,
}

/// Coarse grouping of [`ScriptError`]s.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The script itself is unusable: bad or disabled opcodes, oversized script.
    Malformed,
    /// A resource limit was hit.
    ExecutionBound,
    /// Underflow or unbalanced conditionals.
    StackDiscipline,
    /// The script ran and said no.
    Semantic,
    /// A flag-gated encoding rule was broken.
    EncodingPolicy,
}

impl ScriptError {
    /// Identifier used by Bitcoin Core and its test fixtures.
    pub fn code(self) -> &'static str {
        use ScriptError::*;

        match self {
            Unknown => "UNKNOWN_ERROR",
            EvalFalse => "EVAL_FALSE",
            OpReturn => "OP_RETURN",
            ScriptSize => "SCRIPT_SIZE",
            PushSize => "PUSH_SIZE",
            OpCount => "OP_COUNT",
            StackSize => "STACK_SIZE",
            SigCount => "SIG_COUNT",
            PubkeyCount => "PUBKEY_COUNT",
            Verify => "VERIFY",
            EqualVerify => "EQUALVERIFY",
            CheckSigVerify => "CHECKSIGVERIFY",
            CheckMultiSigVerify => "CHECKMULTISIGVERIFY",
            NumEqualVerify => "NUMEQUALVERIFY",
            BadOpcode => "BAD_OPCODE",
            DisabledOpcode => "DISABLED_OPCODE",
            InvalidStackOperation => "INVALID_STACK_OPERATION",
            InvalidAltstackOperation => "INVALID_ALTSTACK_OPERATION",
            UnbalancedConditional => "UNBALANCED_CONDITIONAL",
            NegativeLockTime => "NEGATIVE_LOCKTIME",
            UnsatisfiedLockTime => "UNSATISFIED_LOCKTIME",
            SigHashType => "SIG_HASHTYPE",
            SigDer => "SIG_DER",
            MinimalData => "MINIMALDATA",
            SigPushOnly => "SIG_PUSHONLY",
            SigHighS => "SIG_HIGH_S",
            SigNullDummy => "SIG_NULLDUMMY",
            PubkeyType => "PUBKEYTYPE",
            DiscourageUpgradableNops => "DISCOURAGE_UPGRADABLE_NOPS",
        }
    }

    pub fn category(self) -> ErrorCategory {
        use ScriptError::*;

        match self {
            BadOpcode | DisabledOpcode | ScriptSize => ErrorCategory::Malformed,
            OpCount | StackSize | PushSize | SigCount | PubkeyCount => {
                ErrorCategory::ExecutionBound
            }
            InvalidStackOperation | InvalidAltstackOperation | UnbalancedConditional => {
                ErrorCategory::StackDiscipline
            }
            Unknown | EvalFalse | OpReturn | Verify | EqualVerify | CheckSigVerify
            | CheckMultiSigVerify | NumEqualVerify | NegativeLockTime | UnsatisfiedLockTime => {
                ErrorCategory::Semantic
            }
            SigHashType | SigDer | MinimalData | SigPushOnly | SigHighS | SigNullDummy
            | PubkeyType | DiscourageUpgradableNops => ErrorCategory::EncodingPolicy,
        }
    }
}

/// Minimal stack abstraction used by the interpreter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScriptStack {
    items: Vec<Vec<u8>>,
}

impl ScriptStack {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_items(items: Vec<Vec<u8>>) -> Result<Self, ScriptError> {
        if items.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        if items.iter().any(|item| item.len() > MAX_SCRIPT_ELEMENT_SIZE) {
            return Err(ScriptError::PushSize);
        }
        Ok(Self { items })
    }

    pub fn push(&mut self, data: Vec<u8>) {
        self.items.push(data);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push(if value { alloc::vec![1] } else { Vec::new() });
    }

    pub fn push_num(&mut self, value: i64) {
        self.push(encode_num(value));
    }

    pub fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.items.pop().ok_or(ScriptError::InvalidStackOperation)
    }

    /// Element `depth` places below the top; `top(0)` is the last pushed.
    pub fn top(&self, depth: usize) -> Result<&Vec<u8>, ScriptError> {
        self.items
            .len()
            .checked_sub(depth + 1)
            .map(|index| &self.items[index])
            .ok_or(ScriptError::InvalidStackOperation)
    }

    pub fn last(&self) -> Option<&Vec<u8>> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Vec<u8>] {
        &self.items
    }

    fn require(&self, count: usize) -> Result<(), ScriptError> {
        if self.items.len() < count {
            Err(ScriptError::InvalidStackOperation)
        } else {
            Ok(())
        }
    }

    fn remove(&mut self, depth: usize) -> Result<Vec<u8>, ScriptError> {
        self.require(depth + 1)?;
        let index = self.items.len() - 1 - depth;
        Ok(self.items.remove(index))
    }

    fn top_bool(&self) -> bool {
        self.items.last().is_some_and(|top| cast_to_bool(top))
    }
}

/// Evaluates `script` on `stack`.
pub fn eval_script(
    stack: &mut ScriptStack,
    script: &Script,
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if script.serialized_len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    Machine::new(script, stack, flags, checker).run(false)
}

/// Evaluates serialized script bytes. A truncated push is reported as
/// `BadOpcode` once the chunks before it have executed.
fn eval_bytes(
    stack: &mut ScriptStack,
    bytes: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if bytes.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let (script, error) = Script::parse_prefix(bytes);
    Machine::new(&script, stack, flags, checker).run(error.is_some())
}

fn is_push_only(bytes: &[u8]) -> bool {
    Script::from_bytes(bytes).is_ok_and(|script| script.is_push_only())
}

/// Byte-exact `OP_HASH160 <20 bytes> OP_EQUAL`.
fn is_p2sh(bytes: &[u8]) -> bool {
    bytes.len() == 23
        && bytes[0] == OP_HASH160.to_u8()
        && bytes[1] == 0x14
        && bytes[22] == OP_EQUAL.to_u8()
}

/// Execution state for one script.
struct Machine<'a> {
    script: &'a Script,
    stack: &'a mut ScriptStack,
    altstack: Vec<Vec<u8>>,
    exec: Vec<bool>,
    op_count: usize,
    begin_code_hash: usize,
    flags: ScriptFlags,
    checker: &'a dyn SignatureChecker,
}

impl<'a> Machine<'a> {
    fn new(
        script: &'a Script,
        stack: &'a mut ScriptStack,
        flags: ScriptFlags,
        checker: &'a dyn SignatureChecker,
    ) -> Self {
        Self {
            script,
            stack,
            altstack: Vec::new(),
            exec: Vec::new(),
            op_count: 0,
            begin_code_hash: 0,
            flags,
            checker,
        }
    }

    fn run(mut self, truncated: bool) -> Result<(), ScriptError> {
        for (pc, chunk) in self.script.chunks().iter().enumerate() {
            self.step(pc, chunk)?;
        }
        if truncated {
            return Err(ScriptError::BadOpcode);
        }
        if !self.exec.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn executing(&self) -> bool {
        !self.exec.contains(&false)
    }

    fn require_minimal(&self) -> bool {
        self.flags.contains(VERIFY_MINIMALDATA)
    }

    fn step(&mut self, pc: usize, chunk: &Chunk) -> Result<(), ScriptError> {
        let executing = self.executing();

        match chunk {
            Chunk::Push(push) => {
                if push.data().len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                if executing {
                    if self.require_minimal() && !push.is_minimal() {
                        return Err(ScriptError::MinimalData);
                    }
                    self.stack.push(push.data().to_vec());
                }
            }
            Chunk::Op(op) => {
                let op = *op;
                if op > OP_16 {
                    self.add_ops(1)?;
                }
                if op.is_disabled() {
                    return Err(ScriptError::DisabledOpcode);
                }
                if executing || op.is_conditional() {
                    trace!(
                        target: LOG_TARGET,
                        "pc={pc} op={op} depth={} branch_depth={}",
                        self.stack.len(),
                        self.exec.len()
                    );
                    self.execute(pc, op)?;
                }
            }
        }

        if self.stack.len() + self.altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        Ok(())
    }

    fn add_ops(&mut self, count: usize) -> Result<(), ScriptError> {
        self.op_count += count;
        if self.op_count > MAX_OPS_PER_SCRIPT {
            Err(ScriptError::OpCount)
        } else {
            Ok(())
        }
    }

    fn execute(&mut self, pc: usize, op: Opcode) -> Result<(), ScriptError> {
        match op.class() {
            OpcodeClass::PushNumber(n) => {
                self.stack.push_num(i64::from(n));
                Ok(())
            }
            OpcodeClass::Control => self.control(op),
            OpcodeClass::Stack => self.stack_op(op),
            OpcodeClass::Splice => {
                let size = self.stack.top(0)?.len();
                self.stack.push_num(size as i64);
                Ok(())
            }
            OpcodeClass::Bitwise => self.equal(op),
            OpcodeClass::Arithmetic => self.arithmetic(op),
            OpcodeClass::Crypto => self.crypto(pc, op),
            OpcodeClass::Locktime => self.locktime(op),
            OpcodeClass::UpgradableNop => self.upgradable_nop(),
            OpcodeClass::Disabled => Err(ScriptError::DisabledOpcode),
            OpcodeClass::PushData | OpcodeClass::Reserved | OpcodeClass::Invalid => {
                Err(ScriptError::BadOpcode)
            }
        }
    }

    fn control(&mut self, op: Opcode) -> Result<(), ScriptError> {
        match op {
            OP_NOP => {}
            OP_IF | OP_NOTIF => {
                let mut value = false;
                if self.executing() {
                    let condition = self
                        .stack
                        .pop()
                        .map_err(|_| ScriptError::UnbalancedConditional)?;
                    value = cast_to_bool(&condition);
                    if op == OP_NOTIF {
                        value = !value;
                    }
                }
                self.exec.push(value);
            }
            OP_ELSE => {
                let top = self
                    .exec
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *top = !*top;
            }
            OP_ENDIF => {
                self.exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
            }
            OP_VERIFY => self.verify_top(ScriptError::Verify)?,
            OP_RETURN => return Err(ScriptError::OpReturn),
            _ => return Err(ScriptError::BadOpcode),
        }
        Ok(())
    }

    /// Pops a true top element, or fails with `error`.
    fn verify_top(&mut self, error: ScriptError) -> Result<(), ScriptError> {
        if !cast_to_bool(self.stack.top(0)?) {
            return Err(error);
        }
        self.stack.pop()?;
        Ok(())
    }

    fn stack_op(&mut self, op: Opcode) -> Result<(), ScriptError> {
        let stack = &mut *self.stack;
        match op {
            OP_TOALTSTACK => {
                let value = stack.pop()?;
                self.altstack.push(value);
            }
            OP_FROMALTSTACK => {
                let value = self
                    .altstack
                    .pop()
                    .ok_or(ScriptError::InvalidAltstackOperation)?;
                stack.push(value);
            }
            OP_2DROP => {
                stack.require(2)?;
                stack.pop()?;
                stack.pop()?;
            }
            OP_2DUP => {
                stack.require(2)?;
                let first = stack.top(1)?.clone();
                let second = stack.top(0)?.clone();
                stack.push(first);
                stack.push(second);
            }
            OP_3DUP => {
                stack.require(3)?;
                for _ in 0..3 {
                    let value = stack.top(2)?.clone();
                    stack.push(value);
                }
            }
            OP_2OVER => {
                stack.require(4)?;
                for _ in 0..2 {
                    let value = stack.top(3)?.clone();
                    stack.push(value);
                }
            }
            OP_2ROT => {
                stack.require(6)?;
                let first = stack.remove(5)?;
                let second = stack.remove(4)?;
                stack.push(first);
                stack.push(second);
            }
            OP_2SWAP => {
                stack.require(4)?;
                let len = stack.items.len();
                stack.items.swap(len - 4, len - 2);
                stack.items.swap(len - 3, len - 1);
            }
            OP_IFDUP => {
                let value = stack.top(0)?;
                if cast_to_bool(value) {
                    let value = value.clone();
                    stack.push(value);
                }
            }
            OP_DEPTH => {
                let depth = stack.len() as i64;
                stack.push_num(depth);
            }
            OP_DROP => {
                stack.pop()?;
            }
            OP_DUP => {
                let value = stack.top(0)?.clone();
                stack.push(value);
            }
            OP_NIP => {
                stack.remove(1)?;
            }
            OP_OVER => {
                let value = stack.top(1)?.clone();
                stack.push(value);
            }
            OP_PICK | OP_ROLL => {
                stack.require(2)?;
                let depth = decode_num(stack.top(0)?, self.flags, MAX_NUM_SIZE)?;
                stack.pop()?;
                if depth < 0 || depth as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let depth = depth as usize;
                let value = if op == OP_ROLL {
                    stack.remove(depth)?
                } else {
                    stack.top(depth)?.clone()
                };
                stack.push(value);
            }
            OP_ROT => {
                stack.require(3)?;
                let value = stack.remove(2)?;
                stack.push(value);
            }
            OP_SWAP => {
                stack.require(2)?;
                let len = stack.items.len();
                stack.items.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                stack.require(2)?;
                let value = stack.top(0)?.clone();
                let index = stack.items.len() - 2;
                stack.items.insert(index, value);
            }
            _ => return Err(ScriptError::BadOpcode),
        }
        Ok(())
    }

    fn equal(&mut self, op: Opcode) -> Result<(), ScriptError> {
        self.stack.require(2)?;
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push_bool(a == b);
        if op == OP_EQUALVERIFY {
            self.verify_top(ScriptError::EqualVerify)?;
        }
        Ok(())
    }

    fn arithmetic(&mut self, op: Opcode) -> Result<(), ScriptError> {
        match op {
            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let n = decode_num(self.stack.top(0)?, self.flags, MAX_NUM_SIZE)?;
                let result = match op {
                    OP_1ADD => n + 1,
                    OP_1SUB => n - 1,
                    OP_NEGATE => -n,
                    OP_ABS => n.abs(),
                    OP_NOT => i64::from(n == 0),
                    _ => i64::from(n != 0),
                };
                self.stack.pop()?;
                self.stack.push_num(result);
            }
            OP_WITHIN => {
                self.stack.require(3)?;
                let value = decode_num(self.stack.top(2)?, self.flags, MAX_NUM_SIZE)?;
                let min = decode_num(self.stack.top(1)?, self.flags, MAX_NUM_SIZE)?;
                let max = decode_num(self.stack.top(0)?, self.flags, MAX_NUM_SIZE)?;
                for _ in 0..3 {
                    self.stack.pop()?;
                }
                self.stack.push_bool(min <= value && value < max);
            }
            _ => {
                self.stack.require(2)?;
                let a = decode_num(self.stack.top(1)?, self.flags, MAX_NUM_SIZE)?;
                let b = decode_num(self.stack.top(0)?, self.flags, MAX_NUM_SIZE)?;
                let result = match op {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_BOOLAND => i64::from(a != 0 && b != 0),
                    OP_BOOLOR => i64::from(a != 0 || b != 0),
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(a == b),
                    OP_NUMNOTEQUAL => i64::from(a != b),
                    OP_LESSTHAN => i64::from(a < b),
                    OP_GREATERTHAN => i64::from(a > b),
                    OP_LESSTHANOREQUAL => i64::from(a <= b),
                    OP_GREATERTHANOREQUAL => i64::from(a >= b),
                    OP_MIN => a.min(b),
                    OP_MAX => a.max(b),
                    _ => return Err(ScriptError::BadOpcode),
                };
                self.stack.pop()?;
                self.stack.pop()?;
                self.stack.push_num(result);
                if op == OP_NUMEQUALVERIFY {
                    self.verify_top(ScriptError::NumEqualVerify)?;
                }
            }
        }
        Ok(())
    }

    fn crypto(&mut self, pc: usize, op: Opcode) -> Result<(), ScriptError> {
        match op {
            OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                let data = self.stack.pop()?;
                let digest = match op {
                    OP_RIPEMD160 => ripemd160::Hash::hash(&data).to_byte_array().to_vec(),
                    OP_SHA1 => sha1::Hash::hash(&data).to_byte_array().to_vec(),
                    OP_SHA256 => sha256::Hash::hash(&data).to_byte_array().to_vec(),
                    OP_HASH160 => hash160::Hash::hash(&data).to_byte_array().to_vec(),
                    _ => sha256d::Hash::hash(&data).to_byte_array().to_vec(),
                };
                self.stack.push(digest);
            }
            OP_CODESEPARATOR => self.begin_code_hash = pc + 1,
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                self.check_sig()?;
                if op == OP_CHECKSIGVERIFY {
                    self.verify_top(ScriptError::CheckSigVerify)?;
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                self.check_multisig()?;
                if op == OP_CHECKMULTISIGVERIFY {
                    self.verify_top(ScriptError::CheckMultiSigVerify)?;
                }
            }
            _ => return Err(ScriptError::BadOpcode),
        }
        Ok(())
    }

    /// Code from the last executed `OP_CODESEPARATOR` to the end of the script.
    fn script_code(&self) -> Script {
        let chunks = self.script.chunks();
        Script::from_chunks(chunks[self.begin_code_hash.min(chunks.len())..].to_vec())
    }

    fn check_sig(&mut self) -> Result<(), ScriptError> {
        self.stack.require(2)?;
        let signature = self.stack.top(1)?;
        let pubkey = self.stack.top(0)?;

        let mut script_code = self.script_code();
        script_code.find_and_delete(&Chunk::push(signature.as_slice()));

        check_signature_encoding(signature, self.flags)?;
        check_pubkey_encoding(pubkey, self.flags)?;
        let success = self.checker.check_sig(signature, pubkey, &script_code);

        self.stack.pop()?;
        self.stack.pop()?;
        self.stack.push_bool(success);
        Ok(())
    }

    fn check_multisig(&mut self) -> Result<(), ScriptError> {
        // Depths are counted from the top: n, its keys, m, its signatures, dummy.
        let mut depth = 0usize;
        self.stack.require(depth + 1)?;
        let key_count = decode_num(self.stack.top(depth)?, self.flags, MAX_NUM_SIZE)?;
        if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
            return Err(ScriptError::PubkeyCount);
        }
        let mut keys_left = key_count as usize;
        self.add_ops(keys_left)?;

        depth += 1;
        let mut key_depth = depth;
        depth += keys_left;
        self.stack.require(depth + 1)?;
        let sig_count = decode_num(self.stack.top(depth)?, self.flags, MAX_NUM_SIZE)?;
        if sig_count < 0 || sig_count > key_count {
            return Err(ScriptError::SigCount);
        }
        let mut sigs_left = sig_count as usize;

        depth += 1;
        let mut sig_depth = depth;
        depth += sigs_left;
        self.stack.require(depth + 1)?;

        let mut script_code = self.script_code();
        for k in 0..sigs_left {
            let signature = self.stack.top(sig_depth + k)?;
            script_code.find_and_delete(&Chunk::push(signature.as_slice()));
        }

        let mut success = true;
        while success && sigs_left > 0 {
            let signature = self.stack.top(sig_depth)?;
            let pubkey = self.stack.top(key_depth)?;
            check_signature_encoding(signature, self.flags)?;
            check_pubkey_encoding(pubkey, self.flags)?;

            if self.checker.check_sig(signature, pubkey, &script_code) {
                sig_depth += 1;
                sigs_left -= 1;
            }
            key_depth += 1;
            keys_left -= 1;

            // More signatures left than keys means some signature cannot match.
            if sigs_left > keys_left {
                success = false;
            }
        }

        for _ in 0..depth {
            self.stack.pop()?;
        }

        let dummy = self.stack.pop()?;
        if self.flags.contains(VERIFY_NULLDUMMY) && !dummy.is_empty() {
            return Err(ScriptError::SigNullDummy);
        }

        self.stack.push_bool(success);
        Ok(())
    }

    fn locktime(&mut self, op: Opcode) -> Result<(), ScriptError> {
        let flag = if op == OP_CHECKLOCKTIMEVERIFY {
            VERIFY_CHECKLOCKTIMEVERIFY
        } else {
            VERIFY_CHECKSEQUENCEVERIFY
        };
        if !self.flags.contains(flag) {
            return self.upgradable_nop();
        }

        let value = decode_num(self.stack.top(0)?, self.flags, MAX_LOCKTIME_NUM_SIZE)?;
        if value < 0 {
            return Err(ScriptError::NegativeLockTime);
        }

        let satisfied = if op == OP_CHECKLOCKTIMEVERIFY {
            self.checker.check_lock_time(value)
        } else if value & i64::from(SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            true
        } else {
            self.checker.check_sequence(value)
        };
        if !satisfied {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }

    fn upgradable_nop(&self) -> Result<(), ScriptError> {
        if self.flags.contains(VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
            return Err(ScriptError::DiscourageUpgradableNops);
        }
        Ok(())
    }
}

/// Numeric operand decode; any failure is reported as `Unknown`.
fn decode_num(bytes: &[u8], flags: ScriptFlags, max_len: usize) -> Result<i64, ScriptError> {
    ScriptNum::decode(bytes, flags.contains(VERIFY_MINIMALDATA), max_len)
        .map(ScriptNum::value)
        .map_err(|_| ScriptError::Unknown)
}

/// High-level script verification context.
///
/// Holds the flags and checker for a run of verifications and remembers the
/// error of the last one. Each call evaluates on fresh stacks.
pub struct Interpreter<'a> {
    flags: ScriptFlags,
    checker: &'a dyn SignatureChecker,
    last_error: Option<ScriptError>,
}

impl<'a> Interpreter<'a> {
    pub fn new(flags: ScriptFlags, checker: &'a dyn SignatureChecker) -> Self {
        Self {
            flags,
            checker,
            last_error: None,
        }
    }

    pub fn flags(&self) -> ScriptFlags {
        self.flags
    }

    /// Verifies a spend given the serialized scriptSig and scriptPubKey.
    pub fn verify(&mut self, script_sig: &[u8], script_pubkey: &[u8]) -> Result<(), ScriptError> {
        let result = self.verify_inner(script_sig, script_pubkey);
        self.last_error = result.err();
        if let Err(err) = result {
            debug!(target: LOG_TARGET, "script verification failed: {}", err.code());
        }
        result
    }

    pub fn verify_script(
        &mut self,
        script_sig: &Script,
        script_pubkey: &Script,
    ) -> Result<(), ScriptError> {
        self.verify(&script_sig.to_bytes(), &script_pubkey.to_bytes())
    }

    /// Evaluates one script on a caller-supplied stack.
    pub fn eval(&mut self, stack: &mut ScriptStack, script: &Script) -> Result<(), ScriptError> {
        let result = eval_script(stack, script, self.flags, self.checker);
        self.last_error = result.err();
        result
    }

    #[inline]
    pub fn last_script_error(&self) -> Option<ScriptError> {
        self.last_error
    }

    /// Reason string of the last failure, empty after a success.
    pub fn errstr(&self) -> &'static str {
        self.last_error.map_or("", ScriptError::code)
    }

    fn verify_inner(&self, script_sig: &[u8], script_pubkey: &[u8]) -> Result<(), ScriptError> {
        if self.flags.contains(VERIFY_SIGPUSHONLY) && !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }

        let mut stack = ScriptStack::new();
        eval_bytes(&mut stack, script_sig, self.flags, self.checker)?;
        let p2sh_stack = (self.flags.contains(VERIFY_P2SH) && is_p2sh(script_pubkey))
            .then(|| stack.clone());

        eval_bytes(&mut stack, script_pubkey, self.flags, self.checker)?;
        if !stack.top_bool() {
            return Err(ScriptError::EvalFalse);
        }

        if let Some(mut stack) = p2sh_stack {
            if !is_push_only(script_sig) {
                return Err(ScriptError::SigPushOnly);
            }
            let redeem_script = stack.pop()?;
            trace!(target: LOG_TARGET, "evaluating {} byte redeem script", redeem_script.len());
            eval_bytes(&mut stack, &redeem_script, self.flags, self.checker)?;
            if !stack.top_bool() {
                return Err(ScriptError::EvalFalse);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signature::NullChecker, VERIFY_DERSIG, VERIFY_LOW_S, VERIFY_NONE, VERIFY_STRICTENC,
    };

    /// Checker that accepts any non-empty signature and every lock time.
    struct Permissive;

    impl SignatureChecker for Permissive {
        fn check_sig(&self, signature: &[u8], _pubkey: &[u8], _script_code: &Script) -> bool {
            !signature.is_empty()
        }

        fn check_lock_time(&self, _lock_time: i64) -> bool {
            true
        }

        fn check_sequence(&self, _sequence: i64) -> bool {
            true
        }
    }

    fn flags(bits: u32) -> ScriptFlags {
        ScriptFlags::from_bits(bits).unwrap()
    }

    fn asm(s: &str) -> Script {
        s.parse().expect("valid asm")
    }

    fn run(script: &Script, bits: u32) -> Result<ScriptStack, ScriptError> {
        let mut stack = ScriptStack::new();
        eval_script(&mut stack, script, flags(bits), &NullChecker)?;
        Ok(stack)
    }

    fn verify(sig: &Script, pubkey: &Script, bits: u32) -> Result<(), ScriptError> {
        Interpreter::new(flags(bits), &NullChecker).verify_script(sig, pubkey)
    }

    #[test]
    fn error_codes_and_categories() {
        assert_eq!(ScriptError::OpCount.code(), "OP_COUNT");
        assert_eq!(ScriptError::Unknown.code(), "UNKNOWN_ERROR");
        assert_eq!(ScriptError::OpCount.category(), ErrorCategory::ExecutionBound);
        assert_eq!(ScriptError::DisabledOpcode.category(), ErrorCategory::Malformed);
        assert_eq!(
            ScriptError::UnbalancedConditional.category(),
            ErrorCategory::StackDiscipline
        );
        assert_eq!(ScriptError::SigNullDummy.category(), ErrorCategory::EncodingPolicy);
        assert_eq!(ScriptError::EqualVerify.category(), ErrorCategory::Semantic);
    }

    #[test]
    fn known_vectors() {
        verify(&asm("OP_1 OP_2"), &asm("OP_2 OP_EQUALVERIFY OP_1 OP_EQUAL"), VERIFY_NONE)
            .expect("1 2 / 2 EQUALVERIFY 1 EQUAL");
        verify(
            &asm("OP_0"),
            &asm("OP_IF OP_VER OP_ELSE OP_1 OP_ENDIF"),
            VERIFY_NONE,
        )
        .expect("OP_VER in the untaken branch is never executed");
    }

    #[test]
    fn branches_take_exactly_one_side() {
        let script = asm("OP_IF OP_2 OP_ELSE OP_3 OP_ENDIF");
        let mut stack = ScriptStack::from_items(vec![vec![1]]).unwrap();
        eval_script(&mut stack, &script, ScriptFlags::NONE, &NullChecker).unwrap();
        assert_eq!(stack.items(), &[vec![2]]);

        let mut stack = ScriptStack::from_items(vec![vec![]]).unwrap();
        eval_script(&mut stack, &script, ScriptFlags::NONE, &NullChecker).unwrap();
        assert_eq!(stack.items(), &[vec![3]]);
    }

    #[test]
    fn unbalanced_conditionals_fail() {
        assert_eq!(run(&asm("OP_1 OP_IF OP_1"), 0), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&asm("OP_ENDIF"), 0), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&asm("OP_ELSE"), 0), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&asm("OP_IF"), 0), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn disabled_opcodes_fail_even_unexecuted() {
        assert_eq!(
            run(&asm("OP_0 OP_IF OP_CAT OP_ENDIF"), 0).map(|_| ()),
            Err(ScriptError::DisabledOpcode)
        );
        assert_eq!(
            run(&asm("OP_0 OP_IF OP_VERIF OP_ENDIF"), 0).map(|_| ()),
            Err(ScriptError::BadOpcode)
        );
        run(&asm("OP_0 OP_IF OP_RESERVED 0xba OP_ENDIF"), 0).expect("reserved only fails when run");
        assert_eq!(run(&asm("OP_RESERVED"), 0), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn op_count_limit() {
        let mut ok = Script::new();
        for _ in 0..MAX_OPS_PER_SCRIPT {
            ok = ok.push_opcode(OP_NOP);
        }
        run(&ok, 0).expect("201 ops are allowed");
        assert_eq!(run(&ok.push_opcode(OP_NOP), 0), Err(ScriptError::OpCount));

        // Push opcodes never count, unexecuted ones do.
        let mut script = Script::new().push_opcode(OP_0).push_opcode(OP_IF);
        for _ in 0..MAX_OPS_PER_SCRIPT {
            script = script.push_opcode(OP_NOP).push_opcode(OP_1);
        }
        assert_eq!(
            run(&script.push_opcode(OP_ENDIF), 0),
            Err(ScriptError::OpCount)
        );
    }

    #[test]
    fn multisig_key_count_adds_to_op_count() {
        let mut script = Script::new();
        for _ in 0..190 {
            script = script.push_opcode(OP_NOP);
        }
        let script = script
            .push_opcode(OP_0)
            .push_opcode(OP_0)
            .push_int(20)
            .push_opcode(OP_CHECKMULTISIG);
        let keys = (0..20).map(|_| Vec::new());
        let mut stack = ScriptStack::from_items(keys.collect()).unwrap();
        let err = eval_script(&mut stack, &script, ScriptFlags::NONE, &NullChecker);
        assert_eq!(err, Err(ScriptError::OpCount));
    }

    #[test]
    fn element_and_stack_limits() {
        let at_limit = Script::new().push_slice(&[0x42; MAX_SCRIPT_ELEMENT_SIZE]);
        run(&at_limit, 0).expect("520 byte push");
        let over = Script::new().push_slice(&[0x42; MAX_SCRIPT_ELEMENT_SIZE + 1]);
        assert_eq!(run(&over, 0), Err(ScriptError::PushSize));

        let mut script = Script::new();
        for _ in 0..MAX_STACK_SIZE {
            script = script.push_opcode(OP_1);
        }
        assert_eq!(run(&script, 0).map(|s| s.len()), Ok(MAX_STACK_SIZE));
        assert_eq!(run(&script.push_opcode(OP_1), 0), Err(ScriptError::StackSize));

        // The altstack counts towards the limit.
        let mut stack = ScriptStack::from_items(vec![Vec::new(); MAX_STACK_SIZE - 1]).unwrap();
        let split = asm("OP_1 OP_TOALTSTACK OP_1");
        assert_eq!(
            eval_script(&mut stack, &split, ScriptFlags::NONE, &NullChecker),
            Err(ScriptError::StackSize)
        );
    }

    #[test]
    fn script_size_limit() {
        let script = Script::new().push_slice(&[0; 500]);
        let big: Script = (0..20).flat_map(|_| script.chunks().to_vec()).collect();
        assert!(big.serialized_len() > MAX_SCRIPT_SIZE);
        assert_eq!(run(&big, 0), Err(ScriptError::ScriptSize));
    }

    #[test]
    fn arithmetic_operands_are_four_bytes() {
        run(&asm("4 0xffffff7f OP_DUP OP_ADD 5 0xfeffffff00 OP_EQUAL"), 0)
            .map(|stack| assert!(stack.top_bool()))
            .unwrap();
        assert_eq!(
            run(&asm("5 0xffffffff00 OP_1ADD"), 0),
            Err(ScriptError::Unknown)
        );
        assert_eq!(
            run(&asm("1 0x00 OP_1ADD"), VERIFY_MINIMALDATA),
            Err(ScriptError::Unknown)
        );
    }

    #[test]
    fn stack_shuffles() {
        let stack = run(&asm("OP_1 OP_2 OP_3 OP_ROT"), 0).unwrap();
        assert_eq!(stack.items(), &[vec![2], vec![3], vec![1]]);
        let stack = run(&asm("OP_1 OP_2 OP_3 OP_4 OP_5 OP_6 OP_2ROT"), 0).unwrap();
        assert_eq!(
            stack.items(),
            &[vec![3], vec![4], vec![5], vec![6], vec![1], vec![2]]
        );
        let stack = run(&asm("OP_1 OP_2 OP_TUCK"), 0).unwrap();
        assert_eq!(stack.items(), &[vec![2], vec![1], vec![2]]);
        let stack = run(&asm("OP_1 OP_2 OP_3 OP_2 OP_ROLL"), 0).unwrap();
        assert_eq!(stack.items(), &[vec![2], vec![3], vec![1]]);
        assert_eq!(
            run(&asm("OP_1 OP_1 OP_PICK"), 0),
            Err(ScriptError::InvalidStackOperation)
        );
        assert_eq!(
            run(&asm("OP_FROMALTSTACK"), 0),
            Err(ScriptError::InvalidAltstackOperation)
        );
    }

    #[test]
    fn minimal_data_rejects_wide_pushes() {
        let script = asm("1 0x05");
        run(&script, 0).expect("non-minimal push is fine without the flag");
        assert_eq!(run(&script, VERIFY_MINIMALDATA), Err(ScriptError::MinimalData));
        run(&asm("OP_0 OP_IF 1 0x05 OP_ENDIF"), VERIFY_MINIMALDATA)
            .expect("unexecuted pushes are not checked");
    }

    #[test]
    fn checksig_encoding_failures_are_fatal() {
        let der_stub = "9 0x300602010102010101";
        let key = "33 0x0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
        let script = asm(&format!("{der_stub} {key} OP_CHECKSIG OP_NOT"));
        run(&script, VERIFY_STRICTENC | VERIFY_DERSIG).expect("well formed but wrong signature");

        let bad_key = asm(&format!("{der_stub} 1 0x05 OP_CHECKSIG"));
        assert_eq!(run(&bad_key, VERIFY_STRICTENC), Err(ScriptError::PubkeyType));
        run(&asm(&format!("{der_stub} 1 0x05 OP_CHECKSIG OP_NOT")), VERIFY_NONE).unwrap();

        let bad_der = asm(&format!("1 0x30 {key} OP_CHECKSIG"));
        assert_eq!(run(&bad_der, VERIFY_LOW_S), Err(ScriptError::SigDer));
    }

    #[test]
    fn checksig_removes_signature_from_script_code() {
        struct Recording(core::cell::RefCell<Vec<Script>>);

        impl SignatureChecker for Recording {
            fn check_sig(&self, _sig: &[u8], _key: &[u8], script_code: &Script) -> bool {
                self.0.borrow_mut().push(script_code.clone());
                true
            }
        }

        let checker = Recording(core::cell::RefCell::new(Vec::new()));
        let script = asm("2 0xaabb OP_DROP OP_CODESEPARATOR OP_CHECKSIG 2 0xaabb OP_DROP");
        let mut stack = ScriptStack::from_items(vec![vec![0xaa, 0xbb], vec![0x02; 33]]).unwrap();
        eval_script(&mut stack, &script, ScriptFlags::NONE, &checker).unwrap();
        assert_eq!(stack.items(), &[vec![1]]);

        let seen = checker.0.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].to_string(), "OP_CHECKSIG OP_DROP");
    }

    #[test]
    fn multisig_consumes_dummy() {
        let script = asm("OP_0 OP_0 OP_0 OP_CHECKMULTISIG");
        let stack = run(&script, VERIFY_NULLDUMMY).unwrap();
        assert_eq!(stack.items(), &[vec![1]]);

        assert_eq!(
            run(&asm("OP_0 OP_0 OP_CHECKMULTISIG"), 0),
            Err(ScriptError::InvalidStackOperation)
        );
        assert_eq!(
            run(&asm("OP_1 OP_0 OP_0 OP_CHECKMULTISIG"), VERIFY_NULLDUMMY),
            Err(ScriptError::SigNullDummy)
        );
        assert_eq!(
            run(&asm("OP_0 OP_0 1 0x15 OP_CHECKMULTISIG"), 0),
            Err(ScriptError::PubkeyCount)
        );
        assert_eq!(
            run(&asm("OP_0 OP_2 OP_0 OP_1 OP_CHECKMULTISIG"), 0),
            Err(ScriptError::SigCount)
        );
    }

    #[test]
    fn multisig_signatures_match_keys_in_order() {
        // Accepts a signature only for the key whose first byte matches it.
        struct Pairing;

        impl SignatureChecker for Pairing {
            fn check_sig(&self, sig: &[u8], key: &[u8], _script_code: &Script) -> bool {
                sig.first() == key.first()
            }
        }

        let check = |sigs: &str| {
            let script = asm(&format!(
                "OP_0 {sigs} OP_2 1 0x0a 1 0x0b 1 0x0c OP_3 OP_CHECKMULTISIG"
            ));
            let mut stack = ScriptStack::new();
            eval_script(&mut stack, &script, ScriptFlags::NONE, &Pairing).unwrap();
            stack.top_bool()
        };

        assert!(check("1 0x0a 1 0x0c"));
        assert!(!check("1 0x0c 1 0x0a"));
        assert!(check("1 0x0b 1 0x0c"));
    }

    #[test]
    fn locktime_opcodes() {
        let permissive = |script: &str, bits: u32| {
            let mut stack = ScriptStack::new();
            eval_script(&mut stack, &asm(script), flags(bits), &Permissive)
        };

        permissive("OP_1 OP_CHECKLOCKTIMEVERIFY", VERIFY_CHECKLOCKTIMEVERIFY).unwrap();
        assert_eq!(
            permissive("OP_1NEGATE OP_CHECKLOCKTIMEVERIFY", VERIFY_CHECKLOCKTIMEVERIFY),
            Err(ScriptError::NegativeLockTime)
        );
        assert_eq!(
            permissive("OP_CHECKLOCKTIMEVERIFY", VERIFY_CHECKLOCKTIMEVERIFY),
            Err(ScriptError::InvalidStackOperation)
        );
        permissive("OP_CHECKLOCKTIMEVERIFY", VERIFY_NONE).expect("NOP2 without the flag");
        assert_eq!(
            permissive("OP_CHECKSEQUENCEVERIFY", VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
            Err(ScriptError::DiscourageUpgradableNops)
        );

        let mut stack = ScriptStack::new();
        let null = eval_script(
            &mut stack,
            &asm("OP_1 OP_CHECKSEQUENCEVERIFY"),
            flags(VERIFY_CHECKSEQUENCEVERIFY),
            &NullChecker,
        );
        assert_eq!(null, Err(ScriptError::UnsatisfiedLockTime));

        let mut stack = ScriptStack::new();
        eval_script(
            &mut stack,
            &asm("5 0x0000008000 OP_CHECKSEQUENCEVERIFY"),
            flags(VERIFY_CHECKSEQUENCEVERIFY),
            &NullChecker,
        )
        .expect("disable bit turns CSV into a NOP");
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn upgradable_nops() {
        run(&asm("OP_NOP1 OP_NOP10 OP_1"), 0).unwrap();
        assert_eq!(
            run(&asm("OP_NOP5"), VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
            Err(ScriptError::DiscourageUpgradableNops)
        );
        run(
            &asm("OP_0 OP_IF OP_NOP5 OP_ENDIF"),
            VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
        )
        .expect("unexecuted NOPs are not discouraged");
    }

    #[test]
    fn p2sh_orchestration() {
        let redeem = asm("OP_1");
        let pubkey = redeem.to_p2sh();
        let sig = Script::new().push_slice(&redeem.to_bytes());
        verify(&sig, &pubkey, VERIFY_P2SH).expect("trivial redeem script");

        let failing = asm("OP_0");
        let sig = Script::new().push_slice(&failing.to_bytes());
        assert_eq!(
            verify(&sig, &failing.to_p2sh(), VERIFY_P2SH),
            Err(ScriptError::EvalFalse)
        );
        verify(&sig, &failing.to_p2sh(), VERIFY_NONE).expect("hash match alone without P2SH");

        let sig = Script::new()
            .push_opcode(OP_NOP)
            .push_slice(&redeem.to_bytes());
        assert_eq!(
            verify(&sig, &pubkey, VERIFY_P2SH),
            Err(ScriptError::SigPushOnly)
        );
    }

    #[test]
    fn truncated_scripts_fail_after_their_prefix() {
        let mut interpreter = Interpreter::new(ScriptFlags::NONE, &NullChecker);
        assert_eq!(
            interpreter.verify(&[], &[0x51, 0x4c, 0x05]),
            Err(ScriptError::BadOpcode)
        );
        assert_eq!(interpreter.errstr(), "BAD_OPCODE");
        assert_eq!(
            interpreter.verify(&[], &[0x6a, 0x4c, 0x05]),
            Err(ScriptError::OpReturn)
        );
        interpreter.verify(&[], &[0x51]).unwrap();
        assert_eq!(interpreter.last_script_error(), None);
        assert_eq!(interpreter.errstr(), "");
    }

    #[test]
    fn sigpushonly_flag() {
        let sig = asm("OP_1 OP_NOP");
        let pubkey = asm("OP_1");
        verify(&sig, &pubkey, VERIFY_NONE).unwrap();
        assert_eq!(
            verify(&sig, &pubkey, VERIFY_SIGPUSHONLY),
            Err(ScriptError::SigPushOnly)
        );
    }
}
