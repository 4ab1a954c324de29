//! Script number codec.
//!
//! Numbers are little-endian sign-magnitude byte strings: the high bit of the
//! last byte is the sign, zero is the empty string.

use alloc::vec::Vec;

/// Default operand width for arithmetic opcodes.
pub const MAX_NUM_SIZE: usize = 4;
/// Operand width accepted by the lock-time opcodes.
pub const MAX_LOCKTIME_NUM_SIZE: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NumError {
    #[error("script number is {len} bytes, limit is {max}")]
    Overflow { len: usize, max: usize },
    #[error("script number is not minimally encoded")]
    NonMinimal,
}

/// A decoded script number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ScriptNum(i64);

impl ScriptNum {
    pub const fn new(value: i64) -> Self {
        ScriptNum(value)
    }

    /// Decodes an operand of at most `max_len` bytes.
    ///
    /// With `require_minimal` set, encodings with superfluous trailing zero
    /// bytes (including negative zero) are rejected.
    pub fn decode(bytes: &[u8], require_minimal: bool, max_len: usize) -> Result<Self, NumError> {
        if bytes.len() > max_len {
            return Err(NumError::Overflow {
                len: bytes.len(),
                max: max_len,
            });
        }
        if require_minimal && !is_minimally_encoded(bytes) {
            return Err(NumError::NonMinimal);
        }
        Ok(ScriptNum(decode_num(bytes)))
    }

    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for ScriptNum {
    fn from(value: i64) -> Self {
        ScriptNum(value)
    }
}

/// Minimal encoding of `value`.
pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut result = Vec::with_capacity(9);
    while magnitude > 0 {
        result.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    // The sign lives in the top bit of the last byte; add a byte if it is taken.
    let top = result.len() - 1;
    if result[top] & 0x80 != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        result[top] |= 0x80;
    }
    result
}

/// Lenient decode of up to eight bytes, ignoring minimality.
pub fn decode_num(bytes: &[u8]) -> i64 {
    let Some((&last, _)) = bytes.split_last() else {
        return 0;
    };

    let mut result: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(8) {
        result |= (byte as i64) << (8 * i);
    }

    if last & 0x80 != 0 {
        let shift = 8 * (bytes.len().min(8) - 1);
        -(result & !(0x80i64 << shift))
    } else {
        result
    }
}

/// True unless the buffer carries a redundant most-significant byte.
pub fn is_minimally_encoded(bytes: &[u8]) -> bool {
    match bytes {
        [] => true,
        [.., last] if last & 0x7f != 0 => true,
        // A lone 0x00 or 0x80 should have been the empty string.
        [_] => false,
        [.., prev, _] => prev & 0x80 != 0,
    }
}

/// Truthiness of a stack element: false for any zero and for negative zero.
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    match bytes.split_last() {
        None => false,
        Some((&last, rest)) => rest.iter().any(|&b| b != 0) || (last != 0 && last != 0x80),
    }
}
