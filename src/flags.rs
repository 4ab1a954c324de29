//! Verification flag set.

use alloc::string::String;
use core::{fmt, str::FromStr};

use crate::{
    Error, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_DERSIG,
    VERIFY_DISCOURAGE_UPGRADABLE_NOPS, VERIFY_LOW_S, VERIFY_MINIMALDATA, VERIFY_NONE,
    VERIFY_NULLDUMMY, VERIFY_P2SH, VERIFY_SIGPUSHONLY, VERIFY_STRICTENC,
};

const SUPPORTED_FLAGS: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_SIGPUSHONLY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY;

const NAMES: [(&str, u32); 10] = [
    ("P2SH", VERIFY_P2SH),
    ("STRICTENC", VERIFY_STRICTENC),
    ("DERSIG", VERIFY_DERSIG),
    ("LOW_S", VERIFY_LOW_S),
    ("NULLDUMMY", VERIFY_NULLDUMMY),
    ("SIGPUSHONLY", VERIFY_SIGPUSHONLY),
    ("MINIMALDATA", VERIFY_MINIMALDATA),
    ("DISCOURAGE_UPGRADABLE_NOPS", VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
    ("CHECKLOCKTIMEVERIFY", VERIFY_CHECKLOCKTIMEVERIFY),
    ("CHECKSEQUENCEVERIFY", VERIFY_CHECKSEQUENCEVERIFY),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown verification flag `{0}`")]
pub struct ParseFlagsError(pub String);

/// Wrapper for script verification flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    pub const NONE: ScriptFlags = ScriptFlags(VERIFY_NONE);

    pub fn from_bits(bits: u32) -> Result<Self, Error> {
        if bits & !SUPPORTED_FLAGS != 0 {
            return Err(Error::ERR_INVALID_FLAGS);
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `flag` is set.
    #[inline]
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Any of the three flags that make signature DER strictness mandatory.
    pub(crate) fn requires_strict_der(self) -> bool {
        self.0 & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0
    }

    pub fn with(self, flag: u32) -> Result<Self, Error> {
        Self::from_bits(self.0 | flag)
    }

    pub fn without(self, flag: u32) -> Self {
        Self(self.0 & !flag)
    }
}

impl TryFrom<u32> for ScriptFlags {
    type Error = Error;

    fn try_from(bits: u32) -> Result<Self, Error> {
        Self::from_bits(bits)
    }
}

impl FromStr for ScriptFlags {
    type Err = ParseFlagsError;

    /// Comma separated flag names; `""` and `"NONE"` both mean no flags.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = VERIFY_NONE;
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if name == "NONE" {
                continue;
            }
            let (_, bit) = NAMES
                .iter()
                .find(|(known, _)| *known == name)
                .ok_or_else(|| ParseFlagsError(String::from(name)))?;
            bits |= bit;
        }
        Ok(Self(bits))
    }
}

impl fmt::Display for ScriptFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = NAMES.iter().filter(|(_, bit)| self.0 & bit != 0);
        match set.next() {
            None => f.write_str("NONE"),
            Some((first, _)) => {
                f.write_str(first)?;
                for (name, _) in set {
                    write!(f, ",{name}")?;
                }
                Ok(())
            }
        }
    }
}
