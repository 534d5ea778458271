//! Memory sizes in Spark notation
//!
//! Accepts `512m`, `8G`, `2gb`, `1t`, `4096k` and bare numbers (MiB).
//! Sizes render back in the largest exact unit: 8192 MiB is `8G`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const KIB_PER_MIB: u64 = 1024;
const KIB_PER_GIB: u64 = 1024 * 1024;
const KIB_PER_TIB: u64 = 1024 * 1024 * 1024;

/// A memory amount, stored in KiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMemory", into = "String")]
pub struct MemorySize {
    kib: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMemory {
    Text(String),
    Mib(u64),
}

impl MemorySize {
    pub const fn from_mib(mib: u64) -> Self {
        Self {
            kib: mib * KIB_PER_MIB,
        }
    }

    /// `None` when the amount does not fit in KiB
    pub fn checked_from_mib(mib: u64) -> Option<Self> {
        mib.checked_mul(KIB_PER_MIB).map(Self::from_kib)
    }

    pub const fn from_kib(kib: u64) -> Self {
        Self { kib }
    }

    pub fn as_kib(&self) -> u64 {
        self.kib
    }

    pub fn is_zero(&self) -> bool {
        self.kib == 0
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kib = self.kib;
        if kib != 0 && kib % KIB_PER_TIB == 0 {
            write!(f, "{}T", kib / KIB_PER_TIB)
        } else if kib != 0 && kib % KIB_PER_GIB == 0 {
            write!(f, "{}G", kib / KIB_PER_GIB)
        } else if kib % KIB_PER_MIB == 0 {
            write!(f, "{}M", kib / KIB_PER_MIB)
        } else {
            write!(f, "{}K", kib)
        }
    }
}

/// Memory parse error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid memory size '{input}': expected a number with optional k/m/g/t suffix")]
pub struct MemoryParseError {
    pub input: String,
}

impl FromStr for MemorySize {
    type Err = MemoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MemoryParseError {
            input: s.to_string(),
        };

        let trimmed = s.trim().to_ascii_lowercase();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(err());
        }
        let amount: u64 = digits.parse().map_err(|_| err())?;

        let factor = match unit.trim() {
            "" | "m" | "mb" => KIB_PER_MIB,
            "k" | "kb" => 1,
            "g" | "gb" => KIB_PER_GIB,
            "t" | "tb" => KIB_PER_TIB,
            _ => return Err(err()),
        };

        amount
            .checked_mul(factor)
            .map(Self::from_kib)
            .ok_or_else(err)
    }
}

impl TryFrom<RawMemory> for MemorySize {
    type Error = MemoryParseError;

    fn try_from(raw: RawMemory) -> Result<Self, Self::Error> {
        match raw {
            RawMemory::Text(s) => s.parse(),
            RawMemory::Mib(mib) => Self::checked_from_mib(mib).ok_or(MemoryParseError {
                input: mib.to_string(),
            }),
        }
    }
}

impl From<MemorySize> for String {
    fn from(size: MemorySize) -> Self {
        size.to_string()
    }
}
