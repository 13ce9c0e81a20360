//! Java release targets.

use crate::error::{JavacError, Result};
use std::{fmt, str::FromStr};

/// A Java release a group of sources can be compiled for, lowest to latest.
///
/// The ordering of the variants is the compilation order of a multi-release build: the base
/// release is always compiled first, every following release sees the previous release's
/// outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Release {
    Java8 = 8,
    Java9 = 9,
    Java10 = 10,
    Java11 = 11,
    Java12 = 12,
    Java13 = 13,
    Java14 = 14,
    Java15 = 15,
    Java16 = 16,
    Java17 = 17,
    Java18 = 18,
    Java19 = 19,
    Java20 = 20,
    Java21 = 21,
    Java22 = 22,
    Java23 = 23,
    Java24 = 24,
    Java25 = 25,
}

impl Release {
    /// All supported releases in ascending order.
    pub const ALL: &'static [Release] = &[
        Release::Java8,
        Release::Java9,
        Release::Java10,
        Release::Java11,
        Release::Java12,
        Release::Java13,
        Release::Java14,
        Release::Java15,
        Release::Java16,
        Release::Java17,
        Release::Java18,
        Release::Java19,
        Release::Java20,
        Release::Java21,
        Release::Java22,
        Release::Java23,
        Release::Java24,
        Release::Java25,
    ];

    /// The latest release this driver knows about.
    ///
    /// Used wherever a group of sources has no explicit release: such a group sorts after all
    /// tagged groups and its version directory uses this number.
    pub const LATEST: Release = Release::Java25;

    /// The feature-release number as passed to `--release`.
    pub fn as_number(&self) -> u32 {
        *self as u32
    }

    pub fn from_number(n: u32) -> Option<Self> {
        Release::ALL.iter().copied().find(|r| r.as_number() == n)
    }
}

impl FromStr for Release {
    type Err = JavacError;

    /// Parses `"17"` as well as the legacy `"1.8"` spelling.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.strip_prefix("1.").unwrap_or(s);
        normalized
            .parse::<u32>()
            .ok()
            .and_then(Release::from_number)
            .ok_or_else(|| JavacError::config(format!("unsupported Java release \"{s}\"")))
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_legacy_spellings() {
        assert_eq!("17".parse::<Release>().unwrap(), Release::Java17);
        assert_eq!("1.8".parse::<Release>().unwrap(), Release::Java8);
        assert!("7".parse::<Release>().is_err());
        assert!("banana".parse::<Release>().is_err());
    }

    #[test]
    fn ordering_is_ascending() {
        assert!(Release::Java8 < Release::Java9);
        assert!(Release::Java21 < Release::LATEST);
        let mut sorted = Release::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Release::ALL);
    }
}
