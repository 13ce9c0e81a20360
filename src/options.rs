//! The accumulated option list handed to the compiler.

use crate::{
    compilers::OptionChecker,
    error::{JavacError, Result},
};
use std::fmt;
use xxhash_rust::xxh32::Xxh32;

/// An append-only sequence of compiler option tokens.
///
/// The list is consumed twice per build: once to configure the compilation and once, as a
/// [fingerprint](Options::fingerprint), to be compared against the fingerprint persisted by the
/// previous build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    tokens: Vec<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an option after validating it against the tool's option checker.
    pub fn add(&mut self, checker: &impl OptionChecker, option: impl Into<String>) -> Result<&mut Self> {
        let option = option.into();
        if !checker.supports_option(&option) {
            return Err(JavacError::config(format!("compiler does not recognize option \"{option}\"")));
        }
        self.tokens.push(option);
        Ok(self)
    }

    /// Appends an option without validation.
    pub fn add_unchecked(&mut self, option: impl Into<String>) -> &mut Self {
        self.tokens.push(option.into());
        self
    }

    pub fn add_all_unchecked(&mut self, options: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.tokens.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tokens
    }

    /// A stable 32-bit hash of the final token sequence.
    ///
    /// Tokens are hashed with a separator so that `["-a", "b"]` and `["-ab"]` differ.
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = Xxh32::new(0);
        for token in &self.tokens {
            hasher.update(token.as_bytes());
            hasher.update(&[0]);
        }
        hasher.digest()
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}
