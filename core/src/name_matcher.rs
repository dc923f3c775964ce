//! `NameMatcher`: Anchored full-name matching
//!
//! A rule's `name` is a regular expression that must match a candidate's
//! *entire* name. The pattern is wrapped as `^(?:pattern)$`; the group keeps
//! alternations anchored as a whole, so `a|b` matches `a` and `b` but never
//! `ab`.
//!
//! Patterns compile with the `regex` crate (RE2 semantics, linear time), so a
//! hostile pattern cannot stall matching. Length is capped at
//! [`MAX_REGEX_PATTERN_LENGTH`](crate::MAX_REGEX_PATTERN_LENGTH).

use crate::MAX_REGEX_PATTERN_LENGTH;
use regex::Regex;
use std::fmt;

/// A name pattern that could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// Pattern exceeds [`MAX_REGEX_PATTERN_LENGTH`].
    #[error("pattern length is {len}, but maximum allowed is {max}")]
    TooLong {
        /// Pattern length in bytes.
        len: usize,
        /// The limit.
        max: usize,
    },
    /// Pattern is not a valid regular expression.
    #[error("invalid regular expression: {message}")]
    Invalid {
        /// Anchored pattern as compiled.
        pattern: String,
        /// Diagnostic from the regex compiler.
        message: String,
    },
}

/// Wrap a pattern so it must match the whole input.
#[must_use]
pub fn anchor(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}

/// A compiled, anchored name pattern.
#[derive(Clone)]
pub struct NameMatcher {
    pattern: String,
    regex: Regex,
}

impl NameMatcher {
    /// Compile `pattern` as an anchored matcher.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if the pattern is too long or invalid.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.len() > MAX_REGEX_PATTERN_LENGTH {
            return Err(PatternError::TooLong {
                len: pattern.len(),
                max: MAX_REGEX_PATTERN_LENGTH,
            });
        }
        let anchored = anchor(pattern);
        let regex = Regex::new(&anchored).map_err(|e| PatternError::Invalid {
            pattern: anchored,
            message: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Does `name` match the whole pattern?
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The pattern as written, without anchors.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Debug for NameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NameMatcher").field(&self.pattern).finish()
    }
}

impl fmt::Display for NameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.regex.as_str())
    }
}
