//! Error types for the domain model.
//!
//! Validation never stops at the first problem: every rule is checked and the
//! violations are collected into a [`ValidationErrors`] list so a submitter sees
//! all of them at once.

use std::fmt;

use thiserror::Error;

/// A collected list of validation failures.
///
/// Renders in the familiar multi-error layout:
///
/// ```text
/// 2 errors occurred:
///     * Missing job region
///     * Missing job name
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<String>,
}

impl ValidationErrors {
    /// Creates an empty error list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list holding a single message.
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }

    /// Records a violation.
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Appends every violation from `other` at the same level.
    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// Flattens the error of a nested validation into this list.
    pub fn merge(&mut self, result: Result<(), ValidationErrors>) {
        if let Err(inner) = result {
            self.extend(inner);
        }
    }

    /// Records a nested validation failure under a prefix, e.g.
    /// `Task group web validation failed: <inner>`.
    pub fn nest(&mut self, prefix: impl fmt::Display, result: Result<(), ValidationErrors>) {
        if let Err(inner) = result {
            self.errors.push(format!("{prefix}: {inner}"));
        }
    }

    /// Returns true if no violation was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of recorded violations.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Iterates over the recorded messages.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(String::as_str)
    }

    /// Returns true if any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.errors.iter().any(|e| e.contains(needle))
    }

    /// Converts into a result, `Ok` when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            writeln!(f, "1 error occurred:")?;
        } else {
            writeln!(f, "{} errors occurred:", self.errors.len())?;
        }
        for err in &self.errors {
            writeln!(f, "\t* {err}")?;
        }
        writeln!(f)
    }
}

impl std::error::Error for ValidationErrors {}

impl From<String> for ValidationErrors {
    fn from(message: String) -> Self {
        Self::single(message)
    }
}

impl From<&str> for ValidationErrors {
    fn from(message: &str) -> Self {
        Self::single(message)
    }
}

/// Errors raised by domain operations other than validation.
#[derive(Debug, Error)]
pub enum StructsError {
    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// Two networks on the same device disagree on their CIDR.
    #[error("network on device {device:?} has CIDR {existing:?}, cannot add {delta:?}")]
    NetworkMismatch {
        device: String,
        existing: String,
        delta: String,
    },

    /// An encoded message carried no type tag.
    #[error("message is empty")]
    EmptyMessage,

    /// An encoded message carried a type tag this version does not know.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A token could not be decoded.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StructsError {
    /// Returns true if this error came from input validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, StructsError::Validation(_))
    }
}
