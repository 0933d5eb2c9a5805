//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs and names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not a UUID.
    #[error("invalid {kind} ID {value:?}: {reason}")]
    InvalidUuid {
        kind: &'static str,
        value: String,
        reason: String,
    },

    /// The ID parses as a UUID but is not in canonical lowercase hyphenated form.
    #[error("{kind} ID {value:?} is not in canonical form")]
    NotCanonical { kind: &'static str, value: String },

    /// A user-visible name does not match the name rules.
    #[error("invalid name {0:?}")]
    InvalidName(String),

    /// A job ID violates the job ID rules.
    #[error("{0}")]
    InvalidJobId(&'static str),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if the input was not a usable UUID.
    pub fn is_uuid_error(&self) -> bool {
        matches!(self, IdError::InvalidUuid { .. } | IdError::NotCanonical { .. })
    }
}
