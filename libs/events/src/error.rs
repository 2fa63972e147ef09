//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The session ID string is empty.
    #[error("session ID cannot be empty")]
    EmptyId,

    /// The session ID has the wrong prefix or no separator.
    #[error("invalid session ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the session ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
