//! Validation error model shared across the gate crates.

use thiserror::Error;

/// Result type for parsing and validating gate inputs.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic input failures (unknown identifiers, malformed ids).
///
/// Transport and backend failures have their own error types in the crates
/// that talk to those collaborators; this one never wraps I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. an unknown feature name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
