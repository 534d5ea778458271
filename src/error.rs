//! Shared configuration error
//!
//! Raised by every stage that validates caller input or deployment
//! configuration. A job failing with this error is never submitted.

use thiserror::Error;

/// Invalid or missing resource/identity configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration for '{field}': {reason}")]
pub struct ConfigurationError {
    /// Offending field, in config or job-option notation
    pub field: String,
    pub reason: String,
}

impl ConfigurationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
