//! Error types for the Quotagate engine.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Quotagate operations.
///
/// Quota denials are not errors; they are reported through
/// [`AdmissionResult::Denied`](crate::ratelimit::AdmissionResult::Denied).
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors, raised at load or registration time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store failures that the fail mode does not cover
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        QuotaError::Config(msg.into())
    }

    /// Prefix a configuration error with where it was found.
    pub(crate) fn in_context(self, context: impl std::fmt::Display) -> Self {
        match self {
            QuotaError::Config(msg) => QuotaError::Config(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
