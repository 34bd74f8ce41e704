//! Error types for the notification engine.

use thiserror::Error;

use crate::domain::request::RequestId;

/// Result type alias using the bloodline error type.
pub type Result<T> = std::result::Result<T, BloodlineError>;

/// Main error type for the notification engine.
#[derive(Error, Debug)]
pub enum BloodlineError {
    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Confirmation or dispatch attempted against a request that is no longer
    /// accepting donations (fulfilled, expired, or cancelled).
    #[error("Request {0} is already fulfilled or expired")]
    AlreadyClosed(RequestId),

    /// Response token is unknown or has already been used.
    #[error("Response token not recognized or already used")]
    TokenNotFound,

    /// Validation error (e.g., invalid blood group, zero quantity, past deadline)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow (store outages, transport failures)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BloodlineError {
    /// True for failures that may succeed on a later cycle (store or
    /// transport unavailability), as opposed to domain outcomes.
    pub fn is_transient(&self) -> bool {
        matches!(self, BloodlineError::Other(_))
    }
}
