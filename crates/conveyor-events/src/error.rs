//! Error types for the conveyor-events crate.

use thiserror::Error;

/// Errors that can occur while relaying events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Configuration value is invalid.
    #[error("Configuration invalid for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },

    /// The delivery channel rejected the hand-off.
    #[error("Failed to publish event: {cause}")]
    PublishFailed { cause: String },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EventError {
    /// Returns true if the operation can be retried on a later relay cycle.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EventError::PublishFailed { .. } | EventError::Database(_)
        )
    }
}
