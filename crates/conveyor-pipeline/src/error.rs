//! Error taxonomy for the command path.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the command-processing pipeline.
///
/// Conflicts are surfaced synchronously to the caller; once the mutation has
/// committed, delivery-side failures are retried in the background and never
/// reach the submitter.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The idempotency key was already used for a materially different request.
    #[error("Idempotency key reused with a different request body")]
    IdempotencyConflict,

    /// Another submission with the same key is still executing.
    #[error("A request with this idempotency key is already in flight")]
    ConcurrentRequestInFlight,

    /// The expected aggregate version does not match the stored one.
    #[error("Version conflict on aggregate {aggregate_id}: expected {expected:?}, stored {stored:?}")]
    VersionConflict {
        aggregate_id: Uuid,
        expected: Option<i64>,
        stored: Option<i64>,
    },

    /// The mutation handler rejected the command.
    #[error("Mutation handler failed: {0}")]
    Handler(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invariant violation in pipeline-owned storage.
    #[error("Internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// True for conflicts the caller must resolve by re-reading and resubmitting.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PipelineError::IdempotencyConflict | PipelineError::VersionConflict { .. }
        )
    }

    /// True when the caller may simply retry the identical submission.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::ConcurrentRequestInFlight | PipelineError::Database(_)
        )
    }
}
