//! Command-submission boundary types and the mutation-handler seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// A state-changing request, as handed over by the transport collaborator.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Target aggregate.
    pub aggregate_id: Uuid,
    /// Caller-supplied idempotency key; `None` disables deduplication.
    pub idempotency_key: Option<String>,
    /// Expected aggregate version; `None` means the command creates the aggregate.
    pub expected_version: Option<i64>,
    /// Opaque command body.
    pub body: serde_json::Value,
}

/// Status outcome of a committed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Created,
    Updated,
}

impl CommandStatus {
    /// Convert from database string representation.
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            _ => None,
        }
    }

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

/// Result of a command submission.
///
/// A replayed submission returns the stored outcome byte-for-byte; `replayed`
/// only tells the caller that no new mutation happened.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    /// Aggregate version after the commit.
    pub new_version: i64,
    /// Response body (the committed aggregate state).
    pub body: serde_json::Value,
    /// True when served from the idempotency cache.
    pub replayed: bool,
}

/// A domain event produced by a mutation, before it gets an outbox identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}

impl DomainEvent {
    /// Create a domain event.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// What a mutation handler produces: the next aggregate state and the events
/// describing the change. The pipeline owns versioning and persistence.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub new_state: serde_json::Value,
    pub events: Vec<DomainEvent>,
}

/// The domain-logic collaborator.
///
/// `apply` must be a pure computation over the given state: the pipeline
/// decides whether its result commits, and re-invokes it on caller retry
/// after a version conflict.
#[async_trait]
pub trait MutationHandler: Send + Sync {
    /// Apply a command to the current state, producing the next state and
    /// the domain events describing the change.
    async fn apply(
        &self,
        aggregate_id: Uuid,
        current_state: Option<&serde_json::Value>,
        command: &serde_json::Value,
    ) -> Result<MutationOutcome, PipelineError>;
}
