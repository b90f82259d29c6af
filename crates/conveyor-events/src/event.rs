//! The event shape handed from the relay to dispatchers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_db::models::OutboxMessage;

/// A domain event in flight between the outbox and its subscribers.
///
/// `event_id` is the outbox message id; consumers deduplicate on it, since
/// the relay guarantees at-least-once hand-off, not exactly-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Build the in-flight event for a claimed outbox row.
    pub fn from_outbox(message: &OutboxMessage) -> Self {
        Self {
            event_id: message.id,
            aggregate_id: message.aggregate_id,
            event_type: message.event_type.clone(),
            occurred_at: message.occurred_at,
            data: message.payload.clone(),
        }
    }
}
