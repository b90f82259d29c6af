//! Wire types for webhook deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_events::PipelineEvent;

/// Delivery header carrying the payload signature (`sha256=<hex>`).
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// Delivery header carrying the delivery timestamp (unix seconds).
pub const HEADER_TIMESTAMP: &str = "X-Delivery-Timestamp";

/// Delivery header carrying the event id for consumer-side deduplication.
pub const HEADER_EVENT_ID: &str = "X-Event-Id";

/// JSON body POSTed to subscriber endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl WebhookPayload {
    /// Build the delivery payload for a relayed event.
    pub fn from_event(event: &PipelineEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            data: event.data.clone(),
        }
    }
}
