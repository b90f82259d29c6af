//! Outbox writer.
//!
//! Appends domain-event rows inside the same transaction as the aggregate
//! mutation. Never publishes: the write is a durable record of "this event
//! happened", decoupling commit latency from delivery latency.

use sqlx::PgConnection;
use uuid::Uuid;

use conveyor_db::models::OutboxMessage;

use crate::command::DomainEvent;
use crate::error::PipelineError;

/// Writes outbox rows for the events produced by a mutation.
pub struct OutboxWriter;

impl OutboxWriter {
    /// Append one outbox row per event, on the mutation's transaction.
    ///
    /// Each row gets a fresh unique message id, which downstream consumers
    /// use for deduplication. If the enclosing transaction rolls back, no
    /// row survives.
    pub async fn append(
        conn: &mut PgConnection,
        aggregate_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<Vec<OutboxMessage>, PipelineError> {
        let mut rows = Vec::with_capacity(events.len());

        for event in events {
            let row =
                OutboxMessage::append(conn, aggregate_id, &event.event_type, &event.data).await?;

            tracing::debug!(
                target: "outbox",
                message_id = %row.id,
                aggregate_id = %aggregate_id,
                event_type = %event.event_type,
                "Outbox row appended"
            );

            rows.push(row);
        }

        Ok(rows)
    }
}
