//! OutboxMessage model.
//!
//! Outbox rows are appended strictly inside the transaction that commits the
//! aggregate mutation they describe, and drained by the relay via conditional
//! claim updates. The claim is the only coordination point between relay
//! instances; no in-process locks are involved.

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

/// A durable domain event awaiting publication.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxMessage {
    /// Unique message id, generated at append time. Downstream consumers
    /// deduplicate on this.
    pub id: Uuid,
    /// Aggregate whose mutation produced the event.
    pub aggregate_id: Uuid,
    /// Event type, e.g. "created".
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
    /// When the event was appended.
    pub occurred_at: DateTime<Utc>,
    /// When a relay instance claimed the row (NULL when unclaimed).
    pub claimed_at: Option<DateTime<Utc>>,
    /// Which relay instance holds the claim.
    pub claimed_by: Option<String>,
    /// When the row was handed to the delivery channel.
    pub published_at: Option<DateTime<Utc>>,
    /// Number of claim cycles this row has gone through.
    pub attempts: i32,
}

impl OutboxMessage {
    /// Append an event row. Must be called with a connection belonging to the
    /// transaction that also writes the aggregate mutation.
    pub async fn append(
        conn: &mut PgConnection,
        aggregate_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO outbox_messages (id, aggregate_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(aggregate_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(conn)
        .await
    }

    /// Atomically claim a batch of unpublished rows for one relay instance.
    ///
    /// A row is claimable when it has never been claimed, or its claim is
    /// older than `claim_timeout` (the previous claimant is presumed dead).
    /// Rows whose aggregate still has an earlier unpublished message are
    /// excluded so the per-aggregate event stream drains in order. The
    /// conditional update succeeds for exactly one claimant per row.
    pub async fn claim_batch(
        pool: &PgPool,
        instance_id: &str,
        claim_timeout: Duration,
        batch_size: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let reclaim_before = Utc::now() - claim_timeout;

        sqlx::query_as(
            r#"
            UPDATE outbox_messages
            SET claimed_at = NOW(),
                claimed_by = $1,
                attempts = attempts + 1
            WHERE id IN (
                SELECT o.id FROM outbox_messages o
                WHERE o.published_at IS NULL
                  AND (o.claimed_at IS NULL OR o.claimed_at < $2)
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox_messages e
                      WHERE e.aggregate_id = o.aggregate_id
                        AND e.published_at IS NULL
                        AND e.occurred_at < o.occurred_at
                  )
                ORDER BY o.occurred_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(instance_id)
        .bind(reclaim_before)
        .bind(batch_size)
        .fetch_all(pool)
        .await
    }

    /// Record a successful hand-off to the delivery channel.
    pub async fn mark_published(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Release a claim after a failed hand-off so another cycle can retry.
    pub async fn release_claim(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET claimed_at = NULL,
                claimed_by = NULL
            WHERE id = $1 AND published_at IS NULL
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Delete published rows older than the retention window.
    ///
    /// Returns the number of archived rows. Unpublished rows are never touched.
    pub async fn archive_published(
        pool: &PgPool,
        older_than: Duration,
    ) -> Result<u64, sqlx::Error> {
        let threshold = Utc::now() - older_than;

        let result = sqlx::query(
            r#"
            DELETE FROM outbox_messages
            WHERE published_at IS NOT NULL AND published_at < $1
            "#,
        )
        .bind(threshold)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Find a message by id.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM outbox_messages WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Count rows not yet handed to the delivery channel.
    pub async fn count_unpublished(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM outbox_messages WHERE published_at IS NULL
            "#,
        )
        .fetch_one(pool)
        .await?;

        Ok(count.0)
    }

    /// List all rows for an aggregate in occurrence order.
    pub async fn list_for_aggregate(
        pool: &PgPool,
        aggregate_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM outbox_messages
            WHERE aggregate_id = $1
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(pool)
        .await
    }
}
