//! DlqEntry model for deliveries that exhausted their retry budget.
//!
//! Dead-lettered deliveries are retained for inspection and manual replay;
//! they are never silently dropped.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A dead-lettered webhook delivery.
#[derive(Debug, Clone, FromRow)]
pub struct DlqEntry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    /// Endpoint URL at the time of dead-lettering.
    pub subscription_url: String,
    /// Outbox message id of the undeliverable event.
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub last_response_code: Option<i16>,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    /// Set once the entry has been replayed; replaying is one-shot.
    pub replayed_at: Option<DateTime<Utc>>,
}

/// Data needed to dead-letter a delivery.
#[derive(Debug, Clone)]
pub struct CreateDlqEntry {
    pub subscription_id: Uuid,
    pub subscription_url: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub last_response_code: Option<i16>,
    pub attempt_count: i32,
}

impl DlqEntry {
    /// Store a dead-lettered delivery.
    pub async fn create(pool: &PgPool, data: CreateDlqEntry) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO webhook_dlq (
                subscription_id, subscription_url, event_id, event_type,
                payload, failure_reason, last_response_code, attempt_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(data.subscription_id)
        .bind(&data.subscription_url)
        .bind(data.event_id)
        .bind(&data.event_type)
        .bind(&data.payload)
        .bind(&data.failure_reason)
        .bind(data.last_response_code)
        .bind(data.attempt_count)
        .fetch_one(pool)
        .await
    }

    /// Find an entry by id.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM webhook_dlq WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// List entries, newest first, with pagination.
    pub async fn list(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM webhook_dlq
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Count all entries.
    pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_dlq
            "#,
        )
        .fetch_one(pool)
        .await?;

        Ok(count.0)
    }

    /// Mark an entry as replayed. Returns false if it was already replayed
    /// or does not exist.
    pub async fn mark_replayed(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_dlq
            SET replayed_at = NOW()
            WHERE id = $1 AND replayed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete an entry. Returns false if it did not exist.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_dlq WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
