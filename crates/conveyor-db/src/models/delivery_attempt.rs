//! DeliveryAttempt model.
//!
//! One row per delivery attempt for a (subscription, message) pair. The
//! latest `pending` row carries the retry schedule; the dispatcher claims it
//! with a conditional `pending -> delivering` transition before sending so
//! concurrent workers never double-send the same attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Delivery attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its scheduled execution time.
    Pending,
    /// An HTTP attempt is in flight.
    Delivering,
    /// The subscriber acknowledged with a 2xx.
    Succeeded,
    /// The attempt failed; a follow-up attempt row may exist.
    Failed,
    /// Retry budget exhausted; retained in the DLQ.
    DeadLettered,
    /// Cancelled because the subscription was disabled or removed.
    Abandoned,
}

impl DeliveryStatus {
    /// Convert from database string representation.
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivering" => Some(Self::Delivering),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether this status is terminal for the (subscription, message) pair.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered | Self::Abandoned)
    }
}

/// A single delivery attempt row.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    /// Outbox message id; doubles as the downstream dedup key.
    pub outbox_message_id: Uuid,
    pub event_type: String,
    /// Full webhook payload to deliver.
    pub payload: serde_json::Value,
    /// 1-based attempt sequence per (subscription, message).
    pub attempt_number: i32,
    pub status: String,
    /// Earliest time this attempt may execute (NULL means immediately).
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When a dispatcher claimed this attempt for execution.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When attempt 1 first executed; anchors the retry window cap.
    pub first_attempted_at: Option<DateTime<Utc>>,
    pub response_code: Option<i16>,
    pub last_error: Option<String>,
    pub latency_ms: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Data needed to enqueue a delivery attempt.
#[derive(Debug, Clone)]
pub struct CreateDeliveryAttempt {
    pub subscription_id: Uuid,
    pub outbox_message_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempt_number: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub first_attempted_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// Get the typed status.
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_db(&self.status).unwrap_or(DeliveryStatus::Pending)
    }

    /// Enqueue an attempt in `pending` state.
    pub async fn create(pool: &PgPool, data: CreateDeliveryAttempt) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO delivery_attempts (
                subscription_id, outbox_message_id, event_type, payload,
                attempt_number, next_retry_at, first_attempted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(data.subscription_id)
        .bind(data.outbox_message_id)
        .bind(&data.event_type)
        .bind(&data.payload)
        .bind(data.attempt_number)
        .bind(data.next_retry_at)
        .bind(data.first_attempted_at)
        .fetch_one(pool)
        .await
    }

    /// Claim a batch of due attempts, transitioning them `pending -> delivering`.
    ///
    /// The conditional update is the exclusivity boundary between concurrent
    /// dispatcher workers.
    pub async fn claim_due(pool: &PgPool, batch_size: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            UPDATE delivery_attempts
            SET status = 'delivering',
                claimed_at = NOW(),
                first_attempted_at = COALESCE(first_attempted_at, NOW())
            WHERE id IN (
                SELECT id FROM delivery_attempts
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY next_retry_at NULLS FIRST
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(batch_size)
        .fetch_all(pool)
        .await
    }

    /// Claim a single attempt for immediate execution.
    ///
    /// Returns the claimed row, or None if another worker got there first.
    pub async fn begin_delivery(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            UPDATE delivery_attempts
            SET status = 'delivering',
                claimed_at = NOW(),
                first_attempted_at = COALESCE(first_attempted_at, NOW())
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Record a successful delivery.
    pub async fn mark_succeeded(
        pool: &PgPool,
        id: Uuid,
        response_code: i16,
        latency_ms: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'succeeded',
                response_code = $2,
                latency_ms = $3,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(response_code)
        .bind(latency_ms)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Record a failed delivery attempt.
    pub async fn mark_failed(
        pool: &PgPool,
        id: Uuid,
        error: &str,
        response_code: Option<i16>,
        latency_ms: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'failed',
                last_error = $2,
                response_code = $3,
                latency_ms = $4,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(response_code)
        .bind(latency_ms)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Mark an attempt dead-lettered after the retry budget is exhausted.
    pub async fn mark_dead_lettered(pool: &PgPool, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'dead_lettered',
                last_error = $2,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Return attempts stuck in `delivering` (their worker died mid-flight)
    /// to `pending` so another worker can pick them up.
    ///
    /// Returns the number of released rows.
    pub async fn release_stuck(
        pool: &PgPool,
        stuck_after: chrono::Duration,
    ) -> Result<u64, sqlx::Error> {
        let threshold = Utc::now() - stuck_after;

        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'pending'
            WHERE status = 'delivering' AND claimed_at < $1
            "#,
        )
        .bind(threshold)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Abandon a single claimed attempt (its subscription vanished mid-flight).
    pub async fn mark_abandoned(pool: &PgPool, id: Uuid, reason: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'abandoned',
                last_error = $2,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Abandon all pending attempts for a subscription (disabled/removed).
    ///
    /// Returns the number of abandoned rows.
    pub async fn abandon_pending_for_subscription(
        pool: &PgPool,
        subscription_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'abandoned',
                completed_at = NOW()
            WHERE subscription_id = $1 AND status = 'pending'
            "#,
        )
        .bind(subscription_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// List all attempts for a (subscription, message) pair in sequence order.
    pub async fn list_for_pair(
        pool: &PgPool,
        subscription_id: Uuid,
        outbox_message_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE subscription_id = $1 AND outbox_message_id = $2
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(subscription_id)
        .bind(outbox_message_id)
        .fetch_all(pool)
        .await
    }
}
