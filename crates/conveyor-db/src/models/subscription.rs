//! WebhookSubscription model.
//!
//! Subscriptions are created and removed by the subscriber-management
//! collaborator; the dispatcher reads them and maintains the
//! consecutive-failure counter.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A registered webhook subscriber endpoint.
#[derive(Debug, Clone, FromRow)]
pub struct WebhookSubscription {
    /// Primary key.
    pub id: Uuid,
    /// Event type this subscription receives.
    pub event_type: String,
    /// Delivery endpoint URL.
    pub url: String,
    /// Shared secret, AES-GCM encrypted at rest.
    pub secret_encrypted: Option<String>,
    /// Whether the subscription receives deliveries.
    pub active: bool,
    /// Failures since the last successful delivery.
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data needed to register a subscription.
#[derive(Debug, Clone)]
pub struct CreateWebhookSubscription {
    pub event_type: String,
    pub url: String,
    pub secret_encrypted: Option<String>,
    pub active: bool,
}

impl WebhookSubscription {
    /// Register a new subscription.
    pub async fn create(
        pool: &PgPool,
        data: CreateWebhookSubscription,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            r#"
            INSERT INTO webhook_subscriptions (event_type, url, secret_encrypted, active)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&data.event_type)
        .bind(&data.url)
        .bind(&data.secret_encrypted)
        .bind(data.active)
        .fetch_one(pool)
        .await
    }

    /// Find a subscription by id.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM webhook_subscriptions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Find all active subscriptions for an event type.
    pub async fn find_active_by_event_type(
        pool: &PgPool,
        event_type: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM webhook_subscriptions
            WHERE event_type = $1 AND active
            ORDER BY created_at ASC
            "#,
        )
        .bind(event_type)
        .fetch_all(pool)
        .await
    }

    /// List subscriptions with pagination.
    pub async fn list(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM webhook_subscriptions
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Set the active flag. Returns false if the subscription does not exist.
    pub async fn set_active(pool: &PgPool, id: Uuid, active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET active = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(active)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_subscriptions WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Increment the consecutive-failure counter, returning the new value.
    pub async fn increment_consecutive_failures(
        pool: &PgPool,
        id: Uuid,
    ) -> Result<i32, sqlx::Error> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE webhook_subscriptions
            SET consecutive_failures = consecutive_failures + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(row.0)
    }

    /// Reset the consecutive-failure counter after a successful delivery.
    pub async fn reset_consecutive_failures(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET consecutive_failures = 0, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }
}
