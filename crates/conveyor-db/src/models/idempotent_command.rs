//! IdempotentCommand model for command-level idempotency.
//!
//! Stores one record per caller-supplied idempotency key. The unique
//! constraint on the key is the claim primitive that deduplicates commands
//! across concurrent callers and processes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Default TTL for idempotency records (24 hours).
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

/// Timeout after which an unfinished `processing` claim is reclaimable (60 seconds).
pub const PROCESSING_TIMEOUT_SECONDS: i64 = 60;

/// State of an idempotent command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// The command is currently being executed by some caller.
    Processing,
    /// The command completed and its response is cached for replay.
    Completed,
}

impl CommandState {
    /// Convert from database string representation.
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

/// Record of an idempotent command submission.
#[derive(Debug, Clone, FromRow)]
pub struct IdempotentCommand {
    /// Primary key.
    pub id: Uuid,
    /// Caller-supplied idempotency key.
    pub idempotency_key: String,
    /// SHA-256 hash of the canonicalized request body.
    pub request_fingerprint: String,
    /// Current state: processing or completed.
    pub state: String,
    /// Command status outcome (when completed).
    pub response_status: Option<String>,
    /// Cached response body (when completed).
    pub response_body: Option<serde_json::Value>,
    /// Aggregate version produced by the command (when completed).
    pub new_version: Option<i64>,
    /// When the claim was first taken.
    pub created_at: DateTime<Utc>,
    /// When the response was stored.
    pub completed_at: Option<DateTime<Utc>>,
    /// When this record expires and behaves as absent.
    pub expires_at: DateTime<Utc>,
}

impl IdempotentCommand {
    /// Get the typed state.
    pub fn state(&self) -> CommandState {
        CommandState::from_db(&self.state).unwrap_or(CommandState::Processing)
    }

    /// Check if this record has passed its TTL.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Check if this claim has been held in `processing` past the timeout.
    pub fn is_processing_timed_out(&self) -> bool {
        if self.state() != CommandState::Processing {
            return false;
        }
        Utc::now() > self.created_at + Duration::seconds(PROCESSING_TIMEOUT_SECONDS)
    }
}

/// Result of trying to claim an idempotency key.
#[derive(Debug)]
pub enum ClaimResult {
    /// The claim was taken; the caller must execute the command.
    Claimed(IdempotentCommand),
    /// Another caller already holds (or completed) this key.
    Existing(IdempotentCommand),
}

impl IdempotentCommand {
    /// Try to claim an idempotency key.
    ///
    /// Uses `INSERT .. ON CONFLICT DO NOTHING` so exactly one concurrent
    /// caller wins the claim.
    pub async fn try_claim(
        pool: &PgPool,
        idempotency_key: &str,
        request_fingerprint: &str,
    ) -> Result<ClaimResult, sqlx::Error> {
        let expires_at = Utc::now() + Duration::hours(IDEMPOTENCY_TTL_HOURS);

        let inserted: Option<IdempotentCommand> = sqlx::query_as(
            r#"
            INSERT INTO idempotent_commands (idempotency_key, request_fingerprint, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(idempotency_key)
        .bind(request_fingerprint)
        .bind(expires_at)
        .fetch_optional(pool)
        .await?;

        match inserted {
            Some(record) => Ok(ClaimResult::Claimed(record)),
            None => {
                let existing = Self::find_by_key(pool, idempotency_key)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok(ClaimResult::Existing(existing))
            }
        }
    }

    /// Find a record by idempotency key.
    pub async fn find_by_key(
        pool: &PgPool,
        idempotency_key: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM idempotent_commands
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await
    }

    /// Store the command response and mark the record completed.
    pub async fn complete(
        pool: &PgPool,
        id: Uuid,
        response_status: &str,
        response_body: &serde_json::Value,
        new_version: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE idempotent_commands
            SET state = 'completed',
                response_status = $2,
                response_body = $3,
                new_version = $4,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(response_status)
        .bind(response_body)
        .bind(new_version)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Release a claim after a failed command so the key becomes retryable.
    pub async fn release(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            DELETE FROM idempotent_commands
            WHERE id = $1 AND state = 'processing'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Delete a `processing` claim that has exceeded the processing timeout.
    ///
    /// Returns true if the stale claim was removed.
    pub async fn delete_stale(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let threshold = Utc::now() - Duration::seconds(PROCESSING_TIMEOUT_SECONDS);

        let result = sqlx::query(
            r#"
            DELETE FROM idempotent_commands
            WHERE id = $1 AND state = 'processing' AND created_at < $2
            "#,
        )
        .bind(id)
        .bind(threshold)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a record that has passed its TTL.
    ///
    /// Returns true if the expired record was removed.
    pub async fn delete_expired(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotent_commands
            WHERE id = $1 AND expires_at < NOW()
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete all expired records. Returns the number removed.
    pub async fn cleanup_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotent_commands
            WHERE expires_at < NOW()
            "#,
        )
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
