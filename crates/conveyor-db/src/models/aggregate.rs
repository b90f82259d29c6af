//! AggregateRecord model for versioned aggregate state.
//!
//! The pipeline treats aggregate state as opaque JSON. The `version` column
//! is the optimistic-concurrency token: every successful commit increments it
//! by exactly one, and writes are conditional on the expected value.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

/// A versioned aggregate row.
#[derive(Debug, Clone, FromRow)]
pub struct AggregateRecord {
    /// Aggregate identity.
    pub id: Uuid,
    /// Opaque domain state.
    pub state: serde_json::Value,
    /// Monotonically increasing version, starting at 1.
    pub version: i64,
    /// Last commit time.
    pub updated_at: DateTime<Utc>,
}

impl AggregateRecord {
    /// Find an aggregate by id.
    pub async fn find(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM aggregates WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Find an aggregate inside an open transaction.
    pub async fn find_tx(conn: &mut PgConnection, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM aggregates WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await
    }

    /// Insert a new aggregate at version 1.
    ///
    /// Returns false if a row with this id already exists (creation race lost).
    pub async fn insert_new(
        conn: &mut PgConnection,
        id: Uuid,
        state: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO aggregates (id, state, version)
            VALUES ($1, $2, 1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(state)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write new state, conditional on the expected version.
    ///
    /// The version is incremented in the same statement. Returns false when
    /// the stored version no longer matches (lost update detected at commit).
    pub async fn update_if_version(
        conn: &mut PgConnection,
        id: Uuid,
        state: &serde_json::Value,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE aggregates
            SET state = $2,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $3
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(expected_version)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
