//! Command executor: optimistic concurrency check, mutation, and atomic
//! state + outbox commit.

use std::sync::Arc;

use sqlx::PgPool;

use conveyor_db::models::AggregateRecord;

use crate::command::{CommandOutcome, CommandRequest, CommandStatus, MutationHandler};
use crate::error::PipelineError;
use crate::outbox::OutboxWriter;

/// Executes commands against versioned aggregates.
///
/// Version conflicts are detected, never resolved: the caller re-reads and
/// resubmits. No locks are held across the read-modify-write window; the
/// commit-time conditional write is the only synchronization.
#[derive(Clone)]
pub struct CommandExecutor {
    pool: PgPool,
    handler: Arc<dyn MutationHandler>,
}

impl CommandExecutor {
    /// Create an executor bound to a mutation handler.
    pub fn new(pool: PgPool, handler: Arc<dyn MutationHandler>) -> Self {
        Self { pool, handler }
    }

    /// Execute a command: check the expected version, apply the mutation,
    /// and commit state + version + outbox rows in one transaction.
    pub async fn execute(&self, request: &CommandRequest) -> Result<CommandOutcome, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let current = AggregateRecord::find_tx(&mut *tx, request.aggregate_id).await?;

        match (&current, request.expected_version) {
            // Creation of a new aggregate.
            (None, None) => {}
            // Update against the version the caller read.
            (Some(stored), Some(expected)) if stored.version == expected => {}
            (stored, expected) => {
                return Err(PipelineError::VersionConflict {
                    aggregate_id: request.aggregate_id,
                    expected,
                    stored: stored.as_ref().map(|a| a.version),
                });
            }
        }

        let mutation = self
            .handler
            .apply(
                request.aggregate_id,
                current.as_ref().map(|a| &a.state),
                &request.body,
            )
            .await?;

        let (status, new_version) = match &current {
            None => {
                let inserted =
                    AggregateRecord::insert_new(&mut *tx, request.aggregate_id, &mutation.new_state)
                        .await?;
                if !inserted {
                    // A concurrent creation committed between our read and write.
                    let stored = AggregateRecord::find_tx(&mut *tx, request.aggregate_id).await?;
                    return Err(PipelineError::VersionConflict {
                        aggregate_id: request.aggregate_id,
                        expected: None,
                        stored: stored.map(|a| a.version),
                    });
                }
                (CommandStatus::Created, 1)
            }
            Some(stored) => {
                let updated = AggregateRecord::update_if_version(
                    &mut *tx,
                    request.aggregate_id,
                    &mutation.new_state,
                    stored.version,
                )
                .await?;
                if !updated {
                    // Lost the update race at commit time.
                    let now_stored = AggregateRecord::find_tx(&mut *tx, request.aggregate_id).await?;
                    return Err(PipelineError::VersionConflict {
                        aggregate_id: request.aggregate_id,
                        expected: Some(stored.version),
                        stored: now_stored.map(|a| a.version),
                    });
                }
                (CommandStatus::Updated, stored.version + 1)
            }
        };

        let outbox_rows =
            OutboxWriter::append(&mut *tx, request.aggregate_id, &mutation.events).await?;

        tx.commit().await?;

        tracing::info!(
            target: "pipeline",
            aggregate_id = %request.aggregate_id,
            status = status.as_str(),
            new_version,
            event_count = outbox_rows.len(),
            "Command committed"
        );

        Ok(CommandOutcome {
            status,
            new_version,
            body: mutation.new_state,
            replayed: false,
        })
    }
}
