//! Idempotency guard.
//!
//! Deduplicates command submissions keyed by a caller-supplied token. The
//! unique constraint on `idempotent_commands.idempotency_key` is the claim
//! primitive: exactly one concurrent caller wins it, every other caller
//! observes either the committed result or an in-flight signal. The guarded
//! computation never runs twice for one key.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;

use conveyor_db::models::{ClaimResult, CommandState, IdempotentCommand};

use crate::command::{CommandOutcome, CommandStatus};
use crate::error::PipelineError;

/// Interval between polls while waiting on a concurrent holder.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Number of polls before giving up with `ConcurrentRequestInFlight`.
pub const DEFAULT_MAX_POLLS: u32 = 10;

/// Rounds of claim attempts (initial claim plus reclaims of stale/expired
/// records) before giving up.
const MAX_CLAIM_ROUNDS: u32 = 5;

/// Guard that wraps command execution with key-based deduplication.
#[derive(Clone)]
pub struct IdempotencyGuard {
    pool: PgPool,
    poll_interval: Duration,
    max_polls: u32,
}

enum Resolution {
    /// We hold the claim; the computation must run.
    Execute(IdempotentCommand),
    /// A completed record with a matching fingerprint exists.
    Replay(CommandOutcome),
}

impl IdempotencyGuard {
    /// Create a guard with default polling behavior.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_polls: DEFAULT_MAX_POLLS,
        }
    }

    /// Override the in-flight polling schedule.
    #[must_use]
    pub fn with_polling(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls;
        self
    }

    /// Run `compute` at most once for the given key.
    ///
    /// With no key, `compute` runs unguarded. With a key: a fresh claim runs
    /// `compute` and stores its outcome; a completed record with the same
    /// fingerprint replays the stored outcome; a different fingerprint is an
    /// `IdempotencyConflict`; a concurrent in-flight holder is polled briefly
    /// and then reported as `ConcurrentRequestInFlight`. A failed `compute`
    /// releases the claim so the key becomes retryable.
    pub async fn guard<F, Fut>(
        &self,
        key: Option<&str>,
        fingerprint: &str,
        compute: F,
    ) -> Result<CommandOutcome, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CommandOutcome, PipelineError>>,
    {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return compute().await;
        };

        match self.resolve(key, fingerprint).await? {
            Resolution::Replay(outcome) => {
                tracing::debug!(
                    target: "pipeline",
                    idempotency_key = key,
                    "Replaying stored response"
                );
                Ok(outcome)
            }
            Resolution::Execute(claim) => {
                let result = compute().await;
                match &result {
                    Ok(outcome) => {
                        IdempotentCommand::complete(
                            &self.pool,
                            claim.id,
                            outcome.status.as_str(),
                            &outcome.body,
                            outcome.new_version,
                        )
                        .await?;
                    }
                    Err(error) => {
                        // Release the claim so the caller can retry the key.
                        if let Err(release_error) =
                            IdempotentCommand::release(&self.pool, claim.id).await
                        {
                            tracing::error!(
                                target: "pipeline",
                                idempotency_key = key,
                                error = %release_error,
                                "Failed to release idempotency claim after error: {error}"
                            );
                        }
                    }
                }
                result
            }
        }
    }

    /// Resolve the key to either a held claim or a replayable record,
    /// without ever running the computation.
    async fn resolve(&self, key: &str, fingerprint: &str) -> Result<Resolution, PipelineError> {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let existing = match IdempotentCommand::try_claim(&self.pool, key, fingerprint).await? {
                ClaimResult::Claimed(record) => return Ok(Resolution::Execute(record)),
                ClaimResult::Existing(record) => record,
            };

            // Expired records behave as if no record existed.
            if existing.is_expired() {
                IdempotentCommand::delete_expired(&self.pool, existing.id).await?;
                continue;
            }

            // Same key, different request: a conflict, not a replay.
            if existing.request_fingerprint != fingerprint {
                return Err(PipelineError::IdempotencyConflict);
            }

            match existing.state() {
                CommandState::Completed => return Ok(Resolution::Replay(replay_from(&existing)?)),
                CommandState::Processing => {
                    if existing.is_processing_timed_out() {
                        // The previous holder died mid-execution; reclaim.
                        IdempotentCommand::delete_stale(&self.pool, existing.id).await?;
                        continue;
                    }
                    if let Some(resolution) = self.poll_in_flight(key, fingerprint).await? {
                        return Ok(resolution);
                    }
                    // The holder released its claim; try to claim again.
                }
            }
        }

        Err(PipelineError::ConcurrentRequestInFlight)
    }

    /// Poll a processing record a bounded number of times.
    ///
    /// Returns `Some(Replay)` when the holder completes, `None` when the
    /// holder released the claim (the caller should re-claim), and
    /// `ConcurrentRequestInFlight` when the polls are exhausted.
    async fn poll_in_flight(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<Option<Resolution>, PipelineError> {
        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            match IdempotentCommand::find_by_key(&self.pool, key).await? {
                Some(record) if record.state() == CommandState::Completed => {
                    if record.request_fingerprint != fingerprint {
                        return Err(PipelineError::IdempotencyConflict);
                    }
                    return Ok(Some(Resolution::Replay(replay_from(&record)?)));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        Err(PipelineError::ConcurrentRequestInFlight)
    }
}

/// Build a replay outcome from a completed record.
fn replay_from(record: &IdempotentCommand) -> Result<CommandOutcome, PipelineError> {
    let status = record
        .response_status
        .as_deref()
        .and_then(CommandStatus::from_db)
        .ok_or_else(|| {
            PipelineError::Internal(format!(
                "Completed idempotency record {} has no valid status",
                record.id
            ))
        })?;

    let new_version = record.new_version.ok_or_else(|| {
        PipelineError::Internal(format!(
            "Completed idempotency record {} has no version",
            record.id
        ))
    })?;

    Ok(CommandOutcome {
        status,
        new_version,
        body: record.response_body.clone().unwrap_or(serde_json::Value::Null),
        replayed: true,
    })
}
