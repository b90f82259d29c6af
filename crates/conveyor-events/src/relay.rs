//! Outbox relay worker.
//!
//! Drains unpublished outbox rows to the delivery channel without losing or
//! duplicating rows across process restarts. Claiming is a conditional
//! update on the outbox table; it is the sole coordination point, so any
//! number of relay instances can share one backlog.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conveyor_db::models::OutboxMessage;

use crate::error::EventError;
use crate::event::PipelineEvent;
use crate::publisher::EventPublisher;

/// Relay worker configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often to poll for claimable rows (in milliseconds).
    pub poll_interval_ms: u64,

    /// Maximum rows claimed per cycle.
    pub batch_size: i64,

    /// Age after which another instance may reclaim a stuck claim (in seconds).
    pub claim_timeout_secs: i64,

    /// Retention for published rows before archival deletion (in seconds).
    pub archive_after_secs: i64,

    /// How often to archive published rows (in seconds).
    pub archive_interval_secs: u64,

    /// Identity stamped into `claimed_by`, for observability.
    pub instance_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            claim_timeout_secs: 30,
            archive_after_secs: 3600,
            archive_interval_secs: 300,
            instance_id: format!("relay-{}", Uuid::new_v4()),
        }
    }
}

impl RelayConfig {
    /// Build a configuration from `CONVEYOR_RELAY_*` environment variables,
    /// falling back to defaults for unset values.
    pub fn from_env() -> Result<Self, EventError> {
        let mut config = Self::default();

        if let Some(v) = read_env("CONVEYOR_RELAY_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = read_env("CONVEYOR_RELAY_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = read_env("CONVEYOR_RELAY_CLAIM_TIMEOUT_SECS")? {
            config.claim_timeout_secs = v;
        }
        if let Ok(v) = env::var("CONVEYOR_RELAY_INSTANCE_ID") {
            if !v.is_empty() {
                config.instance_id = v;
            }
        }

        Ok(config)
    }
}

fn read_env<T: std::str::FromStr>(var: &str) -> Result<Option<T>, EventError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| EventError::ConfigInvalid {
                var: var.to_string(),
                reason: format!("cannot parse {raw:?}"),
            }),
        Err(_) => Ok(None),
    }
}

/// Background worker that forwards committed outbox rows to the delivery
/// channel, at-least-once, in per-aggregate order.
pub struct OutboxRelay {
    pool: PgPool,
    publisher: EventPublisher,
    config: RelayConfig,
    shutdown: Arc<AtomicBool>,
}

impl OutboxRelay {
    /// Create a relay worker.
    pub fn new(pool: PgPool, publisher: EventPublisher, config: RelayConfig) -> Self {
        Self {
            pool,
            publisher,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the polling loop until shutdown is requested.
    pub async fn run(&self) {
        info!(
            target: "outbox_relay",
            instance_id = %self.config.instance_id,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Starting outbox relay"
        );

        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut archive = interval(Duration::from_secs(self.config.archive_interval_secs));

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!(
                            target: "outbox_relay",
                            instance_id = %self.config.instance_id,
                            "Shutdown requested, stopping relay"
                        );
                        break;
                    }
                    self.drain_cycle().await;
                }
                _ = archive.tick() => {
                    self.archive_published().await;
                }
            }
        }

        info!(target: "outbox_relay", instance_id = %self.config.instance_id, "Relay stopped");
    }

    /// Request graceful shutdown: no new claims; the in-flight batch finishes.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Claim one batch and forward each row. Returns the number of rows
    /// successfully handed off.
    pub async fn drain_cycle(&self) -> usize {
        let claimed = match OutboxMessage::claim_batch(
            &self.pool,
            &self.config.instance_id,
            ChronoDuration::seconds(self.config.claim_timeout_secs),
            self.config.batch_size,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    target: "outbox_relay",
                    instance_id = %self.config.instance_id,
                    error = %e,
                    "Failed to claim outbox batch"
                );
                return 0;
            }
        };

        if claimed.is_empty() {
            return 0;
        }

        debug!(
            target: "outbox_relay",
            instance_id = %self.config.instance_id,
            count = claimed.len(),
            "Claimed outbox rows"
        );

        let mut published = 0;
        for message in claimed {
            if self.forward(&message).await {
                published += 1;
            }
        }

        published
    }

    /// Hand one claimed row to the delivery channel.
    ///
    /// A failed hand-off releases the claim so a later cycle retries; the
    /// row is never marked published without an accepted hand-off.
    async fn forward(&self, message: &OutboxMessage) -> bool {
        let event = PipelineEvent::from_outbox(message);

        match self.publisher.publish(event) {
            Ok(_) => {
                if let Err(e) = OutboxMessage::mark_published(&self.pool, message.id).await {
                    // The hand-off happened; the row stays claimed and will be
                    // re-forwarded after the claim times out. Downstream dedup
                    // by event id absorbs the duplicate.
                    error!(
                        target: "outbox_relay",
                        message_id = %message.id,
                        error = %e,
                        "Hand-off succeeded but publish mark failed"
                    );
                    return false;
                }
                true
            }
            Err(e) => {
                warn!(
                    target: "outbox_relay",
                    message_id = %message.id,
                    aggregate_id = %message.aggregate_id,
                    error = %e,
                    "Hand-off failed, releasing claim"
                );
                if let Err(release_error) =
                    OutboxMessage::release_claim(&self.pool, message.id).await
                {
                    error!(
                        target: "outbox_relay",
                        message_id = %message.id,
                        error = %release_error,
                        "Failed to release outbox claim"
                    );
                }
                false
            }
        }
    }

    /// Delete published rows past the retention window.
    async fn archive_published(&self) {
        match OutboxMessage::archive_published(
            &self.pool,
            ChronoDuration::seconds(self.config.archive_after_secs),
        )
        .await
        {
            Ok(count) if count > 0 => {
                info!(target: "outbox_relay", count, "Archived published outbox rows");
            }
            Ok(_) => {}
            Err(e) => {
                error!(target: "outbox_relay", error = %e, "Failed to archive outbox rows");
            }
        }
    }
}
