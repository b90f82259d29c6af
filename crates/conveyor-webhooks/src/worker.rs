//! Webhook dispatcher worker.
//!
//! Consumes fresh events from the relay's delivery channel and polls the
//! attempt table for due retries. Delivery concurrency is bounded by a
//! semaphore so one slow subscriber cannot starve the pool; graceful
//! shutdown lets in-flight deliveries finish.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use conveyor_db::models::DeliveryAttempt;
use conveyor_events::{EventPublisher, PipelineEvent};

use crate::error::WebhookError;
use crate::services::DeliveryService;

/// Dispatcher worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent deliveries in flight.
    pub concurrency: usize,

    /// How often to poll for due retries (in milliseconds).
    pub poll_interval_ms: u64,

    /// Maximum due retries claimed per poll.
    pub batch_size: i64,

    /// How often to release attempts stuck in `delivering` (in seconds).
    pub stuck_release_interval_secs: u64,

    /// Age after which a `delivering` attempt counts as stuck (in seconds).
    pub stuck_timeout_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            batch_size: 25,
            stuck_release_interval_secs: 300,
            stuck_timeout_secs: 120,
        }
    }
}

impl WorkerConfig {
    /// Build a configuration from `CONVEYOR_DISPATCH_*` environment
    /// variables, falling back to defaults for unset values.
    pub fn from_env() -> Result<Self, WebhookError> {
        let mut config = Self::default();

        if let Some(v) = read_env("CONVEYOR_DISPATCH_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = read_env("CONVEYOR_DISPATCH_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = read_env("CONVEYOR_DISPATCH_BATCH_SIZE")? {
            config.batch_size = v;
        }

        Ok(config)
    }
}

fn read_env<T: std::str::FromStr>(var: &str) -> Result<Option<T>, WebhookError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| WebhookError::Internal(format!("invalid {var}: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

/// Background worker driving the webhook dispatcher.
pub struct WebhookWorker {
    service: Arc<DeliveryService>,
    publisher: EventPublisher,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl WebhookWorker {
    /// Create a worker attached to the relay's delivery channel.
    pub fn new(service: Arc<DeliveryService>, publisher: EventPublisher, config: WorkerConfig) -> Self {
        Self {
            service,
            publisher,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run until shutdown is requested.
    pub async fn run(&self) {
        info!(
            target: "webhook_delivery",
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting webhook worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut receiver = self.publisher.subscribe();
        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut stuck = interval(Duration::from_secs(self.config.stuck_release_interval_secs));

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(target: "webhook_delivery", "Shutdown requested, stopping worker");
                break;
            }

            tokio::select! {
                _ = poll.tick() => {
                    self.poll_due(&semaphore).await;
                }
                _ = stuck.tick() => {
                    self.release_stuck().await;
                }
                received = receiver.recv() => match received {
                    Ok(event) => self.spawn_dispatch(event, &semaphore).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            target: "webhook_delivery",
                            missed,
                            "Delivery channel lagged; dropped events resurface via relay reclaim"
                        );
                    }
                    Err(RecvError::Closed) => {
                        info!(target: "webhook_delivery", "Delivery channel closed, stopping worker");
                        break;
                    }
                }
            }
        }

        // Wait for in-flight deliveries to complete.
        let _ = semaphore.acquire_many(self.config.concurrency as u32).await;
        info!(target: "webhook_delivery", "Webhook worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Fan a fresh event out in a bounded background task.
    async fn spawn_dispatch(&self, event: PipelineEvent, semaphore: &Arc<Semaphore>) {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };

        let service = self.service.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let started = service.dispatch(&event).await;
            debug!(
                target: "webhook_delivery",
                event_id = %event.event_id,
                started,
                "Dispatched event"
            );
        });
    }

    /// Claim due retries and execute each in a bounded background task.
    async fn poll_due(&self, semaphore: &Arc<Semaphore>) {
        let due = match DeliveryAttempt::claim_due(self.service.pool(), self.config.batch_size).await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    target: "webhook_delivery",
                    error = %e,
                    "Failed to claim due delivery attempts"
                );
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        debug!(
            target: "webhook_delivery",
            count = due.len(),
            "Claimed due delivery attempts"
        );

        for attempt in due {
            // Claimed rows must be processed; block for a slot instead of
            // leaving them stuck in `delivering`.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                return;
            };

            let service = self.service.clone();
            tokio::spawn(async move {
                let _permit = permit;
                service.process_due(attempt).await;
            });
        }
    }

    /// Return attempts orphaned in `delivering` by a dead worker to `pending`.
    async fn release_stuck(&self) {
        match DeliveryAttempt::release_stuck(
            self.service.pool(),
            chrono::Duration::seconds(self.config.stuck_timeout_secs),
        )
        .await
        {
            Ok(count) if count > 0 => {
                warn!(
                    target: "webhook_delivery",
                    count,
                    "Released stuck delivery attempts"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    target: "webhook_delivery",
                    error = %e,
                    "Failed to release stuck delivery attempts"
                );
            }
        }
    }
}
