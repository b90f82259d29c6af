//! Synchronous command path of the conveyor pipeline.
//!
//! Turns a client-issued state-changing request into an exactly-once-effective
//! mutation of a versioned aggregate plus atomically recorded outbox events.
//! The guard, executor, and writer are independent pieces composed by
//! [`CommandPipeline`]; each can be exercised in isolation.

pub mod command;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod idempotency;
pub mod outbox;

use std::sync::Arc;

use sqlx::PgPool;

pub use command::{
    CommandOutcome, CommandRequest, CommandStatus, DomainEvent, MutationHandler, MutationOutcome,
};
pub use error::PipelineError;
pub use executor::CommandExecutor;
pub use fingerprint::fingerprint;
pub use idempotency::IdempotencyGuard;
pub use outbox::OutboxWriter;

/// The command-submission boundary: idempotency guard wrapped around the
/// version-checked, outbox-appending executor.
#[derive(Clone)]
pub struct CommandPipeline {
    guard: IdempotencyGuard,
    executor: CommandExecutor,
}

impl CommandPipeline {
    /// Create a pipeline bound to a mutation handler.
    pub fn new(pool: PgPool, handler: Arc<dyn MutationHandler>) -> Self {
        Self {
            guard: IdempotencyGuard::new(pool.clone()),
            executor: CommandExecutor::new(pool, handler),
        }
    }

    /// Replace the default idempotency guard (polling configuration).
    #[must_use]
    pub fn with_guard(mut self, guard: IdempotencyGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Submit a command.
    ///
    /// Conflicts (`IdempotencyConflict`, `VersionConflict`) and the transient
    /// `ConcurrentRequestInFlight` surface here; asynchronous delivery
    /// failures never do.
    pub async fn submit(&self, request: CommandRequest) -> Result<CommandOutcome, PipelineError> {
        let fingerprint = fingerprint::fingerprint(&request.body);

        self.guard
            .guard(request.idempotency_key.as_deref(), &fingerprint, || {
                self.executor.execute(&request)
            })
            .await
    }
}
