//! Persistence layer for the conveyor write-and-delivery pipeline.
//!
//! Owns the connection pool, the embedded SQL migrations, and the persisted
//! models: versioned aggregates, idempotent command records, outbox messages,
//! webhook subscriptions, delivery attempts, and the dead-letter queue.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;

pub use error::DbError;
pub use migrations::run_migrations;
pub use pool::DbPool;
