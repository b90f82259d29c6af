//! Asynchronous hand-off side of the conveyor pipeline.
//!
//! The [`OutboxRelay`] drains committed outbox rows to the in-process
//! delivery channel ([`EventPublisher`]), at-least-once, preserving
//! per-aggregate order. Dispatchers attach to the channel as receivers.

pub mod error;
pub mod event;
pub mod publisher;
pub mod relay;

pub use error::EventError;
pub use event::PipelineEvent;
pub use publisher::{EventPublisher, DEFAULT_CHANNEL_CAPACITY};
pub use relay::{OutboxRelay, RelayConfig};
