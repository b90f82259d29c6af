//! Persisted models owned by the pipeline.

mod aggregate;
mod delivery_attempt;
mod dlq_entry;
mod idempotent_command;
mod outbox_message;
mod subscription;

pub use aggregate::AggregateRecord;
pub use delivery_attempt::{
    CreateDeliveryAttempt, DeliveryAttempt, DeliveryStatus,
};
pub use dlq_entry::{CreateDlqEntry, DlqEntry};
pub use idempotent_command::{
    ClaimResult, CommandState, IdempotentCommand, IDEMPOTENCY_TTL_HOURS,
    PROCESSING_TIMEOUT_SECONDS,
};
pub use outbox_message::OutboxMessage;
pub use subscription::{CreateWebhookSubscription, WebhookSubscription};
