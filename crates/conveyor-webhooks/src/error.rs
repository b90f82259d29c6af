//! Error types for the webhook dispatcher.

use thiserror::Error;

/// Webhook dispatcher error variants.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("Subscription is not active")]
    SubscriptionDisabled,

    #[error("DLQ entry not found")]
    DlqEntryNotFound,

    #[error("DLQ entry was already replayed")]
    DlqEntryAlreadyReplayed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal webhook error: {0}")]
    Internal(String),
}

pub type WebhookResult<T> = Result<T, WebhookError>;
