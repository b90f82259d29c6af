//! Webhook dispatcher for the conveyor pipeline.
//!
//! Delivers relayed events to subscriber endpoints with HMAC-SHA256 signing,
//! exponential-backoff retries bounded by attempt count and retry window,
//! and a replayable dead-letter queue. At-least-once: a delivery may repeat
//! (for example when an acknowledgement is lost), never vanish.

pub mod backoff;
pub mod crypto;
pub mod error;
pub mod limiter;
pub mod models;
pub mod services;
pub mod validation;
pub mod worker;

pub use backoff::RetryPolicy;
pub use error::WebhookError;
pub use limiter::SubscriberLimiter;
pub use models::{WebhookPayload, HEADER_EVENT_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
pub use services::{DeliveryService, DlqService, SubscriptionRequest, SubscriptionService};
pub use worker::{WebhookWorker, WorkerConfig};
