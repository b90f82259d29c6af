//! Webhook dispatcher services.

pub mod delivery_service;
pub mod dlq_service;
pub mod subscription_service;

pub use delivery_service::DeliveryService;
pub use dlq_service::DlqService;
pub use subscription_service::{SubscriptionRequest, SubscriptionService};
