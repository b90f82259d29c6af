//! Subscription registration service.
//!
//! The subscriber-management collaborator calls into this service; the
//! dispatcher only ever reads subscriptions.

use sqlx::PgPool;
use uuid::Uuid;

use conveyor_db::models::{CreateWebhookSubscription, DeliveryAttempt, WebhookSubscription};

use crate::crypto;
use crate::error::WebhookError;
use crate::validation;

/// Registration input from the subscriber-management boundary.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub event_type: String,
    pub url: String,
    pub secret: Option<String>,
    pub active: bool,
}

/// Service for managing webhook subscriptions.
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    encryption_key: Vec<u8>,
    allow_http: bool,
}

impl SubscriptionService {
    /// Create a subscription service.
    pub fn new(pool: PgPool, encryption_key: Vec<u8>) -> Self {
        Self {
            pool,
            encryption_key,
            allow_http: false,
        }
    }

    /// Allow plain-HTTP endpoints (development and tests).
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Register a new subscription.
    ///
    /// Validates the endpoint URL and encrypts the shared secret before it
    /// touches storage; the plaintext secret is never persisted or logged.
    pub async fn register(
        &self,
        request: SubscriptionRequest,
    ) -> Result<WebhookSubscription, WebhookError> {
        validation::validate_endpoint_url(&request.url, self.allow_http)?;

        if request.event_type.is_empty() {
            return Err(WebhookError::Validation(
                "event_type must not be empty".to_string(),
            ));
        }

        let secret_encrypted = match request.secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                Some(crypto::encrypt_secret(secret, &self.encryption_key)?)
            }
            _ => None,
        };

        let subscription = WebhookSubscription::create(
            &self.pool,
            CreateWebhookSubscription {
                event_type: request.event_type,
                url: request.url,
                secret_encrypted,
                active: request.active,
            },
        )
        .await?;

        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %subscription.id,
            event_type = %subscription.event_type,
            "Subscription registered"
        );

        Ok(subscription)
    }

    /// Fetch a subscription.
    pub async fn get(&self, id: Uuid) -> Result<WebhookSubscription, WebhookError> {
        WebhookSubscription::find_by_id(&self.pool, id)
            .await?
            .ok_or(WebhookError::SubscriptionNotFound)
    }

    /// List subscriptions with pagination.
    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);
        Ok(WebhookSubscription::list(&self.pool, limit, offset).await?)
    }

    /// Activate or deactivate a subscription. Deactivation abandons its
    /// pending deliveries.
    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<(), WebhookError> {
        if !WebhookSubscription::set_active(&self.pool, id, active).await? {
            return Err(WebhookError::SubscriptionNotFound);
        }

        if !active {
            let abandoned =
                DeliveryAttempt::abandon_pending_for_subscription(&self.pool, id).await?;
            if abandoned > 0 {
                tracing::info!(
                    target: "webhook_delivery",
                    subscription_id = %id,
                    abandoned,
                    "Abandoned pending deliveries for deactivated subscription"
                );
            }
        }

        Ok(())
    }

    /// Remove a subscription and abandon its pending deliveries.
    pub async fn remove(&self, id: Uuid) -> Result<(), WebhookError> {
        DeliveryAttempt::abandon_pending_for_subscription(&self.pool, id).await?;

        if !WebhookSubscription::delete(&self.pool, id).await? {
            return Err(WebhookError::SubscriptionNotFound);
        }

        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %id,
            "Subscription removed"
        );

        Ok(())
    }
}
