//! Webhook delivery execution.
//!
//! For each relayed event, resolves the matching active subscriptions,
//! records a delivery attempt, executes a signed HTTP POST, and either
//! schedules a retry or dead-letters the delivery. Per (subscription,
//! message) pair the attempt rows walk the state machine
//! `pending -> delivering -> succeeded | failed | dead_lettered`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use sqlx::PgPool;

use conveyor_db::models::{CreateDeliveryAttempt, DeliveryAttempt, WebhookSubscription};
use conveyor_events::PipelineEvent;

use crate::backoff::RetryPolicy;
use crate::crypto;
use crate::error::WebhookError;
use crate::limiter::SubscriberLimiter;
use crate::models::{WebhookPayload, HEADER_EVENT_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::services::dlq_service::DlqService;

/// Per-attempt HTTP timeout.
pub const DELIVERY_TIMEOUT_SECS: u64 = 10;

/// Consecutive failures before a subscription is auto-disabled.
pub const DEFAULT_DISABLE_THRESHOLD: i32 = 50;

/// Service executing webhook deliveries.
#[derive(Clone)]
pub struct DeliveryService {
    pool: PgPool,
    http_client: Client,
    encryption_key: Vec<u8>,
    retry_policy: RetryPolicy,
    disable_threshold: i32,
    dlq: DlqService,
    limiter: Arc<SubscriberLimiter>,
}

impl DeliveryService {
    /// Create a delivery service with a shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn new(pool: PgPool, encryption_key: Vec<u8>) -> Result<Self, WebhookError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(DELIVERY_TIMEOUT_SECS))
            .user_agent("conveyor-webhooks/0.3")
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            dlq: DlqService::new(pool.clone()),
            pool,
            http_client,
            encryption_key,
            retry_policy: RetryPolicy::default(),
            disable_threshold: DEFAULT_DISABLE_THRESHOLD,
            limiter: Arc::new(SubscriberLimiter::default()),
        })
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the auto-disable threshold.
    #[must_use]
    pub fn with_disable_threshold(mut self, threshold: i32) -> Self {
        self.disable_threshold = threshold;
        self
    }

    /// Override the per-subscriber delivery limiter.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<SubscriberLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Connection pool accessor for the worker.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fan an event out to every matching active subscription.
    ///
    /// Returns the number of deliveries started. Failures are recorded and
    /// retried per policy; nothing propagates to the event source.
    pub async fn dispatch(&self, event: &PipelineEvent) -> usize {
        let subscriptions = match WebhookSubscription::find_active_by_event_type(
            &self.pool,
            &event.event_type,
        )
        .await
        {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to resolve subscriptions"
                );
                return 0;
            }
        };

        if subscriptions.is_empty() {
            tracing::debug!(
                target: "webhook_delivery",
                event_id = %event.event_id,
                event_type = %event.event_type,
                "No active subscriptions for event type"
            );
            return 0;
        }

        let payload = match serde_json::to_value(WebhookPayload::from_event(event)) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to serialize webhook payload"
                );
                return 0;
            }
        };

        let mut started = 0;
        for subscription in subscriptions {
            if self
                .start_delivery(&subscription, event, payload.clone())
                .await
            {
                started += 1;
            }
        }
        started
    }

    /// Record attempt 1 for a subscription and deliver immediately.
    async fn start_delivery(
        &self,
        subscription: &WebhookSubscription,
        event: &PipelineEvent,
        payload: serde_json::Value,
    ) -> bool {
        let created = DeliveryAttempt::create(
            &self.pool,
            CreateDeliveryAttempt {
                subscription_id: subscription.id,
                outbox_message_id: event.event_id,
                event_type: event.event_type.clone(),
                payload,
                attempt_number: 1,
                next_retry_at: None,
                first_attempted_at: None,
            },
        )
        .await;

        let attempt = match created {
            Ok(attempt) => attempt,
            Err(e) => {
                // A second hand-off of the same event lands here via the
                // unique (subscription, message, attempt) constraint; the
                // first delivery already owns the pair.
                tracing::debug!(
                    target: "webhook_delivery",
                    subscription_id = %subscription.id,
                    event_id = %event.event_id,
                    error = %e,
                    "Skipping duplicate delivery"
                );
                return false;
            }
        };

        // Claim the row; a concurrently polling worker may have beaten us.
        match DeliveryAttempt::begin_delivery(&self.pool, attempt.id).await {
            Ok(Some(claimed)) => {
                self.execute(&claimed, subscription).await;
                true
            }
            Ok(None) => true,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    attempt_id = %attempt.id,
                    error = %e,
                    "Failed to claim fresh delivery attempt"
                );
                false
            }
        }
    }

    /// Execute a claimed due attempt coming from the retry poller.
    pub async fn process_due(&self, attempt: DeliveryAttempt) {
        let subscription =
            match WebhookSubscription::find_by_id(&self.pool, attempt.subscription_id).await {
                Ok(Some(sub)) if sub.active => sub,
                Ok(Some(_)) => {
                    self.abandon(&attempt, "subscription disabled").await;
                    return;
                }
                Ok(None) => {
                    self.abandon(&attempt, "subscription deleted").await;
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        attempt_id = %attempt.id,
                        error = %e,
                        "Failed to load subscription for retry"
                    );
                    return;
                }
            };

        self.execute(&attempt, &subscription).await;
    }

    /// Execute a single claimed attempt against the subscriber endpoint.
    pub async fn execute(&self, attempt: &DeliveryAttempt, subscription: &WebhookSubscription) {
        let body = match serde_json::to_vec(&attempt.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.handle_failure(
                    attempt,
                    subscription,
                    &format!("payload serialization failed: {e}"),
                    None,
                    None,
                )
                .await;
                return;
            }
        };

        let timestamp = Utc::now().timestamp().to_string();

        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(v) = "application/json".parse() {
            headers.insert(reqwest::header::CONTENT_TYPE, v);
        }
        if let Ok(v) = timestamp.parse() {
            headers.insert(HEADER_TIMESTAMP, v);
        }
        if let Ok(v) = attempt.outbox_message_id.to_string().parse() {
            headers.insert(HEADER_EVENT_ID, v);
        }

        if let Some(ref sealed) = subscription.secret_encrypted {
            match crypto::decrypt_secret(sealed, &self.encryption_key) {
                Ok(secret) => {
                    let signature = crypto::sign_payload(&secret, &timestamp, &body);
                    if let Ok(v) = format!("sha256={signature}").parse() {
                        headers.insert(HEADER_SIGNATURE, v);
                    }
                }
                Err(e) => {
                    // An unsignable delivery is a failure, not an unsigned send.
                    self.handle_failure(
                        attempt,
                        subscription,
                        &format!("secret decryption failed: {e}"),
                        None,
                        None,
                    )
                    .await;
                    return;
                }
            }
        }

        // Hold the subscriber's delivery slot for the duration of the call.
        let _slot = self.limiter.acquire(subscription.id).await;

        let start = Instant::now();
        let result = self
            .http_client
            .post(&subscription.url)
            .headers(headers)
            .body(body)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as i32;

        match result {
            Ok(response) => {
                let status_code = response.status().as_u16() as i16;
                if response.status().is_success() {
                    self.handle_success(attempt, subscription, status_code, latency_ms)
                        .await;
                } else {
                    self.handle_failure(
                        attempt,
                        subscription,
                        &format!("HTTP {status_code}"),
                        Some(status_code),
                        Some(latency_ms),
                    )
                    .await;
                }
            }
            Err(e) => {
                let message = if e.is_timeout() {
                    format!("request timeout ({DELIVERY_TIMEOUT_SECS}s)")
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request error: {e}")
                };

                self.handle_failure(attempt, subscription, &message, None, Some(latency_ms))
                    .await;
            }
        }
    }

    async fn handle_success(
        &self,
        attempt: &DeliveryAttempt,
        subscription: &WebhookSubscription,
        response_code: i16,
        latency_ms: i32,
    ) {
        tracing::info!(
            target: "webhook_delivery",
            attempt_id = %attempt.id,
            subscription_id = %subscription.id,
            event_id = %attempt.outbox_message_id,
            event_type = %attempt.event_type,
            attempt_number = attempt.attempt_number,
            response_code,
            latency_ms,
            "Delivery succeeded"
        );

        if let Err(e) =
            DeliveryAttempt::mark_succeeded(&self.pool, attempt.id, response_code, latency_ms).await
        {
            tracing::error!(
                target: "webhook_delivery",
                attempt_id = %attempt.id,
                error = %e,
                "Failed to record delivery success"
            );
        }

        if subscription.consecutive_failures > 0 {
            if let Err(e) =
                WebhookSubscription::reset_consecutive_failures(&self.pool, subscription.id).await
            {
                tracing::error!(
                    target: "webhook_delivery",
                    subscription_id = %subscription.id,
                    error = %e,
                    "Failed to reset consecutive failures"
                );
            }
        }
    }

    async fn handle_failure(
        &self,
        attempt: &DeliveryAttempt,
        subscription: &WebhookSubscription,
        error_message: &str,
        response_code: Option<i16>,
        latency_ms: Option<i32>,
    ) {
        let first_attempted_at = attempt.first_attempted_at.unwrap_or_else(Utc::now);
        let next_retry_at = self
            .retry_policy
            .next_retry_at(attempt.attempt_number, first_attempted_at);

        tracing::warn!(
            target: "webhook_delivery",
            attempt_id = %attempt.id,
            subscription_id = %subscription.id,
            event_id = %attempt.outbox_message_id,
            attempt_number = attempt.attempt_number,
            error = %error_message,
            has_next_retry = next_retry_at.is_some(),
            "Delivery failed"
        );

        match next_retry_at {
            Some(at) => {
                if let Err(e) = DeliveryAttempt::mark_failed(
                    &self.pool,
                    attempt.id,
                    error_message,
                    response_code,
                    latency_ms,
                )
                .await
                {
                    tracing::error!(
                        target: "webhook_delivery",
                        attempt_id = %attempt.id,
                        error = %e,
                        "Failed to record delivery failure"
                    );
                }

                if let Err(e) = DeliveryAttempt::create(
                    &self.pool,
                    CreateDeliveryAttempt {
                        subscription_id: attempt.subscription_id,
                        outbox_message_id: attempt.outbox_message_id,
                        event_type: attempt.event_type.clone(),
                        payload: attempt.payload.clone(),
                        attempt_number: attempt.attempt_number + 1,
                        next_retry_at: Some(at),
                        first_attempted_at: Some(first_attempted_at),
                    },
                )
                .await
                {
                    tracing::error!(
                        target: "webhook_delivery",
                        attempt_id = %attempt.id,
                        error = %e,
                        "Failed to schedule retry attempt"
                    );
                }
            }
            None => {
                // Retry budget exhausted: terminal state plus a DLQ entry.
                if let Err(e) =
                    DeliveryAttempt::mark_dead_lettered(&self.pool, attempt.id, error_message)
                        .await
                {
                    tracing::error!(
                        target: "webhook_delivery",
                        attempt_id = %attempt.id,
                        error = %e,
                        "Failed to mark attempt dead-lettered"
                    );
                }

                if let Err(e) = self
                    .dlq
                    .add(
                        subscription,
                        attempt,
                        error_message.to_string(),
                        response_code,
                    )
                    .await
                {
                    tracing::error!(
                        target: "webhook_delivery",
                        attempt_id = %attempt.id,
                        error = %e,
                        "Failed to write DLQ entry"
                    );
                }
            }
        }

        self.track_consecutive_failures(subscription).await;
    }

    /// Bump the failure counter and auto-disable past the threshold.
    async fn track_consecutive_failures(&self, subscription: &WebhookSubscription) {
        let failures =
            match WebhookSubscription::increment_consecutive_failures(&self.pool, subscription.id)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to increment consecutive failures"
                    );
                    return;
                }
            };

        if failures < self.disable_threshold {
            return;
        }

        tracing::warn!(
            target: "webhook_delivery",
            subscription_id = %subscription.id,
            consecutive_failures = failures,
            threshold = self.disable_threshold,
            "Auto-disabling subscription after consecutive failures"
        );

        if let Err(e) = WebhookSubscription::set_active(&self.pool, subscription.id, false).await {
            tracing::error!(
                target: "webhook_delivery",
                subscription_id = %subscription.id,
                error = %e,
                "Failed to auto-disable subscription"
            );
        }

        if let Err(e) =
            DeliveryAttempt::abandon_pending_for_subscription(&self.pool, subscription.id).await
        {
            tracing::error!(
                target: "webhook_delivery",
                subscription_id = %subscription.id,
                error = %e,
                "Failed to abandon pending deliveries"
            );
        }
    }

    async fn abandon(&self, attempt: &DeliveryAttempt, reason: &str) {
        tracing::info!(
            target: "webhook_delivery",
            attempt_id = %attempt.id,
            subscription_id = %attempt.subscription_id,
            reason,
            "Abandoning delivery attempt"
        );

        if let Err(e) = DeliveryAttempt::mark_abandoned(&self.pool, attempt.id, reason).await {
            tracing::error!(
                target: "webhook_delivery",
                attempt_id = %attempt.id,
                error = %e,
                "Failed to abandon delivery attempt"
            );
        }
    }
}
