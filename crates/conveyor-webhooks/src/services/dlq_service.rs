//! Dead letter queue service.
//!
//! Deliveries that exhaust their retry budget land here. Entries are kept
//! for inspection and can be replayed once, which re-enqueues a fresh
//! delivery attempt with a fresh retry window.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use conveyor_db::models::{
    CreateDeliveryAttempt, CreateDlqEntry, DeliveryAttempt, DlqEntry, WebhookSubscription,
};

use crate::error::WebhookError;

/// Paginated DLQ listing.
#[derive(Debug, Clone)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    pub total: i64,
    pub has_more: bool,
}

/// Service for managing dead-lettered deliveries.
#[derive(Clone)]
pub struct DlqService {
    pool: PgPool,
}

impl DlqService {
    /// Create a DLQ service.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Dead-letter a delivery.
    pub async fn add(
        &self,
        subscription: &WebhookSubscription,
        attempt: &DeliveryAttempt,
        failure_reason: String,
        last_response_code: Option<i16>,
    ) -> Result<DlqEntry, WebhookError> {
        let entry = DlqEntry::create(
            &self.pool,
            CreateDlqEntry {
                subscription_id: subscription.id,
                subscription_url: subscription.url.clone(),
                event_id: attempt.outbox_message_id,
                event_type: attempt.event_type.clone(),
                payload: attempt.payload.clone(),
                failure_reason,
                last_response_code,
                attempt_count: attempt.attempt_number,
            },
        )
        .await?;

        tracing::warn!(
            target: "dlq",
            dlq_id = %entry.id,
            subscription_id = %subscription.id,
            event_id = %attempt.outbox_message_id,
            attempt_count = attempt.attempt_number,
            "Delivery dead-lettered"
        );

        Ok(entry)
    }

    /// List entries, newest first.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<DlqPage, WebhookError> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);

        let entries = DlqEntry::list(&self.pool, limit, offset).await?;
        let total = DlqEntry::count(&self.pool).await?;
        let has_more = offset + limit < total;

        Ok(DlqPage {
            entries,
            total,
            has_more,
        })
    }

    /// Fetch a single entry.
    pub async fn get(&self, id: Uuid) -> Result<DlqEntry, WebhookError> {
        DlqEntry::find_by_id(&self.pool, id)
            .await?
            .ok_or(WebhookError::DlqEntryNotFound)
    }

    /// Replay a dead-lettered delivery.
    ///
    /// Enqueues a fresh pending attempt (continuing the attempt sequence,
    /// with a reset retry window) and stamps the entry as replayed.
    /// Replaying is one-shot per entry.
    pub async fn replay(&self, id: Uuid) -> Result<DeliveryAttempt, WebhookError> {
        let entry = self.get(id).await?;

        if entry.replayed_at.is_some() {
            return Err(WebhookError::DlqEntryAlreadyReplayed);
        }

        let subscription = WebhookSubscription::find_by_id(&self.pool, entry.subscription_id)
            .await?
            .ok_or(WebhookError::SubscriptionNotFound)?;

        if !subscription.active {
            return Err(WebhookError::SubscriptionDisabled);
        }

        let existing =
            DeliveryAttempt::list_for_pair(&self.pool, entry.subscription_id, entry.event_id)
                .await?;
        let next_attempt_number = existing
            .iter()
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(entry.attempt_count)
            + 1;

        let attempt = DeliveryAttempt::create(
            &self.pool,
            CreateDeliveryAttempt {
                subscription_id: entry.subscription_id,
                outbox_message_id: entry.event_id,
                event_type: entry.event_type.clone(),
                payload: entry.payload.clone(),
                attempt_number: next_attempt_number,
                next_retry_at: Some(Utc::now()),
                first_attempted_at: None,
            },
        )
        .await?;

        if !DlqEntry::mark_replayed(&self.pool, id).await? {
            return Err(WebhookError::DlqEntryAlreadyReplayed);
        }

        tracing::info!(
            target: "dlq",
            dlq_id = %id,
            attempt_id = %attempt.id,
            subscription_id = %entry.subscription_id,
            "DLQ entry replayed"
        );

        Ok(attempt)
    }

    /// Delete an entry.
    pub async fn delete(&self, id: Uuid) -> Result<(), WebhookError> {
        if !DlqEntry::delete(&self.pool, id).await? {
            return Err(WebhookError::DlqEntryNotFound);
        }
        Ok(())
    }
}
