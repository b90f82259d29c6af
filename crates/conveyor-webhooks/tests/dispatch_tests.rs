//! End-to-end dispatcher tests: fan-out, retry bookkeeping, dead-lettering,
//! and replay, against a mock subscriber endpoint.
//!
//! These tests need a live PostgreSQL instance; run them with
//! `DATABASE_URL=postgres://... cargo test --features integration`.

#![cfg(feature = "integration")]

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use conveyor_db::models::{DeliveryAttempt, DeliveryStatus, DlqEntry};
use conveyor_db::DbPool;
use conveyor_events::PipelineEvent;
use conveyor_webhooks::{
    DeliveryService, DlqService, RetryPolicy, SubscriptionRequest, SubscriptionService,
};

// The due-retry claim sweeps all pending attempts, so tests run serialized.
static DISPATCH_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn encryption_key() -> Vec<u8> {
    vec![0x42; 32]
}

/// Retries fire immediately so the whole schedule can be driven in-process.
fn immediate_retries(max_attempts: i32) -> RetryPolicy {
    RetryPolicy {
        base_delay_secs: 0,
        max_delay_secs: 0,
        max_attempts,
        max_window_secs: 86_400,
        jitter_ratio: 0.0,
    }
}

async fn setup() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect");

    conveyor_db::run_migrations(&DbPool::from_pool(pool.clone()))
        .await
        .expect("migrations failed");

    pool
}

async fn register_subscription(
    pool: &PgPool,
    event_type: &str,
    url: String,
    secret: Option<&str>,
) -> Uuid {
    let service = SubscriptionService::new(pool.clone(), encryption_key()).with_allow_http(true);
    service
        .register(SubscriptionRequest {
            event_type: event_type.to_string(),
            url,
            secret: secret.map(String::from),
            active: true,
        })
        .await
        .expect("failed to register subscription")
        .id
}

fn event(event_type: &str) -> PipelineEvent {
    PipelineEvent {
        event_id: Uuid::new_v4(),
        aggregate_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        occurred_at: Utc::now(),
        data: serde_json::json!({"name": "Acme"}),
    }
}

/// Drive due retries until the (subscription, message) pair settles into a
/// terminal status.
async fn drive_to_terminal(
    service: &DeliveryService,
    pool: &PgPool,
    subscription_id: Uuid,
    message_id: Uuid,
) -> Vec<DeliveryAttempt> {
    for _ in 0..50 {
        let attempts = DeliveryAttempt::list_for_pair(pool, subscription_id, message_id)
            .await
            .unwrap();
        if attempts.iter().any(|a| a.status().is_terminal()) {
            return attempts;
        }

        for attempt in DeliveryAttempt::claim_due(pool, 10).await.unwrap() {
            service.process_due(attempt).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("delivery never settled for message {message_id}");
}

#[tokio::test]
async fn test_three_failures_then_success_records_four_attempts() {
    let _guard = DISPATCH_LOCK.lock().await;
    let pool = setup().await;

    let server = MockServer::start().await;
    let failing = FailingResponder::fail_times(3);
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(failing.clone())
        .mount(&server)
        .await;

    let event_type = format!("created-{}", Uuid::new_v4());
    let subscription_id = register_subscription(
        &pool,
        &event_type,
        format!("{}/hook", server.uri()),
        Some(SECRET_1),
    )
    .await;

    let service = DeliveryService::new(pool.clone(), encryption_key())
        .unwrap()
        .with_retry_policy(immediate_retries(10));

    let event = event(&event_type);
    assert_eq!(service.dispatch(&event).await, 1);

    let attempts = drive_to_terminal(&service, &pool, subscription_id, event.event_id).await;

    // Exactly four rows with increasing attempt numbers, the last succeeded.
    assert_eq!(attempts.len(), 4);
    for (index, attempt) in attempts.iter().enumerate() {
        assert_eq!(attempt.attempt_number, index as i32 + 1);
    }
    assert_eq!(attempts[0].status(), DeliveryStatus::Failed);
    assert_eq!(attempts[1].status(), DeliveryStatus::Failed);
    assert_eq!(attempts[2].status(), DeliveryStatus::Failed);
    assert_eq!(attempts[3].status(), DeliveryStatus::Succeeded);

    // The fourth delivery's signature verifies with the registered secret.
    let requests = failing.requests();
    assert_eq!(requests.len(), 4);
    assert!(verify_captured_signature(&requests[3], SECRET_1));
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_and_replay() {
    let _guard = DISPATCH_LOCK.lock().await;
    let pool = setup().await;

    let server = MockServer::start().await;
    let failing = FailingResponder::fail_with_status(u32::MAX, 503);
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(failing.clone())
        .mount(&server)
        .await;

    let event_type = format!("created-{}", Uuid::new_v4());
    let subscription_id = register_subscription(
        &pool,
        &event_type,
        format!("{}/hook", server.uri()),
        Some(SECRET_1),
    )
    .await;

    let service = DeliveryService::new(pool.clone(), encryption_key())
        .unwrap()
        .with_retry_policy(immediate_retries(3));

    let event = event(&event_type);
    service.dispatch(&event).await;

    let attempts = drive_to_terminal(&service, &pool, subscription_id, event.event_id).await;

    // Three attempts, the last dead-lettered; no further attempts issued.
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].status(), DeliveryStatus::DeadLettered);
    assert_eq!(failing.attempt_count(), 3);

    // The delivery is retained for inspection, not dropped.
    let entries = DlqEntry::list(&pool, 100, 0).await.unwrap();
    let entry = entries
        .iter()
        .find(|e| e.event_id == event.event_id)
        .expect("dead-lettered delivery must have a DLQ entry");
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(entry.last_response_code, Some(503));

    // Replay re-enqueues a fresh attempt and is one-shot.
    let dlq = DlqService::new(pool.clone());
    let replayed = dlq.replay(entry.id).await.unwrap();
    assert_eq!(replayed.attempt_number, 4);
    assert_eq!(replayed.status(), DeliveryStatus::Pending);

    let again = dlq.replay(entry.id).await;
    assert!(matches!(
        again,
        Err(conveyor_webhooks::WebhookError::DlqEntryAlreadyReplayed)
    ));
}

#[tokio::test]
async fn test_dispatch_without_matching_subscription_is_noop() {
    let _guard = DISPATCH_LOCK.lock().await;
    let pool = setup().await;

    let service = DeliveryService::new(pool.clone(), encryption_key()).unwrap();
    let event = event(&format!("unmatched-{}", Uuid::new_v4()));

    assert_eq!(service.dispatch(&event).await, 0);
}

#[tokio::test]
async fn test_inactive_subscription_not_delivered() {
    let _guard = DISPATCH_LOCK.lock().await;
    let pool = setup().await;

    let server = MockServer::start().await;
    let capture = CaptureResponder::new();
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(capture.clone())
        .mount(&server)
        .await;

    let event_type = format!("created-{}", Uuid::new_v4());
    let subscription_id = register_subscription(
        &pool,
        &event_type,
        format!("{}/hook", server.uri()),
        None,
    )
    .await;

    let subscriptions = SubscriptionService::new(pool.clone(), encryption_key());
    subscriptions.set_active(subscription_id, false).await.unwrap();

    let service = DeliveryService::new(pool.clone(), encryption_key()).unwrap();
    assert_eq!(service.dispatch(&event(&event_type)).await, 0);
    assert_eq!(capture.request_count(), 0);
}

#[tokio::test]
async fn test_consecutive_failures_disable_subscription() {
    let _guard = DISPATCH_LOCK.lock().await;
    let pool = setup().await;

    let server = MockServer::start().await;
    let failing = FailingResponder::fail_with_status(u32::MAX, 500);
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(failing)
        .mount(&server)
        .await;

    let event_type = format!("created-{}", Uuid::new_v4());
    let subscription_id = register_subscription(
        &pool,
        &event_type,
        format!("{}/hook", server.uri()),
        None,
    )
    .await;

    let service = DeliveryService::new(pool.clone(), encryption_key())
        .unwrap()
        .with_retry_policy(immediate_retries(3))
        .with_disable_threshold(3);

    let event = event(&event_type);
    service.dispatch(&event).await;
    drive_to_terminal(&service, &pool, subscription_id, event.event_id).await;

    let subscriptions = SubscriptionService::new(pool.clone(), encryption_key());
    let subscription = subscriptions.get(subscription_id).await.unwrap();
    assert!(
        !subscription.active,
        "subscription must auto-disable after the failure threshold"
    );
}
