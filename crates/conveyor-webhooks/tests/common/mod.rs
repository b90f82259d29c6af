//! Shared helpers for conveyor-webhooks integration tests.
//!
//! Provides wiremock responders and a small delivery client so the wire
//! format (headers, signature, payload shape) can be verified without a
//! database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

use conveyor_webhooks::crypto;
use conveyor_webhooks::{WebhookPayload, HEADER_EVENT_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};

/// Standard test secrets.
pub const SECRET_1: &str = "whsec_conveyor_test_12345";
pub const SECRET_2: &str = "whsec_conveyor_other_67890";

// ---------------------------------------------------------------------------
// CapturedRequest
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == wanted)
            .map(|(_, v)| v.as_str())
    }
}

fn capture(request: &Request) -> CapturedRequest {
    CapturedRequest {
        body: request.body.clone(),
        headers: request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
        received_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Responders
// ---------------------------------------------------------------------------

/// Captures every request and responds with a fixed status.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.lock().unwrap().push(capture(request));
        ResponseTemplate::new(self.response_code)
    }
}

/// Fails the first `n` requests with a configurable status, then succeeds.
/// Captures everything it sees.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            failures_before_success: n,
            failure_code,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Respond for FailingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.lock().unwrap().push(capture(request));
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

/// Delays each response; used to exercise delivery timeouts.
#[derive(Clone)]
pub struct DelayedResponder {
    delay_ms: u64,
    response_code: u16,
}

impl DelayedResponder {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            response_code: 200,
        }
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(self.response_code)
            .set_delay(std::time::Duration::from_millis(self.delay_ms))
    }
}

// ---------------------------------------------------------------------------
// Signature verification helpers
// ---------------------------------------------------------------------------

/// Verify the signature header of a captured delivery.
pub fn verify_captured_signature(request: &CapturedRequest, secret: &str) -> bool {
    let Some(signature_header) = request.header(HEADER_SIGNATURE) else {
        return false;
    };
    let Some(timestamp) = request.header(HEADER_TIMESTAMP) else {
        return false;
    };
    let Some(signature_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    crypto::verify_payload(signature_hex, secret, timestamp, &request.body)
}

// ---------------------------------------------------------------------------
// Test delivery client
// ---------------------------------------------------------------------------

/// Minimal client that speaks the dispatcher's wire format, for verifying
/// endpoint behavior without a database.
pub struct TestDeliveryClient {
    client: reqwest::Client,
}

impl TestDeliveryClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// POST a payload the way `DeliveryService` does, optionally signed.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &WebhookPayload,
        secret: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let body = serde_json::to_vec(payload).expect("failed to serialize payload");
        let timestamp = Utc::now().timestamp().to_string();

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(HEADER_TIMESTAMP, &timestamp)
            .header(HEADER_EVENT_ID, payload.event_id.to_string());

        if let Some(secret) = secret {
            let signature = crypto::sign_payload(secret, &timestamp, &body);
            request = request.header(HEADER_SIGNATURE, format!("sha256={signature}"));
        }

        request.body(body).send().await
    }
}

impl Default for TestDeliveryClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Payload fixtures
// ---------------------------------------------------------------------------

/// A `created` payload for a fresh aggregate.
pub fn created_payload() -> WebhookPayload {
    WebhookPayload {
        event_id: Uuid::new_v4(),
        event_type: "created".to_string(),
        occurred_at: Utc::now(),
        data: serde_json::json!({"name": "Acme"}),
    }
}

/// An `updated` payload with custom data.
pub fn updated_payload(data: serde_json::Value) -> WebhookPayload {
    WebhookPayload {
        event_id: Uuid::new_v4(),
        event_type: "updated".to_string(),
        occurred_at: Utc::now(),
        data,
    }
}
