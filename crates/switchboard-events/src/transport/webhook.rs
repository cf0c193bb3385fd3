// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Webhook transport: signed JSON POSTs with bounded retry.
//!
//! Each subscription maps to one registered endpoint. Bodies are signed
//! with HMAC-SHA256 when the endpoint carries a secret; retries use
//! exponential backoff with jitter and only for 408, 429, and 5xx
//! responses. Other 4xx are permanent failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::errors::{Error, Result};
use crate::event::AuditEvent;
use crate::transport::{EventTransport, HealthTracker, TransportProtocol, DEFAULT_HEALTH_TIMEOUT};
use crate::EVENT_SCHEMA_VERSION;

type HmacSha256 = Hmac<Sha256>;

/// Signature header carried on every signed request.
pub const SIGNATURE_HEADER: &str = "X-Signature-SHA256";

/// One registered webhook destination.
#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
    pub url: String,
    pub secret: Option<String>,
    pub enabled: bool,
}

impl WebhookEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            enabled: true,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Webhook transport tuning.
#[derive(Debug, Clone)]
pub struct WebhookTransportConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Attempts per delivery (1 = no retry).
    pub max_attempts: u32,
    /// Base retry delay.
    pub base_delay: Duration,
    /// Exponential factor per retry.
    pub backoff_factor: f64,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Send-recency window for health.
    pub health_timeout: Duration,
}

impl Default for WebhookTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

/// Hex HMAC-SHA256 over the body, formatted for the signature header.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").expect("hmac accepts any key"));
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// HTTP POST transport with per-endpoint signing.
pub struct WebhookTransport {
    client: reqwest::Client,
    config: WebhookTransportConfig,
    endpoints: RwLock<HashMap<Uuid, WebhookEndpoint>>,
    health: HealthTracker,
}

impl WebhookTransport {
    pub fn new(config: WebhookTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            health: HealthTracker::new(config.health_timeout),
            endpoints: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Register (or replace) the endpoint for a subscription.
    pub fn register_endpoint(&self, subscription_id: Uuid, endpoint: WebhookEndpoint) {
        self.endpoints.write().insert(subscription_id, endpoint);
    }

    pub fn remove_endpoint(&self, subscription_id: Uuid) -> bool {
        self.endpoints.write().remove(&subscription_id).is_some()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.max(1.0).powi(attempt as i32);
        let base = self.config.base_delay.as_millis() as f64 * factor;
        let capped = base.min(self.config.max_delay.as_millis() as f64) as u64;
        // 0-25% jitter to decorrelate retry storms.
        let jitter = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
        Duration::from_millis(capped + jitter)
    }

    async fn post_with_retry(
        &self,
        endpoint: &WebhookEndpoint,
        body: &str,
        event_id: &str,
        event_type: &str,
    ) -> Result<()> {
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.config.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            let mut request = self
                .client
                .post(&endpoint.url)
                .header("Content-Type", "application/json")
                .header("X-Event-Id", event_id)
                .header("X-Event-Type", event_type)
                .header("X-Event-Version", EVENT_SCHEMA_VERSION.to_string())
                .body(body.to_string());
            if let Some(secret) = &endpoint.secret {
                request = request.header(SIGNATURE_HEADER, sign_body(secret, body.as_bytes()));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.health.note_success();
                        return Ok(());
                    }
                    if !is_retryable_status(status) {
                        return Err(Error::Transport(format!(
                            "webhook {} answered permanent {status}",
                            endpoint.url
                        )));
                    }
                    tracing::warn!(
                        url = %endpoint.url,
                        status = %status,
                        attempt = attempt + 1,
                        "retryable webhook response"
                    );
                    last_error = Some(Error::Transport(format!(
                        "webhook {} answered {status}",
                        endpoint.url
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        url = %endpoint.url,
                        error = %e,
                        attempt = attempt + 1,
                        "webhook request failed"
                    );
                    last_error = Some(Error::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Transport(format!("webhook {} failed with no attempts", endpoint.url))
        }))
    }

    async fn deliver(&self, body: String, event_id: String, event_type: &str, ids: &[Uuid]) -> Result<()> {
        let endpoints: Vec<(Uuid, WebhookEndpoint)> = {
            let registry = self.endpoints.read();
            ids.iter()
                .filter_map(|id| registry.get(id).map(|e| (*id, e.clone())))
                .filter(|(_, e)| e.enabled)
                .collect()
        };
        if endpoints.is_empty() {
            return Err(Error::NotFound(format!(
                "no enabled webhook endpoints among {} subscribers",
                ids.len()
            )));
        }

        let mut failures = 0usize;
        for (id, endpoint) in &endpoints {
            if let Err(e) = self
                .post_with_retry(endpoint, &body, &event_id, event_type)
                .await
            {
                failures += 1;
                tracing::warn!(subscription = %id, url = %endpoint.url, error = %e, "webhook delivery failed");
            }
        }
        if failures > 0 {
            return Err(Error::Transport(format!(
                "webhook delivery failed for {failures}/{} endpoints",
                endpoints.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventTransport for WebhookTransport {
    async fn send(&self, event: &AuditEvent, subscriber_ids: &[Uuid]) -> Result<()> {
        let envelope = EventEnvelope::from_event(event);
        let body = envelope.to_json()?;
        self.deliver(
            body,
            event.id.to_string(),
            event.event_type.as_str(),
            subscriber_ids,
        )
        .await
    }

    async fn send_batch(&self, events: &[AuditEvent], subscriber_ids: &[Uuid]) -> Result<()> {
        let envelopes: Vec<EventEnvelope> =
            events.iter().map(EventEnvelope::from_event).collect();
        let body = serde_json::to_string(&envelopes)?;
        let first_id = events
            .first()
            .map(|e| e.id.to_string())
            .unwrap_or_default();
        let first_type = events
            .first()
            .map(|e| e.event_type.as_str())
            .unwrap_or("batch");
        self.deliver(body, first_id, first_type, subscriber_ids).await
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Webhook
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    async fn close(&self) {
        self.endpoints.write().clear();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Severity};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn event() -> AuditEvent {
        AuditEvent::new(
            EventType::CallCreated,
            Severity::Info,
            "call",
            "call-1",
            "create",
            "success",
        )
    }

    fn transport(max_attempts: u32) -> WebhookTransport {
        WebhookTransport::new(WebhookTransportConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..WebhookTransportConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn signature_is_stable_hex_hmac() {
        let sig = sign_body("secret", b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        // Deterministic.
        assert_eq!(sig, sign_body("secret", b"{\"a\":1}"));
        // Key-sensitive.
        assert_ne!(sig, sign_body("other", b"{\"a\":1}"));
    }

    #[test]
    fn retryable_statuses() {
        use reqwest::StatusCode;
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn posts_envelope_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("X-Event-Id"))
            .and(header_exists("X-Event-Type"))
            .and(header_exists("X-Event-Version"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(1);
        let sub = Uuid::new_v4();
        t.register_endpoint(sub, WebhookEndpoint::new(format!("{}/hook", server.uri())));

        t.send(&event(), &[sub]).await.unwrap();
        assert!(t.is_healthy());
    }

    #[tokio::test]
    async fn signs_body_when_secret_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(1);
        let sub = Uuid::new_v4();
        t.register_endpoint(
            sub,
            WebhookEndpoint::new(server.uri()).with_secret("hook-secret"),
        );
        t.send(&event(), &[sub]).await.unwrap();

        let requests: Vec<Request> = server.received_requests().await.unwrap();
        let request = &requests[0];
        let signature = request
            .headers
            .get(SIGNATURE_HEADER)
            .expect("signature header present")
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(signature, sign_body("hook-secret", &request.body));
    }

    #[tokio::test]
    async fn retries_5xx_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(3);
        let sub = Uuid::new_v4();
        t.register_endpoint(sub, WebhookEndpoint::new(server.uri()));
        t.send(&event(), &[sub]).await.unwrap();
    }

    #[tokio::test]
    async fn permanent_4xx_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(3);
        let sub = Uuid::new_v4();
        t.register_endpoint(sub, WebhookEndpoint::new(server.uri()));
        let err = t.send(&event(), &[sub]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let t = transport(2);
        let sub = Uuid::new_v4();
        t.register_endpoint(sub, WebhookEndpoint::new(server.uri()));
        assert!(t.send(&event(), &[sub]).await.is_err());
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let t = transport(1);
        let err = t.send(&event(), &[Uuid::new_v4()]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_posts_envelope_array() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(1);
        let sub = Uuid::new_v4();
        t.register_endpoint(sub, WebhookEndpoint::new(server.uri()));
        t.send_batch(&[event(), event()], &[sub]).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn endpoint_registry_round_trip() {
        let t = transport(1);
        let sub = Uuid::new_v4();
        t.register_endpoint(sub, WebhookEndpoint::new("http://localhost/hook"));
        assert_eq!(t.endpoint_count(), 1);
        assert!(t.remove_endpoint(sub));
        assert!(!t.remove_endpoint(sub));
        assert_eq!(t.endpoint_count(), 0);
    }
}
