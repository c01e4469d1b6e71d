//! Shared helpers for the integration tests
//!
//! Provides wiremock mounts for the token endpoint and a recording transport
//! that stamps every outbound request with the virtual clock's time.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Client, Request, Response};
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use reserva_auth::clock::{Clock, ManualClock};
use reserva_auth::rate_limit::FixedJitter;
use reserva_auth::source::RestSessionSource;
use reserva_auth::SessionRefreshCoordinator;
use reserva_core::config::{ProviderConfig, SessionConfig};

pub const TOKEN_PATH: &str = "/auth/v1/token";

/// Raw transport that forwards to reqwest and records when each request left
pub struct RecordingTransport {
    client: Client,
    clock: Arc<ManualClock>,
    sent: Mutex<Vec<(String, Instant)>>,
}

impl RecordingTransport {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            client: Client::new(),
            clock,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// `(url, sent_at)` for every request, in send order
    pub fn sent(&self) -> Vec<(String, Instant)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl reserva_auth::transport::RawTransport for RecordingTransport {
    async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        self.sent
            .lock()
            .unwrap()
            .push((request.url().to_string(), self.clock.now()));
        self.client.execute(request).await
    }
}

/// Everything a coordinator test needs to poke at
pub struct Harness {
    pub server: MockServer,
    pub clock: Arc<ManualClock>,
    pub raw: Arc<RecordingTransport>,
    pub source: Arc<RestSessionSource>,
    pub coordinator: SessionRefreshCoordinator,
}

/// Starts a mock provider and a coordinator signed in with `rt-initial`.
///
/// No endpoints are mounted; use the `mount_*` helpers.
pub async fn setup(config: SessionConfig) -> Harness {
    let server = MockServer::start().await;
    let clock = Arc::new(ManualClock::new());
    let raw = Arc::new(RecordingTransport::new(clock.clone()));

    let provider = ProviderConfig {
        base_url: server.uri(),
        api_key: Some("anon-key".to_string()),
        refresh_margin_secs: 30,
    };
    let source = Arc::new(
        RestSessionSource::new(&provider)
            .expect("mock server uri is a valid base url")
            .with_refresh_token("rt-initial"),
    );

    let coordinator = SessionRefreshCoordinator::with_parts(
        config,
        source.clone(),
        raw.clone(),
        clock.clone(),
        Box::new(FixedJitter(0.5)),
    );

    Harness {
        server,
        clock,
        raw,
        source,
        coordinator,
    }
}

/// Token response body.
///
/// `expires_in` is below the refresh margin, so every fetch that reaches
/// the source performs a new exchange.
pub fn token_body(access_token: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 10,
        "refresh_token": format!("{access_token}-refresh"),
        "user": { "id": "user-test-001", "email": "test@example.com" }
    })
}

/// Mounts a token endpoint that always succeeds with `access_token`
pub async fn mount_refresh_ok(server: &MockServer, access_token: &str) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(access_token)))
        .mount(server)
        .await;
}

/// Mounts a token endpoint answering 429 for the next `times` requests
pub async fn mount_refresh_rate_limited(server: &MockServer, retry_after: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", retry_after))
        .up_to_n_times(times)
        .with_priority(1)
        .mount(server)
        .await;
}

/// Number of requests the mock provider has received
pub async fn received(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|requests| requests.len())
        .unwrap_or(0)
}
