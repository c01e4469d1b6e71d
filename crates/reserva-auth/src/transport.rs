//! Guarded HTTP transport
//!
//! Every outbound request to the auth provider passes through
//! [`HttpTransport::execute`], which wraps a [`RawTransport`] with the
//! rate-limit policy:
//!
//! 1. **Before sending**: while the provider limit is active, refresh-token
//!    exchanges are parked in the [`RetryQueue`] and resolve when replayed;
//!    any other request waits inline for at most `max_inline_wait` and is
//!    then sent regardless.
//! 2. **After receiving**: a 429 records a rejection (honouring
//!    `Retry-After`). A rejected refresh exchange goes back through the
//!    queue and is replayed once the limit expires; any other 429 is handed
//!    back for the caller's error path. A success resets backoff
//!    (non-refresh) or lifts the limit (refresh exchange).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::FutureExt;
use reqwest::{header::RETRY_AFTER, Client, Request, Response, StatusCode};
use reserva_core::config::SessionConfig;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    rate_limit::{parse_retry_after, RateLimitGuard},
    retry_queue::RetryQueue,
    SessionError,
};

// ============================================================================
// RawTransport
// ============================================================================

/// The underlying "perform HTTP request" operation
#[async_trait]
pub trait RawTransport: Send + Sync {
    async fn execute(&self, request: Request) -> reqwest::Result<Response>;
}

#[async_trait]
impl RawTransport for Client {
    async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        Client::execute(self, request).await
    }
}

/// How the rate-limit policy treats a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Exchange of a refresh token for a new session; queued when limited
    RefreshExchange,
    /// Anything else; waits inline for a bounded time when limited
    Other,
}

// ============================================================================
// HttpTransport
// ============================================================================

struct TransportInner {
    raw: Arc<dyn RawTransport>,
    guard: Arc<RateLimitGuard>,
    queue: RetryQueue,
    clock: Arc<dyn Clock>,
    max_inline_wait: Duration,
    refresh_pattern: String,
}

/// Rate-limit aware wrapper around a [`RawTransport`]
///
/// Cheap to clone; clones share the same limiter and queue.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("max_inline_wait", &self.inner.max_inline_wait)
            .field("refresh_pattern", &self.inner.refresh_pattern)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(
        raw: Arc<dyn RawTransport>,
        guard: Arc<RateLimitGuard>,
        queue: RetryQueue,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                raw,
                guard,
                queue,
                clock,
                max_inline_wait: config.max_inline_wait(),
                refresh_pattern: config.refresh_token_pattern.clone(),
            }),
        }
    }

    /// Classifies a request by matching its URL against the refresh pattern
    pub fn classify(&self, request: &Request) -> RequestKind {
        if request.url().as_str().contains(&self.inner.refresh_pattern) {
            RequestKind::RefreshExchange
        } else {
            RequestKind::Other
        }
    }

    /// Sends `request` under the rate-limit policy.
    ///
    /// Non-success responses are returned as `Ok` so the caller can map
    /// them; only transport failures and abandoned deferred requests are
    /// errors. A refresh exchange only resolves with a 429 when its body
    /// cannot be cloned for replay.
    pub async fn execute(&self, request: Request) -> Result<Response, SessionError> {
        match self.classify(&request) {
            RequestKind::RefreshExchange => self.execute_refresh(request).await,
            RequestKind::Other => {
                if let Some(wait) = self.inner.guard.rate_limit_wait() {
                    let capped = wait.min(self.inner.max_inline_wait);
                    debug!(
                        url = %request.url(),
                        wait_ms = capped.as_millis() as u64,
                        "Rate limited, waiting before sending"
                    );
                    self.inner.clock.sleep(capped).await;
                }
                self.send(RequestKind::Other, request).await
            }
        }
    }

    /// Sends a refresh exchange, deferring it while limited and requeueing
    /// it every time the provider answers 429
    async fn execute_refresh(&self, mut request: Request) -> Result<Response, SessionError> {
        loop {
            let replay = request.try_clone();
            let response = if self.inner.guard.rate_limit_wait().is_some() {
                self.defer(request).await?
            } else {
                self.send(RequestKind::RefreshExchange, request).await?
            };

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            match replay {
                Some(next) => {
                    info!(url = %next.url(), "Refresh exchange rejected, requeueing");
                    request = next;
                }
                None => {
                    warn!("Refresh exchange body cannot be replayed, returning 429");
                    return Ok(response);
                }
            }
        }
    }

    /// Parks a refresh exchange in the retry queue and waits for its replay
    async fn defer(&self, request: Request) -> Result<Response, SessionError> {
        let (tx, rx) = oneshot::channel();
        let transport = self.clone();
        info!(url = %request.url(), "Deferring refresh exchange until rate limit lifts");

        self.inner.queue.enqueue(Box::new(move || {
            async move {
                let result = transport
                    .send(RequestKind::RefreshExchange, request)
                    .await;
                let _ = tx.send(result);
            }
            .boxed()
        }));

        rx.await.map_err(|_| SessionError::Abandoned)?
    }

    async fn send(&self, kind: RequestKind, request: Request) -> Result<Response, SessionError> {
        let url = request.url().clone();
        let response = self.inner.raw.execute(request).await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            warn!(%url, ?kind, "Received 429 from provider");
            self.inner.guard.record_rejection(retry_after);
        } else if status.is_success() {
            match kind {
                RequestKind::Other => self.inner.guard.record_success(),
                RequestKind::RefreshExchange => self.inner.guard.record_refresh_success(),
            }
        }

        Ok(response)
    }

    /// Shared limiter this transport reports to
    pub fn guard(&self) -> &Arc<RateLimitGuard> {
        &self.inner.guard
    }

    /// Queue holding deferred refresh exchanges
    pub fn queue(&self) -> &RetryQueue {
        &self.inner.queue
    }
}
