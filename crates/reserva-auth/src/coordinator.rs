//! Session refresh coordinator
//!
//! [`SessionRefreshCoordinator::get_session`] is the one entry point callers
//! use instead of asking the provider directly. Each call:
//!
//! 1. returns the cached result if it is still fresh;
//! 2. otherwise joins the in-flight fetch, or starts one;
//! 3. a new fetch counts as an initiation and may have to wait out the
//!    rate limiter, serving the last known session instead when there is one;
//! 4. the fetch goes through the guarded [`HttpTransport`] and a successful
//!    result is cached.
//!
//! [`SessionRefreshCoordinator::clear_cache`] resets everything after logout.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::FutureExt;
use reserva_core::{config::SessionConfig, domain::Session};
use tracing::{debug, info, warn};

use crate::{
    cache::SessionCache,
    clock::{Clock, TokioClock},
    coalesce::RequestCoalescer,
    rate_limit::{JitterSource, Permission, RandomJitter, RateLimitGuard, RateLimitSnapshot},
    retry_queue::RetryQueue,
    source::SessionSource,
    transport::{HttpTransport, RawTransport},
    SessionResult,
};

struct CoordinatorInner {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    guard: Arc<RateLimitGuard>,
    transport: HttpTransport,
    cache: SessionCache,
    coalescer: RequestCoalescer<SessionResult>,
    source: Arc<dyn SessionSource>,
    /// Bumped by `clear_cache`; fetches started before a clear don't cache
    epoch: AtomicU64,
}

/// Cached, coalesced and rate-limited access to the current session
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionRefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for SessionRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRefreshCoordinator")
            .field("config", &self.inner.config)
            .field("guard", &self.inner.guard)
            .field("transport", &self.inner.transport)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl SessionRefreshCoordinator {
    /// Creates a coordinator on the tokio clock with OS-seeded jitter
    pub fn new(
        config: SessionConfig,
        source: Arc<dyn SessionSource>,
        raw: Arc<dyn RawTransport>,
    ) -> Self {
        Self::with_parts(
            config,
            source,
            raw,
            Arc::new(TokioClock),
            Box::new(RandomJitter::new()),
        )
    }

    /// Creates a coordinator with an explicit clock and jitter source
    pub fn with_parts(
        config: SessionConfig,
        source: Arc<dyn SessionSource>,
        raw: Arc<dyn RawTransport>,
        clock: Arc<dyn Clock>,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        let guard = Arc::new(RateLimitGuard::with_jitter(
            config.clone(),
            Arc::clone(&clock),
            jitter,
        ));
        let queue = RetryQueue::new(
            Arc::clone(&guard),
            Arc::clone(&clock),
            config.retry_spacing(),
        );
        let transport = HttpTransport::new(
            raw,
            Arc::clone(&guard),
            queue,
            Arc::clone(&clock),
            &config,
        );
        let cache = SessionCache::new(config.cache_ttl(), Arc::clone(&clock));

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                clock,
                guard,
                transport,
                cache,
                coalescer: RequestCoalescer::new(),
                source,
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the current session, hitting the provider only when needed.
    ///
    /// Concurrent callers that miss the cache share one fetch and receive
    /// the same result, error included.
    pub async fn get_session(&self) -> SessionResult {
        if let Some(cached) = self.inner.cache.get() {
            return Ok(cached);
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .coalescer
            .run(move || inner.do_fetch().boxed())
            .await
    }

    /// Forgets every cached session and rate-limit counter (logout).
    ///
    /// The next `get_session` always fetches. Queued refresh exchanges are
    /// dropped and their callers receive `SessionError::Abandoned`.
    pub fn clear_cache(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.cache.clear();
        inner.coalescer.reset();
        inner.guard.reset();
        let abandoned = inner.transport.queue().clear();
        info!(abandoned, "Session cache cleared");
    }

    /// Copy of the rate limiter's counters
    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.inner.guard.snapshot()
    }

    /// Number of refresh exchanges waiting in the retry queue
    pub fn queued_requests(&self) -> usize {
        self.inner.transport.queue().len()
    }

    /// Whether a session fetch is currently outstanding
    pub fn is_fetch_in_flight(&self) -> bool {
        self.inner.coalescer.is_in_flight()
    }

    /// Age of the cached session result, if any
    pub fn cache_age(&self) -> Option<std::time::Duration> {
        self.inner.cache.age()
    }

    /// The guarded transport, for other provider calls that should share
    /// the same rate limit
    pub fn transport(&self) -> &HttpTransport {
        &self.inner.transport
    }
}

impl CoordinatorInner {
    async fn do_fetch(self: Arc<Self>) -> SessionResult {
        let epoch = self.epoch.load(Ordering::SeqCst);

        if self.guard.within_min_interval() {
            if let Some(last) = self.cache.last_known() {
                debug!("Last fetch too recent, serving last known session");
                return Ok(last);
            }
        }

        // permission comes from earlier initiations; a throttled call that
        // serves the last known session is not an initiation itself
        if let Permission::Wait(wait) = self.guard.can_proceed() {
            if let Some(last) = self.cache.last_known().filter(|s| !expired(s)) {
                info!(
                    wait_ms = wait.as_millis() as u64,
                    "Session fetch throttled, serving last known session"
                );
                return Ok(last);
            }
            let capped = wait.min(self.config.max_inline_wait());
            info!(
                wait_ms = capped.as_millis() as u64,
                "Session fetch throttled, waiting"
            );
            self.clock.sleep(capped).await;
        }
        self.guard.record_attempt();

        match self.source.fetch_session(&self.transport).await {
            Ok(session) => {
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    self.cache.set(session.clone());
                } else {
                    debug!("Cache cleared while fetching, result not cached");
                }
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "Session fetch failed");
                Err(err)
            }
        }
    }
}

fn expired(session: &Option<Session>) -> bool {
    session.as_ref().is_some_and(Session::is_expired)
}
