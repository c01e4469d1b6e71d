//! Rate limiting and backoff for session fetches
//!
//! Keeps the session path from exceeding the provider's request limits.
//!
//! ## Architecture
//!
//! - [`RateLimitGuard`]: counts fetch initiations in a rolling window, records
//!   429 rejections and successes, and decides whether a new call may proceed
//! - [`JitterSource`]: randomness used to spread out backoff across clients
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reserva_auth::{clock::TokioClock, rate_limit::{Permission, RateLimitGuard}};
//! use reserva_core::config::SessionConfig;
//!
//! # async fn example() {
//! let guard = RateLimitGuard::new(SessionConfig::default(), Arc::new(TokioClock));
//! guard.record_attempt();
//! if let Permission::Wait(wait) = guard.can_proceed() {
//!     tokio::time::sleep(wait).await;
//! }
//! # }
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use reserva_core::config::SessionConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Growth factor of the count-window wait per extra initiation
const COUNT_BACKOFF_BASE: f64 = 1.5;

/// Jitter multiplier bounds applied to each backoff doubling
const JITTER_MIN: f64 = 0.8;
const JITTER_SPAN: f64 = 0.4;

/// Longest Retry-After the provider is taken at its word for
const MAX_RETRY_AFTER_SECS: u64 = 3600;

// ============================================================================
// JitterSource
// ============================================================================

/// Uniform random samples in `[0, 1)` used for backoff jitter
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Jitter drawn from a `fastrand` generator
pub struct RandomJitter {
    rng: Mutex<fastrand::Rng>,
}

impl RandomJitter {
    /// Generator seeded from the OS
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Reproducible generator for tests
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .f64()
    }
}

/// Jitter that always returns the same sample
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

// ============================================================================
// Permission / snapshot
// ============================================================================

/// Answer of [`RateLimitGuard::can_proceed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// A new call may be issued now
    Allowed,
    /// Callers should wait this long before issuing a new call
    Wait(Duration),
}

impl Permission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Permission::Allowed)
    }
}

/// Point-in-time copy of the guard's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub refresh_count: u32,
    pub consecutive_errors: u32,
    pub backoff_time: Duration,
    pub is_rate_limited: bool,
    pub rate_limited_until: Option<Instant>,
    pub last_refresh_time: Option<Instant>,
}

// ============================================================================
// RateLimitGuard
// ============================================================================

#[derive(Debug)]
struct GuardState {
    /// When the last fetch was initiated
    last_refresh_time: Option<Instant>,
    /// Initiations inside the current counting window
    refresh_count: u32,
    consecutive_errors: u32,
    /// Current backoff quantum
    backoff_time: Duration,
    is_rate_limited: bool,
    rate_limited_until: Option<Instant>,
}

impl GuardState {
    fn new(initial_backoff: Duration) -> Self {
        Self {
            last_refresh_time: None,
            refresh_count: 0,
            consecutive_errors: 0,
            backoff_time: initial_backoff,
            is_rate_limited: false,
            rate_limited_until: None,
        }
    }
}

/// Tracks fetch initiations and provider rate limits.
///
/// Every method performs its read-modify-write under one short lock and never
/// awaits, so concurrent tasks always observe consistent counters.
pub struct RateLimitGuard {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    jitter: Box<dyn JitterSource>,
    state: Mutex<GuardState>,
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}

impl RateLimitGuard {
    /// Creates a guard with OS-seeded jitter
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_jitter(config, clock, Box::new(RandomJitter::new()))
    }

    /// Creates a guard with an explicit jitter source
    pub fn with_jitter(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        let state = Mutex::new(GuardState::new(config.initial_backoff()));
        Self {
            config,
            clock,
            jitter,
            state,
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that a session fetch is being initiated.
    ///
    /// Inside the counting window the count grows; once the window has
    /// elapsed since the previous initiation the count restarts at 1.
    pub fn record_attempt(&self) {
        let now = self.clock.now();
        let window = self.config.refresh_count_window();
        let mut state = self.state();

        state.refresh_count = match state.last_refresh_time {
            Some(last) if now.saturating_duration_since(last) < window => {
                state.refresh_count.saturating_add(1)
            }
            _ => 1,
        };
        state.last_refresh_time = Some(now);

        debug!(
            refresh_count = state.refresh_count,
            "Recorded session fetch initiation"
        );
    }

    /// Decides whether a new fetch may be issued now.
    ///
    /// An active provider limit takes precedence; otherwise exceeding
    /// `max_refresh_count` inside the window yields an exponential wait
    /// measured from the last initiation. Callers ask before recording
    /// their own initiation, so the wait shrinks as time since the
    /// previous one grows.
    pub fn can_proceed(&self) -> Permission {
        let now = self.clock.now();
        let state = self.state();

        if let Some(wait) = Self::limit_remaining(&state, now) {
            return Permission::Wait(wait);
        }

        let Some(last) = state.last_refresh_time else {
            return Permission::Allowed;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.config.refresh_count_window()
            || state.refresh_count <= self.config.max_refresh_count
        {
            return Permission::Allowed;
        }

        let excess = state.refresh_count - self.config.max_refresh_count;
        let wait = self.count_backoff(excess).saturating_sub(elapsed);
        if wait.is_zero() {
            Permission::Allowed
        } else {
            Permission::Wait(wait)
        }
    }

    /// Remaining time of an externally imposed limit, if one is active.
    ///
    /// Unlike [`can_proceed`](Self::can_proceed) this ignores the initiation
    /// count; it is what outbound requests consult before being sent.
    pub fn rate_limit_wait(&self) -> Option<Duration> {
        let now = self.clock.now();
        Self::limit_remaining(&self.state(), now)
    }

    fn limit_remaining(state: &GuardState, now: Instant) -> Option<Duration> {
        if !state.is_rate_limited {
            return None;
        }
        state
            .rate_limited_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// `initial_backoff * 1.5^excess`, capped at half of `max_backoff`
    fn count_backoff(&self, excess: u32) -> Duration {
        let exponent = i32::try_from(excess).unwrap_or(i32::MAX);
        let secs = self.config.initial_backoff().as_secs_f64() * COUNT_BACKOFF_BASE.powi(exponent);
        let cap = self.config.max_backoff() / 2;
        if secs.is_finite() && secs < cap.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            cap
        }
    }

    /// Records a 429 rejection.
    ///
    /// Doubles the backoff quantum with jitter in `[0.8, 1.2]`, capped at
    /// `max_backoff`, and blocks until `retry_after` (when the provider sent
    /// one) or the new backoff has elapsed. Returns the blocking delay.
    pub fn record_rejection(&self, retry_after: Option<Duration>) -> Duration {
        let now = self.clock.now();
        let jitter = JITTER_MIN + JITTER_SPAN * self.jitter.sample().clamp(0.0, 1.0);
        let mut state = self.state();

        state.backoff_time = state
            .backoff_time
            .mul_f64(2.0 * jitter)
            .min(self.config.max_backoff());
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.is_rate_limited = true;

        // a zero Retry-After would let a rejected exchange replay at once
        let delay = retry_after
            .filter(|d| !d.is_zero())
            .map(|d| d.min(Duration::from_secs(MAX_RETRY_AFTER_SECS)))
            .unwrap_or(state.backoff_time);
        let (delay, until) = match now.checked_add(delay) {
            Some(until) => (delay, until),
            None => (state.backoff_time, now + state.backoff_time),
        };
        state.rate_limited_until = Some(until);

        warn!(
            backoff_ms = state.backoff_time.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            consecutive_errors = state.consecutive_errors,
            retry_after_header = retry_after.is_some(),
            "Rate limited by provider, backing off"
        );
        delay
    }

    /// Records a successful request that was not a refresh-token exchange.
    ///
    /// Resets backoff and the error streak; an active limit is left in place
    /// because it may have been observed on another endpoint.
    pub fn record_success(&self) {
        let mut state = self.state();
        if state.consecutive_errors > 0 {
            info!(
                consecutive_errors = state.consecutive_errors,
                "Request succeeded, resetting backoff"
            );
        }
        state.backoff_time = self.config.initial_backoff();
        state.consecutive_errors = 0;
    }

    /// Records a successful refresh-token exchange: the limit is lifted.
    pub fn record_refresh_success(&self) {
        let mut state = self.state();
        if state.is_rate_limited {
            info!("Refresh exchange succeeded, lifting rate limit");
        }
        state.is_rate_limited = false;
        state.rate_limited_until = None;
    }

    /// Whether the last initiation is younger than `min_refresh_interval`
    pub fn within_min_interval(&self) -> bool {
        let now = self.clock.now();
        self.state()
            .last_refresh_time
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.min_refresh_interval())
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> RateLimitSnapshot {
        let state = self.state();
        RateLimitSnapshot {
            refresh_count: state.refresh_count,
            consecutive_errors: state.consecutive_errors,
            backoff_time: state.backoff_time,
            is_rate_limited: state.is_rate_limited,
            rate_limited_until: state.rate_limited_until,
            last_refresh_time: state.last_refresh_time,
        }
    }

    /// Returns every counter to its initial value
    pub fn reset(&self) {
        *self.state() = GuardState::new(self.config.initial_backoff());
        debug!("Rate limit state reset");
    }
}

// ============================================================================
// Retry-After header parsing
// ============================================================================

/// Parses a Retry-After header value into a Duration.
///
/// The header can be either:
/// - An integer number of seconds (e.g., "30")
/// - An HTTP-date (e.g., "Fri, 31 Dec 2025 23:59:59 GMT") - parsed as seconds from now
///
/// Values above one hour are clamped to one hour. Returns `None` when the
/// value is neither, so the caller falls back to its computed backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(MAX_RETRY_AFTER_SECS)));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let now = chrono::Utc::now();
        let target = date.with_timezone(&chrono::Utc);
        if target > now {
            let diff = target - now;
            if let Some(secs) = diff
                .num_seconds()
                .try_into()
                .ok()
                .filter(|&s: &u64| s <= MAX_RETRY_AFTER_SECS)
            {
                return Some(Duration::from_secs(secs));
            }
        }
    }

    warn!(value, "Could not parse Retry-After header");
    None
}
