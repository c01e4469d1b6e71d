//! Reserva Auth - session refresh coordinator
//!
//! Sits in front of the auth provider's "get current session" call and
//! shapes the traffic it generates:
//! - Serves recently fetched sessions from a short-lived cache
//! - Coalesces concurrent callers onto a single in-flight fetch
//! - Counts fetch initiations and backs off when the provider rate-limits
//! - Defers refresh-token exchanges that hit a limit and replays them later
//!
//! ## Modules
//!
//! - [`clock`] - Injectable time source and sleeper
//! - [`rate_limit`] - Attempt counting, 429 bookkeeping and backoff math
//! - [`retry_queue`] - FIFO of deferred requests, drained with spacing
//! - [`transport`] - Guarded HTTP execution that feeds the rate limiter
//! - [`cache`] - Last fetched session with a freshness window
//! - [`coalesce`] - Single-flight sharing of one pending fetch
//! - [`source`] - Session source port and the REST adapter
//! - [`coordinator`] - The public `get_session` / `clear_cache` surface

pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod coordinator;
pub mod rate_limit;
pub mod retry_queue;
pub mod source;
pub mod transport;

use std::{sync::Arc, time::Duration};

use reserva_core::domain::Session;
use thiserror::Error;

pub use coordinator::SessionRefreshCoordinator;

/// Outcome of a session fetch: `Ok(None)` means nobody is signed in
pub type SessionResult = Result<Option<Session>, SessionError>;

/// Errors that can occur while obtaining the current session
///
/// Cloneable so a single settled fetch can be handed to every caller that
/// was coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The provider rejected the request with 429 Too Many Requests
    #[error("Too many requests, retry after {retry_after:?}")]
    RateLimited {
        /// Delay announced by the Retry-After header, if any
        retry_after: Option<Duration>,
    },

    /// The request could not be completed at the network level
    #[error("Network error: {0}")]
    Network(Arc<reqwest::Error>),

    /// The provider answered with a non-success status
    #[error("Provider error ({status}): {message}")]
    Provider {
        /// HTTP status code
        status: u16,
        /// Error description from the response body
        message: String,
    },

    /// The provider response could not be parsed or was malformed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A deferred request was discarded before it could be sent
    #[error("Request abandoned before it was sent")]
    Abandoned,
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Network(Arc::new(err))
    }
}
