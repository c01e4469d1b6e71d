//! Session cache with a freshness window
//!
//! Holds the result of the last successful fetch and when it was captured.
//! [`SessionCache::get`] only returns entries younger than the TTL;
//! [`SessionCache::last_known`] ignores the TTL for degraded-mode serving.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use reserva_core::domain::Session;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct CachedEntry {
    /// `None` is a cached "nobody is signed in" answer
    session: Option<Session>,
    cached_at: Instant,
}

/// In-memory store for the most recent session result
#[derive(Debug)]
pub struct SessionCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entry: Mutex<Option<CachedEntry>>,
}

impl SessionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entry: Mutex::new(None),
        }
    }

    fn entry(&self) -> MutexGuard<'_, Option<CachedEntry>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached result if it is still inside the freshness window.
    ///
    /// The outer `Option` is the hit/miss; the inner one is the session.
    pub fn get(&self) -> Option<Option<Session>> {
        let now = self.clock.now();
        let entry = self.entry();
        let cached = entry.as_ref()?;
        let age = now.saturating_duration_since(cached.cached_at);
        if age < self.ttl {
            debug!(age_ms = age.as_millis() as u64, "Session cache hit");
            Some(cached.session.clone())
        } else {
            debug!(age_ms = age.as_millis() as u64, "Session cache entry is stale");
            None
        }
    }

    /// Returns the cached result regardless of age
    pub fn last_known(&self) -> Option<Option<Session>> {
        self.entry().as_ref().map(|cached| cached.session.clone())
    }

    /// Stores a freshly fetched result, stamped with the current time
    pub fn set(&self, session: Option<Session>) {
        let cached_at = self.clock.now();
        *self.entry() = Some(CachedEntry { session, cached_at });
    }

    /// Drops the cached result so the next `get` misses
    pub fn clear(&self) {
        *self.entry() = None;
    }

    /// Age of the cached result, if any
    pub fn age(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.entry()
            .as_ref()
            .map(|cached| now.saturating_duration_since(cached.cached_at))
    }
}
