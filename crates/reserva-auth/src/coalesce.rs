//! Request coalescing
//!
//! Ensures at most one fetch is in flight. The first caller starts the
//! fetch; every caller arriving before it settles receives a clone of the
//! same shared future and therefore the same result or error. The slot is
//! emptied as the fetch settles, before callers see the output, so the next
//! call after settlement always starts a fresh fetch.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

/// Future handed to every caller of [`RequestCoalescer::run`]
pub type SharedFetch<T> = Shared<BoxFuture<'static, T>>;

struct InFlight<T: Clone> {
    id: u64,
    fetch: SharedFetch<T>,
}

type Slot<T> = Arc<Mutex<Option<InFlight<T>>>>;

/// Single-flight wrapper around a fetch operation
pub struct RequestCoalescer<T: Clone> {
    slot: Slot<T>,
    next_id: AtomicU64,
}

fn lock<T: Clone>(slot: &Mutex<Option<InFlight<T>>>) -> MutexGuard<'_, Option<InFlight<T>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Joins the in-flight fetch, or starts one with `factory`.
    ///
    /// `factory` is only called when nothing is in flight. The returned
    /// future must be awaited (or dropped) by the caller.
    pub fn run<F>(&self, factory: F) -> SharedFetch<T>
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let mut slot = lock(&self.slot);
        if let Some(in_flight) = slot.as_ref() {
            debug!(fetch_id = in_flight.id, "Joining in-flight fetch");
            return in_flight.fetch.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = factory();
        let settle_slot = Arc::clone(&self.slot);
        let fetch = async move {
            let output = inner.await;
            let mut slot = lock(&settle_slot);
            if slot.as_ref().is_some_and(|current| current.id == id) {
                *slot = None;
            }
            output
        }
        .boxed()
        .shared();

        debug!(fetch_id = id, "Starting new fetch");
        *slot = Some(InFlight {
            id,
            fetch: fetch.clone(),
        });
        fetch
    }

    /// Whether a fetch is currently outstanding
    pub fn is_in_flight(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Forgets the in-flight fetch so the next `run` starts a new one.
    ///
    /// Callers already waiting on the old fetch still receive its result.
    pub fn reset(&self) {
        *lock(&self.slot) = None;
    }
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
