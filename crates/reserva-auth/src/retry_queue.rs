//! Deferred request queue
//!
//! Requests that must not be lost (refresh-token exchanges) are parked here
//! while the provider is rate-limiting us. A single drain task waits out the
//! limit, then replays the tasks in arrival order with a fixed spacing so the
//! replay does not trip the limit again. If a new limit is recorded mid-drain
//! the drain pauses until it expires.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tracing::{debug, info};

use crate::{clock::Clock, rate_limit::RateLimitGuard};

/// A deferred unit of work; runs exactly once when drained
pub type RetryTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<RetryTask>,
    /// A drain task is scheduled or running
    draining: bool,
}

struct QueueInner {
    guard: Arc<RateLimitGuard>,
    clock: Arc<dyn Clock>,
    spacing: Duration,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO of deferred requests, replayed once the rate limit lifts
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("spacing", &self.inner.spacing)
            .field("queued", &self.len())
            .finish()
    }
}

impl RetryQueue {
    pub fn new(guard: Arc<RateLimitGuard>, clock: Arc<dyn Clock>, spacing: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                guard,
                clock,
                spacing,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Appends a task and makes sure a drain is scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, task: RetryTask) {
        let start_drain = {
            let mut state = self.inner.state();
            state.tasks.push_back(task);
            debug!(queued = state.tasks.len(), "Deferred request queued");
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            let queue = self.clone();
            tokio::spawn(async move { queue.drain().await });
        }
    }

    /// Replays queued tasks until the queue is empty.
    ///
    /// Waits out any active rate limit before each task and sleeps `spacing`
    /// between tasks. Normally driven by the task spawned from `enqueue`.
    pub async fn drain(&self) {
        let mut replayed = 0usize;
        loop {
            if let Some(wait) = self.inner.guard.rate_limit_wait() {
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    "Drain paused while rate limited"
                );
                self.inner.clock.sleep(wait).await;
                continue;
            }

            let (task, remaining) = {
                let mut state = self.inner.state();
                match state.tasks.pop_front() {
                    Some(task) => (task, state.tasks.len()),
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };

            task().await;
            replayed += 1;

            if remaining > 0 {
                self.inner.clock.sleep(self.inner.spacing).await;
            }
        }

        if replayed > 0 {
            info!(replayed, "Retry queue drained");
        }
    }

    /// Drops every queued task without running it; returns how many.
    ///
    /// Whoever awaits a dropped task observes the cancellation through
    /// its own channel.
    pub fn clear(&self) -> usize {
        let dropped: Vec<RetryTask> = self.inner.state().tasks.drain(..).collect();
        if !dropped.is_empty() {
            info!(abandoned = dropped.len(), "Retry queue cleared");
        }
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.inner.state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
