//! Rate-limited work queue with per-key coalescing and single-flight delivery
//!
//! A key is in at most one of three places: waiting in the queue, being
//! processed by exactly one worker, or absent. Adding a key that is already
//! waiting is a no-op. Adding a key that is being processed marks it dirty so
//! it is queued again once the worker calls [`WorkQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::retry::{BackoffConfig, RateLimiter};

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Work queue owned by the dispatcher and shared with its workers by `Arc`
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    available: Notify,
    idle: Notify,
    limiter: RateLimiter<K>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Create an empty queue
    pub fn new(name: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
            idle: Notify::new(),
            limiter: RateLimiter::new(backoff),
        }
    }

    /// Queue name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Enqueue `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let at = Instant::now() + delay;
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            queue.add(key);
        });
    }

    /// Record a failure for `key` and enqueue it after its backoff delay.
    ///
    /// Keys past the exhaustion threshold are logged and still retried at the
    /// maximum delay. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = self.limiter.when(&key);
        if self.limiter.is_exhausted(&key) {
            warn!(
                queue = %self.name,
                key = %key,
                failures = self.limiter.num_requeues(&key),
                delay_ms = delay.as_millis() as u64,
                "retries exhausted, still retrying at backoff cap"
            );
        }
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for `key`
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shutting down. Every key returned must
    /// be passed back to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed, re-queueing it if it was
    /// added again in the meantime
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key) && !state.shutting_down;
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.available.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_waiters();
        debug!(queue = %self.name, "work queue shutting down");
    }

    /// Shut down and wait until every in-flight key has been marked done
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.state.lock().processing.is_empty() {
                return;
            }
            idle.await;
        }
    }

    /// True after [`WorkQueue::shutdown`]
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
