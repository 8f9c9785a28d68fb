//! Rate-limited, deduplicating work queue of object keys.
//!
//! A key is queued at most once. While a worker holds a key it is hidden
//! from other workers; re-adding it during processing marks it dirty and it
//! is queued again when the worker calls [`WorkQueue::done`].
//!
//! Delayed adds keep one deadline per key: the earliest wins, later
//! requests are dropped and pending timers stop on shutdown.

use crate::backoff::ItemRateLimiter;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    /// Deadline of the one pending delayed add per key
    waiting: HashMap<String, Instant>,
    shutting_down: bool,
}

#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    limiter: Mutex<ItemRateLimiter>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_rate_limiter(name, ItemRateLimiter::default())
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: ItemRateLimiter) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            limiter: Mutex::new(limiter),
            notify: Notify::new(),
            shutdown: watch::Sender::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter(&self) -> MutexGuard<'_, ItemRateLimiter> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        trace!(queue = %self.name, %key, "queued");
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&key) {
                Some(pending) if *pending <= deadline => return,
                _ => {
                    state.waiting.insert(key.clone(), deadline);
                }
            }
        }

        let queue = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => queue.fire(key, deadline),
                _ = stop.wait_for(|stopped| *stopped) => {}
            }
        });
    }

    /// Timer expiry; a no-op when an earlier deadline replaced this one
    fn fire(&self, key: String, deadline: Instant) {
        {
            let mut state = self.state();
            if state.waiting.get(&key) != Some(&deadline) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key);
    }

    /// Keys with a pending delayed add
    pub fn num_waiting(&self) -> usize {
        self.state().waiting.len()
    }

    /// Queue `key` after its per-key backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = self.limiter().when(&key);
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &str) {
        self.limiter().forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Wait for the next key; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.shutdown.send_replace(true);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain waiting keys without processing them; used by tests
    pub fn drain(&self) -> Vec<String> {
        let mut state = self.state();
        state.dirty.clear();
        state.queue.drain(..).collect()
    }
}
