// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Coalescing change queue between the Gateway watch and the reconcile workers.
//!
//! The queue follows the Kubernetes work queue model:
//!
//! - a key enqueued while already pending is coalesced (at most one pending copy)
//! - a key enqueued while a worker is processing it is marked *dirty* and queued
//!   again when the worker calls [`ChangeQueue::done`], so a key is never processed
//!   by two workers at once
//! - failed keys are requeued with a per-key exponential delay and dropped once the
//!   attempt cap is reached
//!
//! After shutdown the queue accepts no new keys and [`ChangeQueue::dequeue`] returns
//! `None`; keys already handed out can still be marked done, which is what
//! [`ChangeQueue::shut_down_with_drain`] waits for.

use crate::metrics;
use crate::reconcilers::retry::RetryPolicy;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifies the Service a reconciliation targets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited work queue.
pub struct ChangeQueue<K> {
    state: Mutex<QueueState<K>>,
    policy: RetryPolicy,
    available: Notify,
    drained: Notify,
    closed: CancellationToken,
}

impl<K> ChangeQueue<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    /// Create a queue whose requeue delays follow `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            policy,
            available: Notify::new(),
            drained: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a key. Returns `false` when the key was coalesced or the queue is shut down.
    pub fn enqueue(&self, key: K) -> bool {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return false;
        }
        if state.processing.contains(&key) {
            // picked up again by done()
            return true;
        }
        state.queue.push_back(key);
        metrics::set_queue_depth(state.queue.len());
        drop(state);

        self.available.notify_one();
        true
    }

    /// Add a key once `delay` has elapsed, unless the queue shuts down first.
    pub fn enqueue_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = queue.closed.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    queue.enqueue(key);
                }
            }
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_queue_depth(state.queue.len());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a dequeued key as finished.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);

        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            metrics::set_queue_depth(state.queue.len());
            self.available.notify_one();
        }
        if state.processing.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Requeue a failed key after its per-key backoff delay.
    ///
    /// Returns the delay, or `None` when the key reached the attempt cap and was
    /// dropped (its failure count is reset).
    pub fn requeue_rate_limited(self: &Arc<Self>, key: K) -> Option<Duration> {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.get(&key).copied().unwrap_or_default();
            if !self.policy.allows_attempt(failures) {
                state.failures.remove(&key);
                warn!(key = %key, attempts = failures, "Dropping key after too many failures");
                metrics::record_queue_drop();
                return None;
            }
            state.failures.insert(key.clone(), failures + 1);
            self.policy.delay_for_attempt(failures + 1)
        };

        debug!(key = %key, retry_after = ?delay, "Requeueing key with backoff");
        self.enqueue_after(key, delay);
        Some(delay)
    }

    /// Clear the failure history of a key.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Number of rate-limited requeues since the key last succeeded.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or_default()
    }

    /// Number of keys waiting to be dequeued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Stop accepting keys and release every waiting worker.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.closed.cancel();
        self.available.notify_waiters();
    }

    /// Shut down, then wait until every dequeued key has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.drained.notified();
            if self.state().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod queue_tests;
