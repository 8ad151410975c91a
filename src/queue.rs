//! Bounded, priority-ordered holding area for requests that cannot be sent
//! immediately.
//!
//! Every entry carries a single-assignment completion slot (a tokio oneshot).
//! The queue owns entries until they are dequeued for delivery, at which point
//! the completion transfers to the in-flight send. No entry is ever dropped
//! without its completion being resolved: eviction resolves it with a
//! queue-overflow failure and teardown resolves it with a context error.

use crate::SessionError;
use serde_json::Value;
use std::time::Instant;
use tokio::sync::oneshot;

/// Delivery priority. Higher priorities are dequeued first; within a band,
/// delivery order is enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used for ordering (high=3, normal=2, low=1).
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Receiving half of a queued request's completion slot.
pub type CompletionReceiver = oneshot::Receiver<Result<Value, SessionError>>;

/// A request parked in the queue, together with its completion slot.
#[derive(Debug)]
pub struct QueuedRequest {
    pub payload: Value,
    pub priority: Priority,
    pub enqueued_at: Instant,
    completion: oneshot::Sender<Result<Value, SessionError>>,
}

impl QueuedRequest {
    /// Resolve the completion exactly once. If the caller has already dropped
    /// its receiver this is a no-op; the result is simply unobserved.
    pub fn resolve(self, result: Result<Value, SessionError>) {
        if self.completion.send(result).is_err() {
            tracing::debug!("completion receiver dropped before resolution");
        }
    }
}

/// Bounded priority queue of pending requests.
#[derive(Debug)]
pub struct MessageQueue {
    entries: Vec<QueuedRequest>,
    max_size: usize,
}

impl MessageQueue {
    /// Create a queue holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self { entries: Vec::new(), max_size }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Park a request and hand back the receiving half of its completion.
    ///
    /// The queue is kept sorted by priority rank with a stable sort, so FIFO
    /// order holds within each band. Capacity is enforced afterwards, which
    /// means the entry just enqueued can itself be evicted if it ranks lowest.
    pub fn enqueue(&mut self, payload: Value, priority: Priority) -> CompletionReceiver {
        let (tx, rx) = oneshot::channel();
        self.entries.push(QueuedRequest {
            payload,
            priority,
            enqueued_at: Instant::now(),
            completion: tx,
        });
        self.entries.sort_by_key(|entry| std::cmp::Reverse(entry.priority.rank()));
        self.enforce_capacity();
        rx
    }

    /// Evict from the tail (lowest priority, newest within that band) down to
    /// half capacity once the limit is exceeded, resolving each evicted
    /// completion with an overflow failure.
    fn enforce_capacity(&mut self) {
        if self.entries.len() <= self.max_size {
            return;
        }
        let target = (self.max_size / 2).max(1);
        let evicted = self.entries.split_off(target);
        tracing::warn!(
            evicted = evicted.len(),
            capacity = self.max_size,
            "message queue overflow; evicting lowest-priority entries"
        );
        for entry in evicted {
            entry.resolve(Err(SessionError::QueueOverflow { capacity: self.max_size }));
        }
    }

    /// Atomically empty the queue and return its contents in delivery order
    /// (priority bands, FIFO within each band).
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        std::mem::take(&mut self.entries)
    }

    /// Reinsert undelivered entries at the front, preserving their relative
    /// order, so a second flush resumes exactly where the first stopped.
    pub fn requeue_front(&mut self, mut undelivered: Vec<QueuedRequest>) {
        undelivered.append(&mut self.entries);
        self.entries = undelivered;
    }

    /// Resolve every queued completion with `error` and clear the queue.
    pub fn reject_all(&mut self, error: &SessionError) {
        for entry in self.entries.drain(..) {
            entry.resolve(Err(error.clone()));
        }
    }
}
