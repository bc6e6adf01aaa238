//! Bounded in-process dead-letter channel for downstream dispatch failures.
//!
//! Projection, saga, and subscription enqueues are fire-and-forget with respect
//! to the command result. When the dispatcher refuses one, the coordinator logs
//! it, counts it, and parks a [`DispatchFailure`] here so an operator (or a
//! background job) can inspect and re-enqueue it.

use crate::metrics::DeadLetterMetrics;
use chrono::{DateTime, Utc};
use commandeer_core::dispatcher::{DispatchTask, HandlerRef};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Which downstream channel a failed task belonged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// Primary or failure-path projection.
    Projection,
    /// Secondary projection.
    SecondaryProjection,
    /// Cross-context saga route.
    Saga,
    /// Event bus subscription.
    Subscription,
}

impl DispatchKind {
    /// Metric label for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Projection => "projection",
            Self::SecondaryProjection => "secondary_projection",
            Self::Saga => "saga",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A downstream task the dispatcher refused.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchFailure {
    /// Channel the task belonged to.
    pub kind: DispatchKind,
    /// The command whose outcome produced the task.
    pub command_id: String,
    /// Correlation id of the causal chain.
    pub correlation_id: String,
    /// Target handler.
    pub handler: HandlerRef,
    /// The task as it was handed to the dispatcher.
    #[serde(skip)]
    pub task: DispatchTask,
}

/// Dead letter queue entry.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The failed payload
    pub payload: T,

    /// The error message from the failure
    pub error_message: String,

    /// Number of delivery attempts made before parking
    pub attempts: usize,

    /// When the entry was parked
    pub failed_at: DateTime<Utc>,
}

/// Bounded FIFO queue of failed operations.
///
/// - Oldest entries are evicted when full
/// - Clones share the same storage
/// - Size and throughput are exported as metrics
///
/// # Example
///
/// ```
/// use commandeer_runtime::dead_letter::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("a", "unreachable".to_string(), 1);
/// dlq.push("b", "unreachable".to_string(), 1);
/// dlq.push("c", "unreachable".to_string(), 1);
///
/// let payloads: Vec<_> = dlq.drain().into_iter().map(|d| d.payload).collect();
/// assert_eq!(payloads, vec!["b", "c"]);
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create a new dead letter queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Park a failed payload, evicting the oldest entry if full.
    pub fn push(&self, payload: T, error_message: String, attempts: usize) {
        if self.max_size == 0 {
            DeadLetterMetrics::record_dropped();
            return;
        }

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            DeadLetterMetrics::record_dropped();
            tracing::warn!(
                max_size = self.max_size,
                "Dead letter queue at capacity, dropping oldest entry"
            );
        }

        queue.push_back(DeadLetter {
            payload,
            error_message,
            attempts,
            failed_at: Utc::now(),
        });
        DeadLetterMetrics::record_push(queue.len());
    }

    /// Current queue size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        DeadLetterMetrics::record_drained(entries.len());
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// Copy of every entry, oldest first, without removing them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Peek at the oldest entry without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Maximum queue size.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn push_and_drain_preserve_order() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push(1, "first".to_string(), 1);
        dlq.push(2, "second".to_string(), 2);

        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.peek().map(|d| d.payload), Some(1));

        let drained = dlq.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].error_message, "second");
        assert_eq!(drained[1].attempts, 2);
        assert!(dlq.is_empty());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let dlq = DeadLetterQueue::new(3);
        for i in 0..5 {
            dlq.push(i, format!("error {i}"), 1);
        }

        let payloads: Vec<_> = dlq.snapshot().into_iter().map(|d| d.payload).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_discards_everything() {
        let dlq = DeadLetterQueue::new(0);
        dlq.push("x", "error".to_string(), 1);
        assert!(dlq.is_empty());
    }

    #[test]
    fn clones_share_storage() {
        let dlq = DeadLetterQueue::new(10);
        let other = dlq.clone();
        other.push("x", "error".to_string(), 1);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn dispatch_failure_serializes_without_task() {
        let failure = DispatchFailure {
            kind: DispatchKind::SecondaryProjection,
            command_id: "cmd-1".to_string(),
            correlation_id: "corr-1".to_string(),
            handler: HandlerRef::new("projections.orderSummary"),
            task: DispatchTask::new(HandlerRef::new("projections.orderSummary"), json!({})),
        };

        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["kind"], "secondary_projection");
        assert_eq!(value["handler"], "projections.orderSummary");
        assert!(value.get("task").is_none());
    }
}
