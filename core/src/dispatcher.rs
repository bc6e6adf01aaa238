//! Asynchronous dispatcher contract: the message-passing boundary for all
//! downstream work (projections, saga routing, event-bus subscriptions).
//!
//! The core never runs downstream work itself. It emits [`DispatchTask`]s,
//! each naming the handler to run, its arguments, an optional completion
//! channel, and an optional partition key, to an injected [`AsyncDispatcher`].
//!
//! # Preconditions on implementations
//!
//! - **At-least-once**: an accepted task runs at least once; handlers must be idempotent
//! - **Partition-ordered**: tasks with equal partition keys run sequentially, in
//!   enqueue order
//! - Retries, backoff, and dead-lettering of *task execution* are the
//!   dispatcher's concern and are not re-implemented here

use crate::BoxFuture;
use crate::command::CorrelationChain;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur when handing a task to the dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher could not be reached.
    #[error("Dispatcher unavailable: {0}")]
    Unavailable(String),

    /// The dispatcher refused the task.
    #[error("Task for '{handler}' rejected: {reason}")]
    Rejected {
        /// Target handler.
        handler: HandlerRef,
        /// Why it was refused.
        reason: String,
    },
}

/// Name of a handler the dispatcher knows how to run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerRef(String);

impl HandlerRef {
    /// Create a new handler reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The handler name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerRef {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for HandlerRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Grouping key guaranteeing ordered, sequential delivery for same-keyed work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    /// What the key is (e.g. `"streamId"`, `"orderId"`).
    pub name: String,
    /// The key value.
    pub value: String,
}

impl PartitionKey {
    /// Create a partition key.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// Tracing context carried alongside a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchContext {
    /// Correlation chain of the work that produced the task.
    pub chain: CorrelationChain,
    /// Event that caused the task, if any.
    pub event_id: Option<String>,
    /// Logical origin (projection, saga route, or subscription name).
    pub source: String,
}

/// Options accompanying a task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Completion channel notified once the task finishes (or dead-letters).
    pub on_complete: Option<HandlerRef>,
    /// Ordering key.
    pub partition_key: Option<PartitionKey>,
    /// Tracing context.
    pub context: Option<DispatchContext>,
}

/// A unit of downstream work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchTask {
    /// Handler to run.
    pub handler: HandlerRef,
    /// Handler arguments.
    pub args: serde_json::Value,
    /// Delivery options.
    pub options: EnqueueOptions,
}

impl DispatchTask {
    /// Create a task with default options.
    #[must_use]
    pub fn new(handler: HandlerRef, args: serde_json::Value) -> Self {
        Self {
            handler,
            args,
            options: EnqueueOptions::default(),
        }
    }

    /// Set the completion channel.
    #[must_use]
    pub fn on_complete(mut self, on_complete: Option<HandlerRef>) -> Self {
        self.options.on_complete = on_complete;
        self
    }

    /// Set the partition key.
    #[must_use]
    pub fn partition_key(mut self, key: PartitionKey) -> Self {
        self.options.partition_key = Some(key);
        self
    }

    /// Set the tracing context.
    #[must_use]
    pub fn context(mut self, context: DispatchContext) -> Self {
        self.options.context = Some(context);
        self
    }
}

/// Handle to an accepted task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

/// Asynchronous dispatcher abstraction.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn AsyncDispatcher>`).
pub trait AsyncDispatcher: Send + Sync {
    /// Hand a task to the dispatcher. Resolves once the task is accepted,
    /// not once it has run.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if the task could not be accepted.
    fn enqueue(&self, task: DispatchTask) -> BoxFuture<'_, Result<TaskHandle, DispatchError>>;
}
