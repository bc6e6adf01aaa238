//! Priority- and partition-ordered publish/subscribe over the asynchronous
//! dispatcher.
//!
//! An [`EventBus`] holds an immutable set of [`Subscription`]s, sorted once by
//! priority when the bus is built. Publishing an event enqueues one dispatcher
//! task per matching subscription, in priority order, awaiting each enqueue
//! before the next. The first refused enqueue aborts the publish: lower
//! priority subscriptions are never dispatched for that event.
//!
//! # Example
//!
//! ```
//! use commandeer_core::dispatcher::HandlerRef;
//! use commandeer_core::EventCategory;
//! use commandeer_runtime::event_bus::Subscription;
//! use serde_json::json;
//!
//! let subscription = Subscription::builder("order-emails")
//!     .event_types(["OrderPlaced"])
//!     .categories([EventCategory::Domain])
//!     .priority(50)
//!     .handler("notifications.sendOrderEmail")
//!     .transform(|event, _chain| json!({ "orderId": event.stream_id }))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(subscription.name(), "order-emails");
//! assert_eq!(subscription.priority(), 50);
//! assert_eq!(subscription.handler(), &HandlerRef::new("notifications.sendOrderEmail"));
//! ```

use crate::metrics::EventBusMetrics;
use commandeer_core::command::CorrelationChain;
use commandeer_core::dispatcher::{
    AsyncDispatcher, DispatchContext, DispatchError, DispatchTask, HandlerRef, PartitionKey,
};
use commandeer_core::{Event, EventCategory, StreamType};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Priority used when a subscription does not set one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Builds handler args from the event and the publishing chain.
pub type TransformFn = Arc<dyn Fn(&Event, &CorrelationChain) -> Value + Send + Sync>;

/// Derives the ordering key for an event.
pub type PartitionKeyFn = Arc<dyn Fn(&Event) -> PartitionKey + Send + Sync>;

/// Errors from building or publishing on an event bus.
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Two subscriptions share a name.
    #[error("Duplicate subscription name: {0}")]
    DuplicateSubscription(String),

    /// A subscription is missing a required part.
    #[error("Invalid subscription '{name}': {reason}")]
    InvalidSubscription {
        /// Subscription name (may be empty).
        name: String,
        /// What is missing.
        reason: String,
    },

    /// The bus was built without a dispatcher.
    #[error("Event bus requires a dispatcher")]
    MissingDispatcher,

    /// The dispatcher refused a subscription task; publish stopped there.
    #[error("Dispatch to subscription '{subscription}' failed: {source}")]
    DispatchFailed {
        /// Subscription whose enqueue failed.
        subscription: String,
        /// Subscriptions already enqueued before the failure, in order.
        triggered: Vec<String>,
        /// The task that was refused.
        task: Box<DispatchTask>,
        /// Dispatcher error.
        #[source]
        source: DispatchError,
    },
}

/// Which events a subscription receives.
///
/// Each populated field lists accepted values (OR). All populated fields must
/// accept the event (AND). An empty filter accepts every event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// Accepted event types.
    pub event_types: Vec<String>,
    /// Accepted event categories.
    pub categories: Vec<EventCategory>,
    /// Accepted bounded contexts.
    pub bounded_contexts: Vec<String>,
    /// Accepted stream types.
    pub stream_types: Vec<StreamType>,
}

impl SubscriptionFilter {
    /// Filter that accepts every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether no field is populated.
    #[must_use]
    pub fn is_match_all(&self) -> bool {
        self.event_types.is_empty()
            && self.categories.is_empty()
            && self.bounded_contexts.is_empty()
            && self.stream_types.is_empty()
    }

    /// Whether `event` passes the filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        fn accepts<T: PartialEq<U>, U: ?Sized>(allowed: &[T], value: &U) -> bool {
            allowed.is_empty() || allowed.iter().any(|a| a == value)
        }

        accepts(&self.event_types, event.event_type.as_str())
            && accepts(&self.categories, &event.category)
            && accepts(&self.bounded_contexts, event.bounded_context.as_str())
            && accepts(&self.stream_types, &event.stream_type)
    }
}

/// A named, filtered route from published events to a dispatcher handler.
#[derive(Clone)]
pub struct Subscription {
    name: String,
    filter: SubscriptionFilter,
    priority: i32,
    handler: HandlerRef,
    transform: TransformFn,
    partition_key: Option<PartitionKeyFn>,
    on_complete: Option<HandlerRef>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("priority", &self.priority)
            .field("handler", &self.handler)
            .field("on_complete", &self.on_complete)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Start building a subscription.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SubscriptionBuilder {
        SubscriptionBuilder {
            name: name.into(),
            filter: SubscriptionFilter::default(),
            priority: DEFAULT_PRIORITY,
            handler: None,
            transform: None,
            partition_key: None,
            on_complete: None,
        }
    }

    /// Unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event filter.
    #[must_use]
    pub const fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Dispatch priority; lower goes first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Target handler.
    #[must_use]
    pub const fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    /// Completion handler, if set.
    #[must_use]
    pub const fn on_complete(&self) -> Option<&HandlerRef> {
        self.on_complete.as_ref()
    }

    /// Whether this subscription receives `event`.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.filter.matches(event)
    }

    /// Ordering key for `event`: the configured function, else the stream id.
    #[must_use]
    pub fn partition_key_for(&self, event: &Event) -> PartitionKey {
        self.partition_key.as_ref().map_or_else(
            || PartitionKey::new("streamId", event.stream_id.as_str()),
            |key_fn| key_fn(event),
        )
    }
}

/// Builder for [`Subscription`].
pub struct SubscriptionBuilder {
    name: String,
    filter: SubscriptionFilter,
    priority: i32,
    handler: Option<HandlerRef>,
    transform: Option<TransformFn>,
    partition_key: Option<PartitionKeyFn>,
    on_complete: Option<HandlerRef>,
}

impl SubscriptionBuilder {
    /// Accept these event types.
    #[must_use]
    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Accept these categories.
    #[must_use]
    pub fn categories(mut self, categories: impl IntoIterator<Item = EventCategory>) -> Self {
        self.filter.categories.extend(categories);
        self
    }

    /// Accept these bounded contexts.
    #[must_use]
    pub fn bounded_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter
            .bounded_contexts
            .extend(contexts.into_iter().map(Into::into));
        self
    }

    /// Accept these stream types.
    #[must_use]
    pub fn stream_types<I, S>(mut self, stream_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StreamType>,
    {
        self.filter
            .stream_types
            .extend(stream_types.into_iter().map(Into::into));
        self
    }

    /// Replace the whole filter.
    #[must_use]
    pub fn filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the priority (default 100; lower goes first).
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the target handler.
    #[must_use]
    pub fn handler(mut self, handler: impl Into<HandlerRef>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Set the args transform.
    #[must_use]
    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Event, &CorrelationChain) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Forward the whole event as handler args.
    #[must_use]
    pub fn forward_event(self) -> Self {
        self.transform(|event, _chain| serde_json::to_value(event).unwrap_or(Value::Null))
    }

    /// Set the partition key function (default: stream id).
    #[must_use]
    pub fn partition_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Event) -> PartitionKey + Send + Sync + 'static,
    {
        self.partition_key = Some(Arc::new(key_fn));
        self
    }

    /// Set the completion handler.
    #[must_use]
    pub fn on_complete(mut self, on_complete: impl Into<HandlerRef>) -> Self {
        self.on_complete = Some(on_complete.into());
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidSubscription`] if the name is empty or
    /// the handler or transform is missing.
    pub fn build(self) -> Result<Subscription, EventBusError> {
        let invalid = |reason: &str| EventBusError::InvalidSubscription {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        let handler = self.handler.clone().ok_or_else(|| invalid("handler is required"))?;
        let transform = self
            .transform
            .clone()
            .ok_or_else(|| invalid("transform is required"))?;

        Ok(Subscription {
            name: self.name,
            filter: self.filter,
            priority: self.priority,
            handler,
            transform,
            partition_key: self.partition_key,
            on_complete: self.on_complete,
        })
    }
}

/// Outcome of a successful [`EventBus::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishResult {
    /// Number of subscriptions whose filter accepted the event.
    pub matched_count: usize,
    /// Subscriptions enqueued, in dispatch order.
    pub triggered_subscriptions: Vec<String>,
    /// Whether every match was enqueued.
    pub success: bool,
}

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    dispatcher: Option<Arc<dyn AsyncDispatcher>>,
    subscriptions: Vec<Subscription>,
    default_on_complete: Option<HandlerRef>,
}

impl EventBusBuilder {
    /// Set the dispatcher that receives subscription tasks.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn AsyncDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Add a subscription.
    #[must_use]
    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Completion handler for subscriptions that do not set their own.
    #[must_use]
    pub fn default_on_complete(mut self, on_complete: impl Into<HandlerRef>) -> Self {
        self.default_on_complete = Some(on_complete.into());
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MissingDispatcher`] or
    /// [`EventBusError::DuplicateSubscription`].
    pub fn build(self) -> Result<EventBus, EventBusError> {
        let dispatcher = self.dispatcher.ok_or(EventBusError::MissingDispatcher)?;

        let mut seen = HashSet::new();
        for subscription in &self.subscriptions {
            if !seen.insert(subscription.name.clone()) {
                return Err(EventBusError::DuplicateSubscription(
                    subscription.name.clone(),
                ));
            }
        }

        let mut subscriptions = self.subscriptions;
        // Stable: equal priorities keep registration order.
        subscriptions.sort_by_key(|s| s.priority);

        let mut indexed_types = HashSet::new();
        let mut has_wildcard = false;
        for subscription in &subscriptions {
            if subscription.filter.event_types.is_empty() {
                has_wildcard = true;
            } else {
                indexed_types.extend(subscription.filter.event_types.iter().cloned());
            }
        }

        tracing::debug!(
            subscriptions = subscriptions.len(),
            has_wildcard,
            "Event bus built"
        );

        Ok(EventBus {
            dispatcher,
            subscriptions,
            indexed_types,
            has_wildcard,
            default_on_complete: self.default_on_complete,
        })
    }
}

/// Immutable subscription registry plus publish dispatch.
pub struct EventBus {
    dispatcher: Arc<dyn AsyncDispatcher>,
    subscriptions: Vec<Subscription>,
    indexed_types: HashSet<String>,
    has_wildcard: bool,
    default_on_complete: Option<HandlerRef>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_names())
            .field("default_on_complete", &self.default_on_complete)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Start building a bus.
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Subscription names in dispatch order.
    #[must_use]
    pub fn subscription_names(&self) -> Vec<&str> {
        self.subscriptions.iter().map(Subscription::name).collect()
    }

    /// Look up a subscription by name.
    #[must_use]
    pub fn subscription(&self, name: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.name == name)
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscriptions that accept `event`, in dispatch order.
    #[must_use]
    pub fn matching_subscriptions(&self, event: &Event) -> Vec<&Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.matches(event))
            .collect()
    }

    /// Whether any subscription could receive events of this type.
    ///
    /// True if the type is named by some subscription or any subscription has
    /// no event-type filter. Other filter fields are not considered.
    #[must_use]
    pub fn has_subscribers_for(&self, event_type: &str) -> bool {
        self.has_wildcard || self.indexed_types.contains(event_type)
    }

    /// Enqueue `event` to every matching subscription in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DispatchFailed`] at the first refused enqueue;
    /// later subscriptions are not dispatched.
    #[tracing::instrument(
        skip(self, event, chain),
        name = "event_bus_publish",
        fields(
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id = %chain.correlation_id
        )
    )]
    pub async fn publish(
        &self,
        event: &Event,
        chain: &CorrelationChain,
    ) -> Result<PublishResult, EventBusError> {
        let start = Instant::now();
        let matching = self.matching_subscriptions(event);
        let matched_count = matching.len();
        let mut triggered = Vec::with_capacity(matched_count);

        for subscription in matching {
            let task = DispatchTask::new(
                subscription.handler.clone(),
                (subscription.transform)(event, chain),
            )
            .on_complete(
                subscription
                    .on_complete
                    .clone()
                    .or_else(|| self.default_on_complete.clone()),
            )
            .partition_key(subscription.partition_key_for(event))
            .context(DispatchContext {
                chain: chain.clone(),
                event_id: Some(event.event_id.clone()),
                source: subscription.name.clone(),
            });

            if let Err(source) = self.dispatcher.enqueue(task.clone()).await {
                EventBusMetrics::record_publish_error();
                tracing::error!(
                    subscription = %subscription.name,
                    triggered = triggered.len(),
                    error = %source,
                    "Subscription dispatch failed, aborting publish"
                );
                return Err(EventBusError::DispatchFailed {
                    subscription: subscription.name.clone(),
                    triggered,
                    task: Box::new(task),
                    source,
                });
            }

            tracing::debug!(
                subscription = %subscription.name,
                priority = subscription.priority,
                "Subscription dispatched"
            );
            triggered.push(subscription.name.clone());
        }

        EventBusMetrics::record_publish(triggered.len(), start.elapsed());

        Ok(PublishResult {
            matched_count,
            success: triggered.len() == matched_count,
            triggered_subscriptions: triggered,
        })
    }
}
