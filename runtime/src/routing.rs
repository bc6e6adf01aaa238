//! Downstream routes attached to a command: projections and saga routing.
//!
//! Routes only describe tasks. The coordinator hands each task to the
//! asynchronous dispatcher after the command's event is appended; nothing here
//! runs inline.

use commandeer_core::dispatcher::{DispatchContext, DispatchTask, HandlerRef, PartitionKey};
use commandeer_core::{CorrelationChain, Event, GlobalPosition, HandlerResult};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;

/// Builds projection args from `(command args, handler result, global position)`.
pub type ArgsBuilder = Arc<dyn Fn(&Value, &HandlerResult, GlobalPosition) -> Value + Send + Sync>;

/// Derives the ordering key from the command args.
pub type ArgsPartitionKeyFn = Arc<dyn Fn(&Value) -> PartitionKey + Send + Sync>;

/// Builds saga router args from the appended event.
pub type SagaArgsBuilder = Arc<dyn Fn(&Event) -> Value + Send + Sync>;

/// A read-model update enqueued after a command's event is appended.
///
/// Defaults: args are `{ "args", "result", "globalPosition" }` and the
/// partition key is the handler name, so updates to one projection are applied
/// in order.
#[derive(Clone)]
pub struct ProjectionDispatch {
    handler: HandlerRef,
    args_builder: ArgsBuilder,
    partition_key: ArgsPartitionKeyFn,
    on_complete: Option<HandlerRef>,
}

impl fmt::Debug for ProjectionDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionDispatch")
            .field("handler", &self.handler)
            .field("on_complete", &self.on_complete)
            .finish_non_exhaustive()
    }
}

impl ProjectionDispatch {
    /// Route to `handler` with default args and partitioning.
    #[must_use]
    pub fn new(handler: impl Into<HandlerRef>) -> Self {
        let handler = handler.into();
        let key_value = handler.as_str().to_string();
        Self {
            handler,
            args_builder: Arc::new(
                |args: &Value, result: &HandlerResult, position: GlobalPosition| {
                    json!({
                        "args": args,
                        "result": result,
                        "globalPosition": position,
                    })
                },
            ),
            partition_key: Arc::new(move |_: &Value| {
                PartitionKey::new("projection", key_value.clone())
            }),
            on_complete: None,
        }
    }

    /// Replace the args builder.
    #[must_use]
    pub fn args<F>(mut self, builder: F) -> Self
    where
        F: Fn(&Value, &HandlerResult, GlobalPosition) -> Value + Send + Sync + 'static,
    {
        self.args_builder = Arc::new(builder);
        self
    }

    /// Partition by a function of the command args.
    #[must_use]
    pub fn partition_by<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Value) -> PartitionKey + Send + Sync + 'static,
    {
        self.partition_key = Arc::new(key_fn);
        self
    }

    /// Partition by a top-level string (or number) field of the command args.
    #[must_use]
    pub fn partition_by_field(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.partition_by(move |args| {
            let value = match args.get(&field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            PartitionKey::new(field.clone(), value)
        })
    }

    /// Set the completion handler.
    #[must_use]
    pub fn on_complete(mut self, on_complete: impl Into<HandlerRef>) -> Self {
        self.on_complete = Some(on_complete.into());
        self
    }

    /// Target handler.
    #[must_use]
    pub const fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    /// Build the dispatcher task for one appended event.
    #[must_use]
    pub fn task(
        &self,
        args: &Value,
        result: &HandlerResult,
        position: GlobalPosition,
        context: DispatchContext,
    ) -> DispatchTask {
        DispatchTask::new(self.handler.clone(), (self.args_builder)(args, result, position))
            .on_complete(self.on_complete.clone())
            .partition_key((self.partition_key)(args))
            .context(context)
    }
}

/// Cross-context workflow routing, enqueued rather than invoked inline.
///
/// The router receives the appended event (or custom args) and decides which
/// commands to issue in other bounded contexts, deriving their chains from the
/// event. Tasks are partitioned by correlation id so one workflow's steps stay
/// ordered.
#[derive(Clone)]
pub struct SagaRoute {
    router: HandlerRef,
    on_complete: Option<HandlerRef>,
    build_args: Option<SagaArgsBuilder>,
}

impl fmt::Debug for SagaRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaRoute")
            .field("router", &self.router)
            .field("on_complete", &self.on_complete)
            .field("custom_args", &self.build_args.is_some())
            .finish()
    }
}

impl SagaRoute {
    /// Route appended events to `router`.
    #[must_use]
    pub fn new(router: impl Into<HandlerRef>) -> Self {
        Self {
            router: router.into(),
            on_complete: None,
            build_args: None,
        }
    }

    /// Set the completion handler.
    #[must_use]
    pub fn on_complete(mut self, on_complete: impl Into<HandlerRef>) -> Self {
        self.on_complete = Some(on_complete.into());
        self
    }

    /// Replace the default args (the serialized event).
    #[must_use]
    pub fn args<F>(mut self, builder: F) -> Self
    where
        F: Fn(&Event) -> Value + Send + Sync + 'static,
    {
        self.build_args = Some(Arc::new(builder));
        self
    }

    /// Router handler.
    #[must_use]
    pub const fn router(&self) -> &HandlerRef {
        &self.router
    }

    /// Build the dispatcher task for one appended event.
    #[must_use]
    pub fn task(&self, event: &Event, chain: &CorrelationChain) -> DispatchTask {
        let args = self.build_args.as_ref().map_or_else(
            || serde_json::to_value(event).unwrap_or(Value::Null),
            |build| build(event),
        );
        DispatchTask::new(self.router.clone(), args)
            .on_complete(self.on_complete.clone())
            .partition_key(PartitionKey::new(
                "correlationId",
                chain.correlation_id.as_str(),
            ))
            .context(DispatchContext {
                chain: chain.clone(),
                event_id: Some(event.event_id.clone()),
                source: "saga".to_string(),
            })
    }
}
