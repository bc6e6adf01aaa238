//! Command execution coordinator.
//!
//! The coordinator owns the write path of a single command:
//!
//! 1. Idempotency check against the ledger (duplicates get the cached result)
//! 2. Middleware-wrapped handler invocation
//! 3. Interpretation of the [`HandlerResult`]
//! 4. Event append under optimistic concurrency control
//! 5. Fire-and-forget downstream dispatch (projections, saga route, event bus)
//! 6. Terminal ledger status
//!
//! Everything on the write path resolves to a [`CommandResult`]; nothing is
//! returned as `Err`. Downstream dispatch failures never change the result.
//! They are logged, counted, and parked on the coordinator's
//! [dead-letter queue](CommandCoordinator::dead_letters).
//!
//! # Example
//!
//! ```
//! use commandeer_core::registry::{CommandRegistration, TargetAggregate};
//! use commandeer_core::{Command, CommandCategory, EventData, HandlerResult, Version};
//! use commandeer_runtime::coordinator::{CommandConfig, CommandCoordinator, handler_fn};
//! use commandeer_testing::{InMemoryEventStore, InMemoryLedger, RecordingDispatcher, test_clock};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let create_order = CommandConfig::new(
//!     CommandRegistration::aggregate("CreateOrder", "orders", TargetAggregate::new("Order", "orderId")),
//!     handler_fn(|command: Command, _| async move {
//!         let order_id = command.arg_str("orderId").unwrap_or_default().to_string();
//!         Ok(HandlerResult::success(
//!             json!({ "orderId": order_id }),
//!             Version::new(1),
//!             EventData::new("OrderCreated", "Order", order_id, "orders", json!({})),
//!         ))
//!     }),
//! );
//!
//! let coordinator = CommandCoordinator::builder()
//!     .ledger(Arc::new(InMemoryLedger::new()))
//!     .event_store(Arc::new(InMemoryEventStore::new()))
//!     .dispatcher(Arc::new(RecordingDispatcher::new()))
//!     .command(create_order)
//!     .build()
//!     .unwrap();
//!
//! let command = Command::new(
//!     "cmd-1",
//!     "CreateOrder",
//!     "orders",
//!     CommandCategory::Aggregate,
//!     json!({ "orderId": "o1" }),
//!     &test_clock(),
//! );
//! let first = coordinator.execute(command.clone()).await;
//! let again = coordinator.execute(command).await;
//!
//! assert!(first.is_success());
//! assert_eq!(first, again);
//! # });
//! ```

use crate::config::CoordinatorConfig;
use crate::dead_letter::{DeadLetterQueue, DispatchFailure, DispatchKind};
use crate::event_bus::{EventBus, EventBusError};
use crate::metrics::{CommandMetrics, DispatchMetrics};
use crate::middleware::{MiddlewareContext, MiddlewarePipeline};
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::routing::{ProjectionDispatch, SagaRoute};
use commandeer_core::dispatcher::{AsyncDispatcher, DispatchContext, DispatchError, DispatchTask};
use commandeer_core::environment::{Clock, SystemClock};
use commandeer_core::event_store::{EventStore, EventStoreError};
use commandeer_core::ledger::{IdempotencyLedger, LedgerEntry, LedgerStatus, RecordOutcome};
use commandeer_core::registry::{CommandRegistration, CommandRegistry, RegistryError};
use commandeer_core::{
    BoxFuture, Command, CommandResult, Event, EventData, GlobalPosition,
    HandlerResult, Version, codes,
};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Domain handler invoked once per non-duplicate command.
///
/// Returning `Err` is an infrastructure failure; the coordinator converts it
/// into a `HANDLER_ERROR` rejection.
pub trait CommandHandler: Send + Sync {
    /// Decide the outcome of `command`.
    ///
    /// # Errors
    ///
    /// Any error the handler cannot express as a [`HandlerResult`].
    fn handle<'a>(
        &'a self,
        command: &'a Command,
        context: &'a MiddlewareContext,
    ) -> BoxFuture<'a, anyhow::Result<HandlerResult>>;
}

/// [`CommandHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure taking owned `(Command, MiddlewareContext)` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command, MiddlewareContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command, MiddlewareContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        command: &'a Command,
        context: &'a MiddlewareContext,
    ) -> BoxFuture<'a, anyhow::Result<HandlerResult>> {
        Box::pin((self.0)(command.clone(), context.clone()))
    }
}

/// The single-command contract the batch executor drives.
pub trait CommandExecutor: Send + Sync {
    /// Execute one command to a terminal result.
    fn execute(&self, command: Command) -> BoxFuture<'_, CommandResult>;
}

/// Everything the coordinator needs to run one command type.
#[derive(Clone)]
pub struct CommandConfig {
    registration: CommandRegistration,
    handler: Arc<dyn CommandHandler>,
    projection: Option<ProjectionDispatch>,
    secondary_projections: Vec<ProjectionDispatch>,
    failure_projection: Option<ProjectionDispatch>,
    saga_route: Option<SagaRoute>,
    publish_to_event_bus: bool,
}

impl fmt::Debug for CommandConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandConfig")
            .field("registration", &self.registration)
            .field("projection", &self.projection)
            .field("secondary_projections", &self.secondary_projections)
            .field("failure_projection", &self.failure_projection)
            .field("saga_route", &self.saga_route)
            .field("publish_to_event_bus", &self.publish_to_event_bus)
            .finish_non_exhaustive()
    }
}

impl CommandConfig {
    /// A command type with no downstream routes.
    #[must_use]
    pub fn new(registration: CommandRegistration, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            registration,
            handler,
            projection: None,
            secondary_projections: Vec::new(),
            failure_projection: None,
            saga_route: None,
            publish_to_event_bus: false,
        }
    }

    /// Primary projection, dispatched after a successful append.
    #[must_use]
    pub fn with_projection(mut self, projection: ProjectionDispatch) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Additional projection, dispatched concurrently after the primary one.
    #[must_use]
    pub fn with_secondary_projection(mut self, projection: ProjectionDispatch) -> Self {
        self.secondary_projections.push(projection);
        self
    }

    /// Projection dispatched when the handler reports a business failure.
    #[must_use]
    pub fn with_failure_projection(mut self, projection: ProjectionDispatch) -> Self {
        self.failure_projection = Some(projection);
        self
    }

    /// Cross-context route for the appended event.
    #[must_use]
    pub fn with_saga_route(mut self, route: SagaRoute) -> Self {
        self.saga_route = Some(route);
        self
    }

    /// Publish appended events to the coordinator's event bus.
    #[must_use]
    pub const fn publish_to_event_bus(mut self) -> Self {
        self.publish_to_event_bus = true;
        self
    }

    /// Registration metadata.
    #[must_use]
    pub const fn registration(&self) -> &CommandRegistration {
        &self.registration
    }

    /// Command type.
    #[must_use]
    pub fn command_type(&self) -> &str {
        &self.registration.command_type
    }
}

/// Errors raised while building a coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No idempotency ledger was provided.
    #[error("Coordinator requires an idempotency ledger")]
    MissingLedger,

    /// No event store was provided.
    #[error("Coordinator requires an event store")]
    MissingEventStore,

    /// No dispatcher was provided.
    #[error("Coordinator requires an async dispatcher")]
    MissingDispatcher,

    /// Two configs share a command type.
    #[error("Command type configured twice: {0}")]
    DuplicateCommand(String),

    /// A registration is invalid.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A command publishes to the event bus but none was provided.
    #[error("Command {0} publishes to the event bus but no event bus is configured")]
    EventBusNotConfigured(String),
}

/// Builder for [`CommandCoordinator`].
#[derive(Default)]
pub struct CommandCoordinatorBuilder {
    ledger: Option<Arc<dyn IdempotencyLedger>>,
    event_store: Option<Arc<dyn EventStore>>,
    dispatcher: Option<Arc<dyn AsyncDispatcher>>,
    event_bus: Option<Arc<EventBus>>,
    pipeline: Option<Arc<MiddlewarePipeline>>,
    clock: Option<Arc<dyn Clock>>,
    config: CoordinatorConfig,
    commands: Vec<CommandConfig>,
}

impl CommandCoordinatorBuilder {
    /// Idempotency ledger (required).
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Durable log (required).
    #[must_use]
    pub fn event_store(mut self, event_store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(event_store);
        self
    }

    /// Dispatcher for projections and saga routes (required).
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn AsyncDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Event bus for commands that publish.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Middleware pipeline. Defaults to an empty one.
    #[must_use]
    pub fn middleware(mut self, pipeline: Arc<MiddlewarePipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Clock for event timestamps and derived chains. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a command type.
    #[must_use]
    pub fn command(mut self, command: CommandConfig) -> Self {
        self.commands.push(command);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if a required collaborator is missing, a command
    /// type is configured twice, a registration is invalid, or a command
    /// publishes without an event bus.
    pub fn build(self) -> Result<CommandCoordinator, BuildError> {
        let ledger = self.ledger.ok_or(BuildError::MissingLedger)?;
        let event_store = self.event_store.ok_or(BuildError::MissingEventStore)?;
        let dispatcher = self.dispatcher.ok_or(BuildError::MissingDispatcher)?;

        let mut registry = CommandRegistry::new();
        let mut commands = HashMap::with_capacity(self.commands.len());
        for command in self.commands {
            let command_type = command.command_type().to_string();
            if commands.contains_key(&command_type) {
                return Err(BuildError::DuplicateCommand(command_type));
            }
            if command.publish_to_event_bus && self.event_bus.is_none() {
                return Err(BuildError::EventBusNotConfigured(command_type));
            }
            registry.register(command.registration.clone())?;
            commands.insert(command_type, command);
        }

        tracing::info!(
            commands = commands.len(),
            event_bus = self.event_bus.is_some(),
            "Command coordinator built"
        );

        Ok(CommandCoordinator {
            commands,
            registry: Arc::new(registry),
            ledger,
            event_store,
            dispatcher,
            event_bus: self.event_bus,
            pipeline: self
                .pipeline
                .unwrap_or_else(|| Arc::new(MiddlewarePipeline::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            dead_letters: DeadLetterQueue::new(self.config.dlq_max_size),
            config: self.config,
        })
    }
}

/// Top-level orchestrator for single commands.
pub struct CommandCoordinator {
    commands: HashMap<String, CommandConfig>,
    registry: Arc<CommandRegistry>,
    ledger: Arc<dyn IdempotencyLedger>,
    event_store: Arc<dyn EventStore>,
    dispatcher: Arc<dyn AsyncDispatcher>,
    event_bus: Option<Arc<EventBus>>,
    pipeline: Arc<MiddlewarePipeline>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    dead_letters: DeadLetterQueue<DispatchFailure>,
}

impl fmt::Debug for CommandCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCoordinator")
            .field("commands", &self.registry.command_types())
            .field("middleware", &self.pipeline.names())
            .field("event_bus", &self.event_bus.is_some())
            .field("config", &self.config)
            .field("dead_letters", &self.dead_letters.len())
            .finish_non_exhaustive()
    }
}

/// Releases a `Pending` ledger entry when dropped while still armed.
///
/// Armed from a successful `record_command` until the append starts or the
/// terminal status is recorded. A cancelled or panicking execution drops it
/// armed, so nothing was appended and the id may be submitted again.
struct PendingGuard {
    ledger: Arc<dyn IdempotencyLedger>,
    command_id: String,
    armed: bool,
}

impl PendingGuard {
    fn new(ledger: Arc<dyn IdempotencyLedger>, command_id: &str) -> Self {
        Self {
            ledger,
            command_id: command_id.to_string(),
            armed: true,
        }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                command_id = %self.command_id,
                "No runtime to release abandoned ledger entry"
            );
            return;
        };

        let ledger = Arc::clone(&self.ledger);
        let command_id = std::mem::take(&mut self.command_id);
        CommandMetrics::record_abandoned();
        runtime.spawn(async move {
            match ledger.release_pending(&command_id).await {
                Ok(released) => {
                    tracing::warn!(%command_id, released, "Released abandoned command from ledger");
                }
                Err(error) => {
                    tracing::error!(%command_id, error = %error, "Failed to release abandoned command");
                }
            }
        });
    }
}

/// Appended event and where it landed.
struct Appended {
    event: Event,
    version: Version,
    global_position: GlobalPosition,
}

impl CommandCoordinator {
    /// Start building a coordinator.
    #[must_use]
    pub fn builder() -> CommandCoordinatorBuilder {
        CommandCoordinatorBuilder::default()
    }

    /// Registrations of every configured command type.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Downstream dispatch failures parked since the last drain.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue<DispatchFailure> {
        &self.dead_letters
    }

    /// The middleware pipeline; middlewares may be added at runtime.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<MiddlewarePipeline> {
        &self.pipeline
    }

    /// The event bus, if configured.
    #[must_use]
    pub const fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.event_bus.as_ref()
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Execute a command to a terminal result.
    ///
    /// A command id that already reached a terminal state returns the cached
    /// result without running middleware, the handler, or any dispatch.
    #[tracing::instrument(
        skip(self, command),
        name = "command_execute",
        fields(
            command_id = %command.id,
            command_type = %command.command_type,
            correlation_id = %command.chain.correlation_id
        )
    )]
    pub async fn execute(&self, command: Command) -> CommandResult {
        let start = Instant::now();

        let Some(config) = self.commands.get(&command.command_type) else {
            tracing::warn!("Unknown command type");
            let result = CommandResult::rejected(
                codes::UNKNOWN_COMMAND,
                format!("Unknown command type: {}", command.command_type),
            );
            CommandMetrics::record_unknown(start.elapsed());
            return result;
        };

        match self.ledger.record_command(LedgerEntry::pending(&command)).await {
            Ok(RecordOutcome::New) => {}
            Ok(RecordOutcome::Duplicate {
                result: Some(cached),
                status,
            }) => {
                tracing::info!(%status, "Duplicate submission, returning cached result");
                CommandMetrics::record_duplicate();
                return cached;
            }
            Ok(RecordOutcome::Duplicate { result: None, .. }) => {
                tracing::warn!("Duplicate submission while first is still pending");
                CommandMetrics::record_duplicate();
                return CommandResult::rejected(
                    codes::COMMAND_IN_PROGRESS,
                    format!("Command {} is already executing", command.id),
                );
            }
            Err(error) => {
                tracing::error!(error = %error, "Idempotency ledger unavailable");
                let result = CommandResult::rejected(codes::LEDGER_UNAVAILABLE, error.to_string());
                CommandMetrics::record_outcome(&command.command_type, result.outcome(), start.elapsed());
                return result;
            }
        }

        let mut pending = PendingGuard::new(Arc::clone(&self.ledger), &command.id);

        let context = MiddlewareContext::for_command(&command, Some(config.registration.clone()));
        let handler = &config.handler;
        let cmd = &command;
        let outcome = self
            .pipeline
            .execute(&command, context, |context| async move {
                handler.handle(cmd, &context).await
            })
            .await;

        let handler_result = outcome.result;
        let (status, result) = match &handler_result {
            HandlerResult::Rejected {
                code,
                reason,
                context,
            } => {
                tracing::info!(code = %code, reason = %reason, "Command rejected");
                (
                    LedgerStatus::Rejected,
                    CommandResult::Rejected {
                        code: code.clone(),
                        reason: reason.clone(),
                        context: context.clone(),
                    },
                )
            }
            HandlerResult::Success {
                data,
                version,
                event,
            } => {
                pending.disarm();
                match self.append(&command, event.clone(), version.previous()).await {
                    Ok(appended) => {
                        self.dispatch_downstream(config, &command, &handler_result, &appended, false)
                            .await;
                        (
                            LedgerStatus::Executed,
                            CommandResult::Success {
                                data: data.clone(),
                                version: appended.version,
                                event_id: appended.event.event_id,
                                global_position: appended.global_position,
                            },
                        )
                    }
                    Err(rejection) => (LedgerStatus::Rejected, rejection),
                }
            }
            HandlerResult::Failed {
                reason,
                event,
                expected_version,
                context,
            } => {
                let expected = expected_version.unwrap_or(Version::INITIAL);
                pending.disarm();
                match self.append(&command, event.clone(), expected).await {
                    Ok(appended) => {
                        tracing::info!(reason = %reason, "Command completed as business failure");
                        self.dispatch_downstream(config, &command, &handler_result, &appended, true)
                            .await;
                        (
                            LedgerStatus::Executed,
                            CommandResult::Failed {
                                reason: reason.clone(),
                                event_id: appended.event.event_id,
                                global_position: appended.global_position,
                                context: context.clone(),
                            },
                        )
                    }
                    Err(rejection) => (LedgerStatus::Rejected, rejection),
                }
            }
        };

        match self
            .ledger
            .update_result(&command.id, status, result.clone())
            .await
        {
            Ok(()) => pending.disarm(),
            Err(error) => {
                tracing::error!(error = %error, %status, "Failed to record terminal ledger status");
            }
        }

        CommandMetrics::record_outcome(&command.command_type, result.outcome(), start.elapsed());
        tracing::debug!(outcome = result.outcome(), "Command finished");
        result
    }

    /// Execute, retrying concurrency conflicts under `policy`.
    ///
    /// The conflicted id is terminal in the ledger, so each retry is submitted
    /// as `{id}.retry-{n}` with a chain caused by the original command. Any
    /// non-conflict result ends the loop. `None` uses the configured default
    /// policy.
    pub async fn execute_with_retry(
        &self,
        command: Command,
        policy: Option<&RetryPolicy>,
    ) -> CommandResult {
        let policy = policy
            .cloned()
            .unwrap_or_else(|| self.config.default_retry_policy.clone());
        let mut attempt = 0usize;

        let outcome = retry_with_predicate(
            policy,
            || {
                let next = if attempt == 0 {
                    command.clone()
                } else {
                    self.retry_command(&command, attempt)
                };
                attempt += 1;
                async move {
                    let result = self.execute(next).await;
                    if result.is_conflict() {
                        Err(result)
                    } else {
                        Ok(result)
                    }
                }
            },
            CommandResult::is_conflict,
        )
        .await;

        match outcome {
            Ok(result) | Err(result) => result,
        }
    }

    fn retry_command(&self, command: &Command, attempt: usize) -> Command {
        let id = format!("{}.retry-{attempt}", command.id);
        let chain = command.chain.caused_by_command(id.as_str(), self.clock.now());
        Command {
            id,
            ..command.clone()
        }
        .with_chain(chain)
    }

    /// Stamp and append one event. Failures come back as the rejection to
    /// record.
    async fn append(
        &self,
        command: &Command,
        event: EventData,
        expected: Version,
    ) -> Result<Appended, CommandResult> {
        let event = event.stamp(&command.chain, self.clock.now());
        let stream_type = event.stream_type.clone();
        let stream_id = event.stream_id.clone();

        match self
            .event_store
            .append_to_stream(&stream_type, &stream_id, expected, vec![event.clone()])
            .await
        {
            Ok(append) => {
                let global_position = append.first_position().unwrap_or_default();
                tracing::debug!(
                    stream_type = %stream_type,
                    stream_id = %stream_id,
                    version = %append.new_version,
                    global_position = %global_position,
                    "Event appended"
                );
                Ok(Appended {
                    event,
                    version: append.new_version,
                    global_position,
                })
            }
            Err(EventStoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                tracing::warn!(
                    stream_type = %stream_type,
                    stream_id = %stream_id,
                    expected = %expected,
                    actual = %actual,
                    "Concurrency conflict on append"
                );
                CommandMetrics::record_conflict(&command.command_type);
                Err(CommandResult::Rejected {
                    code: codes::CONCURRENCY_CONFLICT.to_string(),
                    reason: format!(
                        "Stream {stream_type}/{stream_id} is at version {actual}, expected {expected}"
                    ),
                    context: Some(json!({
                        "streamType": stream_type,
                        "streamId": stream_id,
                        "expectedVersion": expected,
                        "actualVersion": actual,
                    })),
                })
            }
            Err(error) => {
                tracing::error!(
                    stream_type = %stream_type,
                    stream_id = %stream_id,
                    error = %error,
                    "Event append failed"
                );
                Err(CommandResult::rejected(codes::APPEND_FAILED, error.to_string()))
            }
        }
    }

    /// Enqueue every downstream route for an appended event.
    ///
    /// Order: primary (or failure) projection, secondary projections
    /// concurrently, saga route, event bus.
    async fn dispatch_downstream(
        &self,
        config: &CommandConfig,
        command: &Command,
        result: &HandlerResult,
        appended: &Appended,
        business_failure: bool,
    ) {
        let context = DispatchContext {
            chain: command.chain.clone(),
            event_id: Some(appended.event.event_id.clone()),
            source: "projection".to_string(),
        };

        let primary = if business_failure {
            config.failure_projection.as_ref()
        } else {
            config.projection.as_ref()
        };
        if let Some(projection) = primary {
            let task = projection.task(
                &command.args,
                result,
                appended.global_position,
                context.clone(),
            );
            self.enqueue(DispatchKind::Projection, command, task).await;
        }

        if !config.secondary_projections.is_empty() {
            let secondaries = config.secondary_projections.iter().map(|projection| {
                let task = projection.task(
                    &command.args,
                    result,
                    appended.global_position,
                    context.clone(),
                );
                self.enqueue(DispatchKind::SecondaryProjection, command, task)
            });
            join_all(secondaries).await;
        }

        if let Some(route) = &config.saga_route {
            let task = route.task(&appended.event, &command.chain);
            self.enqueue(DispatchKind::Saga, command, task).await;
        }

        if config.publish_to_event_bus {
            if let Some(bus) = &self.event_bus {
                match bus.publish(&appended.event, &command.chain).await {
                    Ok(published) => {
                        DispatchMetrics::record_enqueued(DispatchKind::Subscription.as_str());
                        tracing::debug!(
                            matched = published.matched_count,
                            triggered = published.triggered_subscriptions.len(),
                            "Event published"
                        );
                    }
                    Err(EventBusError::DispatchFailed { task, source, .. }) => {
                        self.record_failure(DispatchKind::Subscription, command, *task, &source);
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "Event bus publish failed");
                    }
                }
            }
        }
    }

    async fn enqueue(&self, kind: DispatchKind, command: &Command, task: DispatchTask) {
        match self.dispatcher.enqueue(task.clone()).await {
            Ok(handle) => {
                DispatchMetrics::record_enqueued(kind.as_str());
                tracing::debug!(
                    %kind,
                    handler = %task.handler.as_str(),
                    task = %handle.0,
                    "Downstream task enqueued"
                );
            }
            Err(error) => self.record_failure(kind, command, task, &error),
        }
    }

    fn record_failure(
        &self,
        kind: DispatchKind,
        command: &Command,
        task: DispatchTask,
        error: &DispatchError,
    ) {
        DispatchMetrics::record_failure(kind.as_str());
        tracing::error!(
            %kind,
            handler = %task.handler.as_str(),
            error = %error,
            "Downstream dispatch failed, parking on dead-letter queue"
        );
        self.dead_letters.push(
            DispatchFailure {
                kind,
                command_id: command.id.clone(),
                correlation_id: command.chain.correlation_id.clone(),
                handler: task.handler.clone(),
                task,
            },
            error.to_string(),
            1,
        );
    }
}

impl CommandExecutor for CommandCoordinator {
    fn execute(&self, command: Command) -> BoxFuture<'_, CommandResult> {
        Box::pin(Self::execute(self, command))
    }
}
