//! # Commandeer Runtime
//!
//! Runtime for the Commandeer command orchestration engine.
//!
//! This crate wires the collaborator contracts from `commandeer-core` into the
//! write path of an event-sourced application layer.
//!
//! ## Core Components
//!
//! - **Coordinator**: idempotency check, middleware-wrapped handler call, OCC
//!   append, downstream dispatch, and terminal ledger status for one command
//! - **Middleware Pipeline**: ordered before/after interceptors with
//!   short-circuiting
//! - **Event Bus**: subscription registry with priority- and partition-ordered
//!   dispatch
//! - **Batch Executor**: atomic (single aggregate, fail-fast) and partial
//!   (bounded concurrency) multi-command execution
//!
//! ## Example
//!
//! ```
//! use commandeer_core::registry::{CommandRegistration, TargetAggregate};
//! use commandeer_core::{Command, EventData, HandlerResult, Version};
//! use commandeer_runtime::{
//!     BatchCommand, BatchExecutor, BatchOptions, BatchStatus, CommandConfig, CommandCoordinator,
//!     handler_fn,
//! };
//! use commandeer_testing::{InMemoryEventStore, InMemoryLedger, RecordingDispatcher, test_clock};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let coordinator = Arc::new(
//!     CommandCoordinator::builder()
//!         .ledger(Arc::new(InMemoryLedger::new()))
//!         .event_store(Arc::new(InMemoryEventStore::new()))
//!         .dispatcher(Arc::new(RecordingDispatcher::new()))
//!         .command(CommandConfig::new(
//!             CommandRegistration::aggregate("OpenAccount", "banking", TargetAggregate::new("Account", "accountId")),
//!             handler_fn(|command: Command, _| async move {
//!                 let id = command.arg_str("accountId").unwrap_or_default().to_string();
//!                 Ok(HandlerResult::success(
//!                     json!({}),
//!                     Version::new(1),
//!                     EventData::new("AccountOpened", "Account", id, "banking", json!({})),
//!                 ))
//!             }),
//!         ))
//!         .build()
//!         .unwrap(),
//! );
//!
//! let batch = BatchExecutor::new(coordinator.clone(), coordinator.registry().clone(), Arc::new(test_clock()));
//! let result = batch
//!     .execute(
//!         vec![
//!             BatchCommand::new("OpenAccount", json!({ "accountId": "a1" })),
//!             BatchCommand::new("OpenAccount", json!({ "accountId": "a2" })),
//!         ],
//!         BatchOptions::partial(),
//!     )
//!     .await;
//!
//! assert_eq!(result.status, BatchStatus::Success);
//! # });
//! ```

/// Batch execution (atomic and partial modes)
pub mod batch;

/// Runtime configuration
pub mod config;

/// Single-command orchestration
pub mod coordinator;

/// Bounded queue of failed downstream dispatches
pub mod dead_letter;

/// Publish/subscribe dispatch of appended events
pub mod event_bus;

/// Prometheus metrics for observability
pub mod metrics;

/// Ordered interceptors around handler invocation
pub mod middleware;

/// Retry logic with exponential backoff
pub mod retry;

/// Projection and saga routes
pub mod routing;

pub use batch::{
    BatchCommand, BatchExecutor, BatchItemResult, BatchItemStatus, BatchMode, BatchOptions,
    BatchResult, BatchStatus, BatchSummary, BatchValidationError,
};
pub use config::CoordinatorConfig;
pub use coordinator::{
    BuildError, CommandConfig, CommandCoordinator, CommandCoordinatorBuilder, CommandExecutor,
    CommandHandler, handler_fn,
};
pub use dead_letter::{DeadLetter, DeadLetterQueue, DispatchFailure, DispatchKind};
pub use event_bus::{EventBus, EventBusError, PublishResult, Subscription, SubscriptionFilter};
pub use middleware::{
    BeforeOutcome, Middleware, MiddlewareContext, MiddlewareError, MiddlewarePipeline,
};
pub use retry::RetryPolicy;
pub use routing::{ProjectionDispatch, SagaRoute};
