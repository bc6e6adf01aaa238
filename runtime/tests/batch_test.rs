//! Integration tests for batch execution
//!
//! Pre-flight rejection, atomic fail-fast, the partial-mode concurrency bound,
//! and batches driven through a real coordinator.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use commandeer_core::registry::{CommandRegistration, CommandRegistry, TargetAggregate};
use commandeer_core::{
    BoxFuture, Command, CommandResult, EventData, GlobalPosition, HandlerResult, Version, codes,
};
use commandeer_runtime::{
    BatchCommand, BatchExecutor, BatchItemStatus, BatchOptions, BatchStatus, CommandConfig,
    CommandCoordinator, CommandExecutor, handler_fn,
};
use commandeer_testing::{InMemoryEventStore, InMemoryLedger, RecordingDispatcher, test_clock};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Counts calls and in-flight executions; rejects commands whose args carry
/// `"fail": true`.
#[derive(Default)]
struct ProbeExecutor {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
    order: Mutex<Vec<String>>,
}

impl ProbeExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

impl CommandExecutor for ProbeExecutor {
    fn execute(&self, command: Command) -> BoxFuture<'_, CommandResult> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(command.id.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if command.args["fail"] == json!(true) {
                CommandResult::rejected(codes::VALIDATION_ERROR, "item refused")
            } else {
                CommandResult::Success {
                    data: json!({}),
                    version: Version::new(1),
                    event_id: format!("evt-{}", command.id),
                    global_position: GlobalPosition::new(1),
                }
            }
        })
    }
}

fn registry() -> Arc<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry
        .register(CommandRegistration::aggregate(
            "AddItem",
            "orders",
            TargetAggregate::new("Order", "orderId"),
        ))
        .unwrap();
    Arc::new(registry)
}

fn batch(probe: &Arc<ProbeExecutor>) -> BatchExecutor {
    BatchExecutor::new(probe.clone(), registry(), Arc::new(test_clock()))
}

fn add_item(id: &str, order_id: &str) -> BatchCommand {
    BatchCommand::new("AddItem", json!({ "orderId": order_id })).with_id(id)
}

// ============================================================================
// Atomic Mode
// ============================================================================

#[tokio::test]
async fn atomic_cross_aggregate_fails_preflight() {
    let probe = Arc::new(ProbeExecutor::default());

    let result = batch(&probe)
        .execute(
            vec![add_item("c1", "a"), add_item("c2", "b")],
            BatchOptions::atomic(),
        )
        .await;

    assert_eq!(result.status, BatchStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("Order/a"));
    assert_eq!(result.summary.skipped, 2);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn atomic_fails_fast() {
    let probe = Arc::new(ProbeExecutor::default());

    let result = batch(&probe)
        .execute(
            vec![
                add_item("c1", "a"),
                BatchCommand::new("AddItem", json!({ "orderId": "a", "fail": true })).with_id("c2"),
                add_item("c3", "a"),
            ],
            BatchOptions::atomic(),
        )
        .await;

    assert_eq!(result.status, BatchStatus::Failed);
    assert_eq!(result.summary.succeeded, 1);
    assert_eq!(result.summary.rejected, 1);
    assert_eq!(result.summary.skipped, 1);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

    let statuses: Vec<_> = result.items.iter().map(|item| item.status).collect();
    assert_eq!(
        statuses,
        vec![
            BatchItemStatus::Success,
            BatchItemStatus::Rejected,
            BatchItemStatus::Skipped
        ]
    );
    assert_eq!(result.items[1].error.as_deref(), Some("item refused"));
    assert_eq!(result.items[2].command_id, "c3");
}

#[tokio::test]
async fn atomic_runs_in_submission_order() {
    let probe = Arc::new(ProbeExecutor::with_delay(Duration::from_millis(2)));

    let ids = ["c1", "c2", "c3", "c4"];
    let result = batch(&probe)
        .execute(
            ids.iter().map(|id| add_item(id, "a")).collect(),
            BatchOptions::atomic().aggregate_id("a"),
        )
        .await;

    assert_eq!(result.status, BatchStatus::Success);
    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    assert_eq!(*probe.order.lock().unwrap(), ids);
}

// ============================================================================
// Partial Mode
// ============================================================================

#[tokio::test]
async fn partial_respects_concurrency_bound() {
    let probe = Arc::new(ProbeExecutor::with_delay(Duration::from_millis(20)));

    let commands = (0..10)
        .map(|i| add_item(&format!("c{i}"), &format!("order-{i}")))
        .collect();
    let result = batch(&probe)
        .execute(commands, BatchOptions::partial().max_concurrency(3))
        .await;

    assert_eq!(result.status, BatchStatus::Success);
    assert_eq!(result.summary.succeeded, 10);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 10);
    let peak = probe.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {peak}");
    assert!(peak > 1, "expected parallel execution, peak was {peak}");

    let indexes: Vec<_> = result.items.iter().map(|item| item.index).collect();
    assert_eq!(indexes, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn partial_reports_mixed_outcomes() {
    let probe = Arc::new(ProbeExecutor::default());

    let result = batch(&probe)
        .execute(
            vec![
                add_item("c1", "a"),
                BatchCommand::new("AddItem", json!({ "orderId": "b", "fail": true })),
                add_item("c3", "c"),
            ],
            BatchOptions::partial().correlation_id("import-7"),
        )
        .await;

    assert_eq!(result.status, BatchStatus::Partial);
    assert_eq!(result.summary.total, 3);
    assert_eq!(result.summary.succeeded, 2);
    assert_eq!(result.summary.rejected, 1);
    assert_eq!(result.correlation_id, "import-7");
    assert!(!result.items[1].command_id.is_empty());
}

#[tokio::test]
async fn partial_all_failures_is_failed() {
    let probe = Arc::new(ProbeExecutor::default());

    let result = batch(&probe)
        .execute(
            vec![BatchCommand::new("AddItem", json!({ "orderId": "a", "fail": true }))],
            BatchOptions::partial(),
        )
        .await;

    assert_eq!(result.status, BatchStatus::Failed);
}

// ============================================================================
// Through the Coordinator
// ============================================================================

#[tokio::test]
async fn batch_through_coordinator_shares_correlation() {
    let store = InMemoryEventStore::new();
    let coordinator = Arc::new(
        CommandCoordinator::builder()
            .ledger(Arc::new(InMemoryLedger::new()))
            .event_store(Arc::new(store.clone()))
            .dispatcher(Arc::new(RecordingDispatcher::new()))
            .clock(Arc::new(test_clock()))
            .command(CommandConfig::new(
                CommandRegistration::aggregate(
                    "AddItem",
                    "orders",
                    TargetAggregate::new("Order", "orderId"),
                ),
                handler_fn({
                    let store = store.clone();
                    move |command: Command, _| {
                        let store = store.clone();
                        async move {
                            let order_id = command.arg_str("orderId").unwrap_or_default().to_string();
                            let next = store.stream_version("Order", &order_id).next();
                            Ok(HandlerResult::success(
                                json!({ "version": next }),
                                next,
                                EventData::new("ItemAdded", "Order", order_id, "orders", command.args),
                            ))
                        }
                    }
                }),
            ))
            .build()
            .unwrap(),
    );
    let batch = BatchExecutor::new(
        coordinator.clone(),
        coordinator.registry().clone(),
        Arc::new(test_clock()),
    );

    let result = batch
        .execute(
            vec![add_item("c1", "o1"), add_item("c2", "o1"), add_item("c3", "o1")],
            BatchOptions::atomic().correlation_id("bulk-1").user_id("u-9"),
        )
        .await;

    assert_eq!(result.status, BatchStatus::Success);
    let events = store.stream_events("Order", "o1");
    assert_eq!(events.len(), 3);
    for event in &events {
        assert_eq!(event.metadata.correlation_id, "bulk-1");
        assert_eq!(event.metadata.user_id.as_deref(), Some("u-9"));
    }

    let replay = batch
        .execute(
            vec![add_item("c1", "o1")],
            BatchOptions::atomic().correlation_id("bulk-1"),
        )
        .await;
    assert_eq!(replay.items[0].result, result.items[0].result);
    assert_eq!(store.stream_len("Order", "o1"), 3);
}
