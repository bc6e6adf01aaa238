//! Integration tests for event bus publish semantics
//!
//! Filter matching, priority-ordered dispatch, and abort-on-failure.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use commandeer_core::dispatcher::PartitionKey;
use commandeer_core::environment::Clock;
use commandeer_core::{CorrelationChain, Event, EventCategory, EventData};
use commandeer_runtime::event_bus::{EventBus, EventBusError, Subscription};
use commandeer_testing::{RecordingDispatcher, fixtures, test_clock};
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn event(event_type: &str, category: EventCategory) -> Event {
    fixtures::event(
        EventData::new(event_type, "Order", "o1", "orders", json!({ "total": 42 }))
            .with_category(category),
    )
}

fn chain() -> CorrelationChain {
    CorrelationChain::root("cmd-1", test_clock().now()).with_correlation_id("corr-1")
}

fn subscription(name: &str, priority: i32) -> Subscription {
    Subscription::builder(name)
        .priority(priority)
        .handler(format!("handlers.{name}"))
        .forward_event()
        .build()
        .unwrap()
}

// ============================================================================
// Filtering
// ============================================================================

#[tokio::test]
async fn filter_is_and_across_fields_or_within() {
    let dispatcher = RecordingDispatcher::new();
    let bus = EventBus::builder()
        .dispatcher(Arc::new(dispatcher.clone()))
        .subscribe(
            Subscription::builder("domain-a")
                .event_types(["A"])
                .categories([EventCategory::Domain])
                .handler("handlers.domain_a")
                .forward_event()
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let hit = bus.publish(&event("A", EventCategory::Domain), &chain()).await.unwrap();
    let wrong_type = bus.publish(&event("B", EventCategory::Domain), &chain()).await.unwrap();
    let wrong_category = bus
        .publish(&event("A", EventCategory::Integration), &chain())
        .await
        .unwrap();

    assert_eq!(hit.matched_count, 1);
    assert_eq!(wrong_type.matched_count, 0);
    assert_eq!(wrong_category.matched_count, 0);
    assert!(wrong_type.success);
    assert_eq!(dispatcher.len(), 1);
}

#[tokio::test]
async fn wildcard_subscription_receives_everything() {
    let dispatcher = RecordingDispatcher::new();
    let bus = EventBus::builder()
        .dispatcher(Arc::new(dispatcher.clone()))
        .subscribe(subscription("audit", 100))
        .subscribe(
            Subscription::builder("typed")
                .event_types(["A", "B"])
                .handler("handlers.typed")
                .forward_event()
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    assert!(bus.has_subscribers_for("Z"));
    let result = bus
        .publish(&event("Z", EventCategory::Trigger), &chain())
        .await
        .unwrap();
    assert_eq!(result.triggered_subscriptions, vec!["audit"]);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn subscriptions_trigger_in_priority_order() {
    let dispatcher = RecordingDispatcher::new();
    let bus = EventBus::builder()
        .dispatcher(Arc::new(dispatcher.clone()))
        .subscribe(subscription("late", 300))
        .subscribe(subscription("early", 50))
        .subscribe(subscription("middle", 150))
        .build()
        .unwrap();

    let result = bus
        .publish(&event("OrderPlaced", EventCategory::Domain), &chain())
        .await
        .unwrap();

    assert_eq!(result.triggered_subscriptions, vec!["early", "middle", "late"]);
    assert_eq!(
        dispatcher.handlers(),
        vec!["handlers.early", "handlers.middle", "handlers.late"]
    );
    for task in dispatcher.tasks() {
        assert_eq!(task.options.partition_key, Some(PartitionKey::new("streamId", "o1")));
        assert_eq!(task.options.context.unwrap().chain.correlation_id, "corr-1");
    }
}

#[tokio::test]
async fn failed_enqueue_stops_lower_priorities() {
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail_handler("handlers.middle");
    let bus = EventBus::builder()
        .dispatcher(Arc::new(dispatcher.clone()))
        .subscribe(subscription("early", 50))
        .subscribe(subscription("middle", 150))
        .subscribe(subscription("late", 300))
        .build()
        .unwrap();

    let error = bus
        .publish(&event("OrderPlaced", EventCategory::Domain), &chain())
        .await
        .unwrap_err();

    match error {
        EventBusError::DispatchFailed {
            subscription,
            triggered,
            ..
        } => {
            assert_eq!(subscription, "middle");
            assert_eq!(triggered, vec!["early"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(dispatcher.handlers(), vec!["handlers.early"]);
}

#[tokio::test]
async fn bus_default_on_complete_applies_when_subscription_has_none() {
    let dispatcher = RecordingDispatcher::new();
    let bus = EventBus::builder()
        .dispatcher(Arc::new(dispatcher.clone()))
        .default_on_complete("handlers.track")
        .subscribe(subscription("plain", 100))
        .subscribe(
            Subscription::builder("own")
                .handler("handlers.own")
                .transform(|event: &Event, _: &CorrelationChain| json!({ "id": event.event_id }))
                .on_complete("handlers.own_done")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    bus.publish(&event("OrderPlaced", EventCategory::Domain), &chain())
        .await
        .unwrap();

    let plain = dispatcher.tasks_for("handlers.plain").remove(0);
    let own = dispatcher.tasks_for("handlers.own").remove(0);
    assert_eq!(plain.options.on_complete.as_ref().map(|h| h.as_str()), Some("handlers.track"));
    assert_eq!(own.options.on_complete.as_ref().map(|h| h.as_str()), Some("handlers.own_done"));
    assert!(own.args["id"].is_string());
}
