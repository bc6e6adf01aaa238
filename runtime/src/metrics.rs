//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for all orchestration components:
//! - Command execution outcomes and latency
//! - Middleware short-circuits and after-hook errors
//! - Downstream dispatch (projections, saga routes, subscriptions)
//! - Event bus publish
//! - Batch execution
//! - Dead-letter queue and caller-driven retries
//!
//! Recorders are plain `metrics` macro calls, so they are no-ops until a
//! recorder is installed (e.g. by [`MetricsServer::start`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use commandeer_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter handle.
///
/// Installs the global recorder and renders the scrape payload. Serving the
/// payload over HTTP is left to the host application.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for the given scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and returns `Ok` without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// The address the host application should serve the payload on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Command execution
    describe_counter!(
        "commands_executed_total",
        "Commands that reached a terminal result, by command type and outcome"
    );
    describe_counter!(
        "commands_duplicate_total",
        "Submissions answered from the idempotency ledger"
    );
    describe_counter!(
        "commands_unknown_total",
        "Submissions naming an unregistered command type"
    );
    describe_counter!(
        "commands_abandoned_total",
        "Executions dropped before the append; their ledger entry is released"
    );
    describe_counter!(
        "command_conflicts_total",
        "Appends that lost an optimistic concurrency race"
    );
    describe_histogram!(
        "command_execution_duration_seconds",
        "Time from submission to terminal result"
    );

    // Middleware
    describe_counter!(
        "middleware_short_circuits_total",
        "Before-hooks that ended a command early"
    );
    describe_counter!(
        "middleware_after_errors_total",
        "After-hook errors that were swallowed"
    );
    describe_histogram!(
        "command_pipeline_duration_seconds",
        "Time spent inside the middleware pipeline"
    );

    // Downstream dispatch
    describe_counter!(
        "dispatch_enqueued_total",
        "Tasks handed to the asynchronous dispatcher, by kind"
    );
    describe_counter!(
        "dispatch_failures_total",
        "Tasks the asynchronous dispatcher refused, by kind"
    );

    // Event bus
    describe_counter!("event_bus_publish_total", "Events published to the event bus");
    describe_counter!(
        "event_bus_subscriptions_triggered_total",
        "Subscription tasks enqueued by publish"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Publish calls aborted by a dispatcher failure"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to publish one event"
    );

    // Batch
    describe_counter!("batch_executions_total", "Batches executed, by mode and status");
    describe_counter!("batch_items_total", "Batch items, by status");
    describe_histogram!(
        "batch_execution_duration_seconds",
        "Time taken to execute one batch"
    );

    // Dead letters
    describe_gauge!("dead_letter_queue_size", "Current dead-letter queue size");
    describe_counter!("dead_letters_pushed_total", "Entries added to the dead-letter queue");
    describe_counter!(
        "dead_letters_dropped_total",
        "Entries evicted from a full dead-letter queue"
    );
    describe_counter!("dead_letters_drained_total", "Entries drained for inspection");

    // Retry
    describe_counter!("retry_attempts_total", "Caller-driven retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!(
        "retry_exhausted_total",
        "Operations that failed after exhausting retries"
    );
}

/// Command execution metrics recorder.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Record a terminal result.
    pub fn record_outcome(command_type: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "commands_executed_total",
            "command_type" => command_type.to_owned(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("command_execution_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a submission with an unregistered type.
    ///
    /// Not labelled by type: the name is caller-supplied.
    pub fn record_unknown(duration: Duration) {
        counter!("commands_unknown_total").increment(1);
        histogram!("command_execution_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an execution abandoned before its append.
    pub fn record_abandoned() {
        counter!("commands_abandoned_total").increment(1);
    }

    /// Record a submission served from the ledger.
    pub fn record_duplicate() {
        counter!("commands_duplicate_total").increment(1);
    }

    /// Record an OCC conflict.
    pub fn record_conflict(command_type: &str) {
        counter!("command_conflicts_total", "command_type" => command_type.to_owned())
            .increment(1);
    }
}

/// Middleware metrics recorder.
pub struct MiddlewareMetrics;

impl MiddlewareMetrics {
    /// Record a before-hook short-circuit.
    pub fn record_short_circuit(middleware: &str) {
        counter!("middleware_short_circuits_total", "middleware" => middleware.to_owned())
            .increment(1);
    }

    /// Record a swallowed after-hook error.
    pub fn record_after_error(middleware: &str) {
        counter!("middleware_after_errors_total", "middleware" => middleware.to_owned())
            .increment(1);
    }

    /// Record time spent in the pipeline.
    pub fn record_pipeline(duration: Duration) {
        histogram!("command_pipeline_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Downstream dispatch metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record an accepted enqueue.
    pub fn record_enqueued(kind: &'static str) {
        counter!("dispatch_enqueued_total", "kind" => kind).increment(1);
    }

    /// Record a refused enqueue.
    pub fn record_failure(kind: &'static str) {
        counter!("dispatch_failures_total", "kind" => kind).increment(1);
    }
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a completed publish.
    pub fn record_publish(triggered: usize, duration: Duration) {
        counter!("event_bus_publish_total").increment(1);
        counter!("event_bus_subscriptions_triggered_total").increment(triggered as u64);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an aborted publish.
    pub fn record_publish_error() {
        counter!("event_bus_publish_errors_total").increment(1);
    }
}

/// Batch metrics recorder.
pub struct BatchMetrics;

impl BatchMetrics {
    /// Record a finished batch.
    pub fn record_batch(mode: &'static str, status: &'static str, duration: Duration) {
        counter!("batch_executions_total", "mode" => mode, "status" => status).increment(1);
        histogram!("batch_execution_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record item outcomes.
    pub fn record_items(status: &'static str, count: usize) {
        if count > 0 {
            counter!("batch_items_total", "status" => status).increment(count as u64);
        }
    }
}

/// Dead-letter queue metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a push and the resulting queue size.
    #[allow(clippy::cast_precision_loss)] // queue size is bounded by max_size
    pub fn record_push(size: usize) {
        counter!("dead_letters_pushed_total").increment(1);
        gauge!("dead_letter_queue_size").set(size as f64);
    }

    /// Record an eviction.
    pub fn record_dropped() {
        counter!("dead_letters_dropped_total").increment(1);
    }

    /// Record a drain.
    pub fn record_drained(count: usize) {
        counter!("dead_letters_drained_total").increment(count as u64);
        gauge!("dead_letter_queue_size").set(0.0);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        CommandMetrics::record_outcome("CreateOrder", "success", Duration::from_millis(3));
        EventBusMetrics::record_publish(2, Duration::from_millis(1));
        BatchMetrics::record_batch("atomic", "success", Duration::from_millis(5));

        // Another test may already own the global recorder.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("commands_executed_total"));
            assert!(rendered.contains("event_bus_publish_total"));
            assert!(rendered.contains("batch_executions_total"));
        }
    }

    #[test]
    fn test_recorders_without_recorder_are_noops() {
        CommandMetrics::record_duplicate();
        CommandMetrics::record_unknown(Duration::from_millis(1));
        CommandMetrics::record_abandoned();
        CommandMetrics::record_conflict("CreateOrder");
        MiddlewareMetrics::record_short_circuit("auth");
        DispatchMetrics::record_failure("projection");
        DeadLetterMetrics::record_push(1);
        RetryMetrics::record_attempt();
    }
}
