//! Batch execution on top of the single-command contract.
//!
//! Two modes:
//!
//! - **Atomic**: every command targets the same aggregate instance; items run
//!   strictly in order and the first non-success skips the rest. Already
//!   applied commands are not rolled back, so this is ordering plus fail-fast,
//!   not a transaction.
//! - **Partial**: commands may span aggregates and run with bounded
//!   concurrency. Failures are reported per item; with `continue_on_error`
//!   disabled, items not yet started are skipped after the first failure.
//!
//! Pre-flight validation runs before anything executes. A batch that fails it
//! invokes the executor zero times.

use crate::coordinator::CommandExecutor;
use crate::metrics::BatchMetrics;
use commandeer_core::command::generate_id;
use commandeer_core::environment::Clock;
use commandeer_core::registry::Registry;
use commandeer_core::{Command, CommandCategory, CommandResult, CorrelationChain};
use futures::future::join_all;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

/// How a batch executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Single aggregate, sequential, fail-fast.
    #[default]
    Atomic,
    /// Any aggregates, bounded concurrency.
    Partial,
}

impl BatchMode {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Partial => "partial",
        }
    }
}

/// Options for one batch.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Execution mode.
    pub mode: BatchMode,
    /// Aggregate id every atomic command must target. Inferred from the first
    /// command when absent.
    pub aggregate_id: Option<String>,
    /// Bounded context every command must belong to.
    pub bounded_context: Option<String>,
    /// Partial mode in-flight limit.
    pub max_concurrency: usize,
    /// Partial mode: keep starting items after a failure.
    pub continue_on_error: bool,
    /// Batch-wide correlation id. Generated when absent.
    pub correlation_id: Option<String>,
    /// Acting user attached to every command.
    pub user_id: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            mode: BatchMode::Atomic,
            aggregate_id: None,
            bounded_context: None,
            max_concurrency: 10,
            continue_on_error: true,
            correlation_id: None,
            user_id: None,
        }
    }
}

impl BatchOptions {
    /// Atomic mode with defaults.
    #[must_use]
    pub fn atomic() -> Self {
        Self::default()
    }

    /// Partial mode with defaults.
    #[must_use]
    pub fn partial() -> Self {
        Self {
            mode: BatchMode::Partial,
            ..Self::default()
        }
    }

    /// Pin the aggregate id.
    #[must_use]
    pub fn aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Pin the bounded context.
    #[must_use]
    pub fn bounded_context(mut self, bounded_context: impl Into<String>) -> Self {
        self.bounded_context = Some(bounded_context.into());
        self
    }

    /// Partial mode in-flight limit.
    #[must_use]
    pub const fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Partial mode: whether to keep starting items after a failure.
    #[must_use]
    pub const fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Batch-wide correlation id.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Acting user.
    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// One command in a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchCommand {
    /// Registered command type.
    pub command_type: String,
    /// Handler input.
    pub args: serde_json::Value,
    /// Idempotency key. Generated when absent.
    pub command_id: Option<String>,
    /// Overrides the batch-wide correlation id.
    pub correlation_id: Option<String>,
}

impl BatchCommand {
    /// A command with a generated id.
    #[must_use]
    pub fn new(command_type: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            command_type: command_type.into(),
            args,
            command_id: None,
            correlation_id: None,
        }
    }

    /// Set the command id.
    #[must_use]
    pub fn with_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    /// Override the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Why a batch failed pre-flight validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchValidationError {
    /// No commands.
    #[error("Batch contains no commands")]
    EmptyBatch,

    /// A command type has no registration.
    #[error("Command {index} has unregistered type {command_type}")]
    UnregisteredCommand {
        /// Item index.
        index: usize,
        /// The unknown type.
        command_type: String,
    },

    /// Atomic batches only accept aggregate commands.
    #[error("Command {index} ({command_type}) is a {category} command; atomic batches require aggregate commands")]
    NotAggregateCommand {
        /// Item index.
        index: usize,
        /// The command type.
        command_type: String,
        /// Its category.
        category: CommandCategory,
    },

    /// A command belongs to a different bounded context than the pinned one.
    #[error("Command {index} ({command_type}) belongs to {actual}, batch is pinned to {expected}")]
    BoundedContextMismatch {
        /// Item index.
        index: usize,
        /// The command type.
        command_type: String,
        /// Pinned context.
        expected: String,
        /// The command's context.
        actual: String,
    },

    /// The aggregate id field is missing from the args.
    #[error("Command {index} ({command_type}) has no aggregate id in field {field}")]
    MissingAggregateId {
        /// Item index.
        index: usize,
        /// The command type.
        command_type: String,
        /// The id field the registration names.
        field: String,
    },

    /// An atomic batch touches more than one aggregate instance.
    #[error("Atomic batch targets {expected} but command {index} targets {found}")]
    CrossAggregate {
        /// Item index.
        index: usize,
        /// The batch's aggregate.
        expected: String,
        /// The item's aggregate.
        found: String,
    },

    /// Partial mode needs at least one slot.
    #[error("max_concurrency must be at least 1")]
    InvalidConcurrency,
}

/// Per-item outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchItemStatus {
    /// Command succeeded.
    Success,
    /// Command was rejected.
    Rejected,
    /// Command completed as a business failure.
    Failed,
    /// Command never ran.
    Skipped,
}

impl BatchItemStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    const fn of(result: &CommandResult) -> Self {
        match result {
            CommandResult::Success { .. } => Self::Success,
            CommandResult::Rejected { .. } => Self::Rejected,
            CommandResult::Failed { .. } => Self::Failed,
        }
    }
}

impl fmt::Display for BatchItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one batch item.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchItemResult {
    /// Position in the submitted batch.
    pub index: usize,
    /// Command id used (empty when the batch failed before ids were assigned).
    pub command_id: String,
    /// Command type.
    pub command_type: String,
    /// Outcome.
    pub status: BatchItemStatus,
    /// The command's result, absent when skipped.
    pub result: Option<CommandResult>,
    /// Error text for non-success items.
    pub error: Option<String>,
    /// Time spent executing this item.
    pub duration: Duration,
}

impl BatchItemResult {
    fn skipped(index: usize, command_id: String, command_type: String, reason: &str) -> Self {
        Self {
            index,
            command_id,
            command_type,
            status: BatchItemStatus::Skipped,
            result: None,
            error: Some(reason.to_string()),
            duration: Duration::ZERO,
        }
    }
}

/// Rolled-up batch outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every item succeeded.
    Success,
    /// Partial mode: some items succeeded.
    Partial,
    /// Nothing useful happened, or atomic mode stopped early.
    Failed,
}

impl BatchStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Item counts by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Number of items.
    pub total: usize,
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that were rejected.
    pub rejected: usize,
    /// Items that completed as business failures.
    pub failed: usize,
    /// Items that never ran.
    pub skipped: usize,
}

impl BatchSummary {
    fn of(items: &[BatchItemResult]) -> Self {
        items.iter().fold(
            Self {
                total: items.len(),
                ..Self::default()
            },
            |mut summary, item| {
                match item.status {
                    BatchItemStatus::Success => summary.succeeded += 1,
                    BatchItemStatus::Rejected => summary.rejected += 1,
                    BatchItemStatus::Failed => summary.failed += 1,
                    BatchItemStatus::Skipped => summary.skipped += 1,
                }
                summary
            },
        )
    }
}

/// Result of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchResult {
    /// Rolled-up status.
    pub status: BatchStatus,
    /// Per-item results in submission order.
    pub items: Vec<BatchItemResult>,
    /// Counts by status.
    pub summary: BatchSummary,
    /// Batch-wide correlation id.
    pub correlation_id: String,
    /// Pre-flight error, if the batch never ran.
    pub error: Option<String>,
    /// Wall time of the whole batch.
    pub duration: Duration,
}

/// Runs batches through a [`CommandExecutor`].
#[derive(Clone)]
pub struct BatchExecutor {
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<dyn Registry>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchExecutor").finish_non_exhaustive()
    }
}

impl BatchExecutor {
    /// Create an executor. The registry is consulted for pre-flight checks and
    /// to stamp each command's bounded context and category.
    #[must_use]
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        registry: Arc<dyn Registry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            registry,
            clock,
        }
    }

    /// Validate and run a batch.
    #[tracing::instrument(
        skip(self, commands, options),
        name = "batch_execute",
        fields(size = commands.len(), mode = options.mode.as_str())
    )]
    pub async fn execute(&self, commands: Vec<BatchCommand>, options: BatchOptions) -> BatchResult {
        let start = Instant::now();
        let correlation_id = options.correlation_id.clone().unwrap_or_else(generate_id);

        let prepared = match self.prepare(&commands, &options, &correlation_id) {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::warn!(error = %error, "Batch failed pre-flight validation");
                let reason = error.to_string();
                let items = commands
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        BatchItemResult::skipped(
                            index,
                            item.command_id.unwrap_or_default(),
                            item.command_type,
                            &reason,
                        )
                    })
                    .collect();
                return Self::finish(
                    options.mode,
                    BatchStatus::Failed,
                    items,
                    correlation_id,
                    Some(reason),
                    start,
                );
            }
        };

        let items = match options.mode {
            BatchMode::Atomic => self.run_atomic(prepared).await,
            BatchMode::Partial => {
                self.run_partial(prepared, options.max_concurrency, options.continue_on_error)
                    .await
            }
        };

        let summary = BatchSummary::of(&items);
        let status = if summary.succeeded == summary.total {
            BatchStatus::Success
        } else if options.mode == BatchMode::Partial && summary.succeeded > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        };

        Self::finish(options.mode, status, items, correlation_id, None, start)
    }

    fn finish(
        mode: BatchMode,
        status: BatchStatus,
        items: Vec<BatchItemResult>,
        correlation_id: String,
        error: Option<String>,
        start: Instant,
    ) -> BatchResult {
        let summary = BatchSummary::of(&items);
        let duration = start.elapsed();

        BatchMetrics::record_batch(mode.as_str(), status.as_str(), duration);
        for (item_status, count) in [
            (BatchItemStatus::Success, summary.succeeded),
            (BatchItemStatus::Rejected, summary.rejected),
            (BatchItemStatus::Failed, summary.failed),
            (BatchItemStatus::Skipped, summary.skipped),
        ] {
            BatchMetrics::record_items(item_status.as_str(), count);
        }

        tracing::info!(
            status = status.as_str(),
            total = summary.total,
            succeeded = summary.succeeded,
            rejected = summary.rejected,
            failed = summary.failed,
            skipped = summary.skipped,
            "Batch finished"
        );

        BatchResult {
            status,
            items,
            summary,
            correlation_id,
            error,
            duration,
        }
    }

    /// Pre-flight validation and command construction. No side effects.
    fn prepare(
        &self,
        commands: &[BatchCommand],
        options: &BatchOptions,
        correlation_id: &str,
    ) -> Result<Vec<Command>, BatchValidationError> {
        if commands.is_empty() {
            return Err(BatchValidationError::EmptyBatch);
        }
        if options.mode == BatchMode::Partial && options.max_concurrency == 0 {
            return Err(BatchValidationError::InvalidConcurrency);
        }

        let mut target: Option<(String, String)> = None;
        let mut prepared = Vec::with_capacity(commands.len());

        for (index, item) in commands.iter().enumerate() {
            let registration = self
                .registry
                .get_registration(&item.command_type)
                .ok_or_else(|| BatchValidationError::UnregisteredCommand {
                    index,
                    command_type: item.command_type.clone(),
                })?;

            if let Some(expected) = &options.bounded_context {
                if &registration.bounded_context != expected {
                    return Err(BatchValidationError::BoundedContextMismatch {
                        index,
                        command_type: item.command_type.clone(),
                        expected: expected.clone(),
                        actual: registration.bounded_context,
                    });
                }
            }

            if options.mode == BatchMode::Atomic {
                let aggregate = match (&registration.target_aggregate, registration.category) {
                    (Some(aggregate), CommandCategory::Aggregate) => aggregate,
                    _ => {
                        return Err(BatchValidationError::NotAggregateCommand {
                            index,
                            command_type: item.command_type.clone(),
                            category: registration.category,
                        });
                    }
                };
                let id = aggregate.resolve_id(&item.args).ok_or_else(|| {
                    BatchValidationError::MissingAggregateId {
                        index,
                        command_type: item.command_type.clone(),
                        field: aggregate.id_field.clone(),
                    }
                })?;
                let found = (aggregate.aggregate_type.as_str().to_string(), id);

                let expected = target.get_or_insert_with(|| match &options.aggregate_id {
                    Some(pinned) => (found.0.clone(), pinned.clone()),
                    None => found.clone(),
                });
                if *expected != found {
                    return Err(BatchValidationError::CrossAggregate {
                        index,
                        expected: format!("{}/{}", expected.0, expected.1),
                        found: format!("{}/{}", found.0, found.1),
                    });
                }
            }

            let command_id = item.command_id.clone().unwrap_or_else(generate_id);
            let mut chain = CorrelationChain::root(command_id.as_str(), self.clock.now())
                .with_correlation_id(item.correlation_id.as_deref().unwrap_or(correlation_id));
            if let Some(user_id) = &options.user_id {
                chain = chain.with_user_id(user_id.as_str());
            }

            prepared.push(
                Command::new(
                    command_id,
                    registration.command_type,
                    registration.bounded_context,
                    registration.category,
                    item.args.clone(),
                    self.clock.as_ref(),
                )
                .with_chain(chain),
            );
        }

        Ok(prepared)
    }

    async fn run_one(&self, index: usize, command: Command) -> BatchItemResult {
        let start = Instant::now();
        let command_id = command.id.clone();
        let command_type = command.command_type.clone();

        let result = self.executor.execute(command).await;
        let status = BatchItemStatus::of(&result);
        tracing::debug!(index, command_id = %command_id, status = status.as_str(), "Batch item finished");

        BatchItemResult {
            index,
            command_id,
            command_type,
            status,
            error: result.reason().map(str::to_string),
            result: Some(result),
            duration: start.elapsed(),
        }
    }

    async fn run_atomic(&self, commands: Vec<Command>) -> Vec<BatchItemResult> {
        let mut items = Vec::with_capacity(commands.len());
        let mut halted: Option<usize> = None;

        for (index, command) in commands.into_iter().enumerate() {
            if let Some(failed_at) = halted {
                items.push(BatchItemResult::skipped(
                    index,
                    command.id,
                    command.command_type,
                    &format!("Skipped after item {failed_at} failed"),
                ));
                continue;
            }

            let item = self.run_one(index, command).await;
            if item.status != BatchItemStatus::Success {
                tracing::warn!(index, status = item.status.as_str(), "Atomic batch halted");
                halted = Some(index);
            }
            items.push(item);
        }

        items
    }

    /// Every item waits on a fair semaphore, so at most `max_concurrency`
    /// commands are in flight and items start in submission order.
    async fn run_partial(
        &self,
        commands: Vec<Command>,
        max_concurrency: usize,
        continue_on_error: bool,
    ) -> Vec<BatchItemResult> {
        let permits = Semaphore::new(max_concurrency);
        let stopped = AtomicBool::new(false);

        let runs = commands.into_iter().enumerate().map(|(index, command)| {
            let permits = &permits;
            let stopped = &stopped;
            async move {
                let _permit = match permits.acquire().await {
                    Ok(permit) => permit,
                    Err(error) => {
                        return BatchItemResult::skipped(
                            index,
                            command.id,
                            command.command_type,
                            &error.to_string(),
                        );
                    }
                };
                if stopped.load(Ordering::SeqCst) {
                    return BatchItemResult::skipped(
                        index,
                        command.id,
                        command.command_type,
                        "Skipped after an earlier item failed",
                    );
                }

                let item = self.run_one(index, command).await;
                if !continue_on_error && item.status != BatchItemStatus::Success {
                    stopped.store(true, Ordering::SeqCst);
                }
                item
            }
        });

        join_all(runs).await
    }
}
