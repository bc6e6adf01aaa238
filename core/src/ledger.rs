//! Idempotency ledger contract.
//!
//! The ledger is the only state shared by concurrent duplicate submissions of
//! the same command id. Implementations must make [`IdempotencyLedger::record_command`]
//! a unique-insert (or compare-and-set): of any number of concurrent calls with
//! the same id, exactly one observes [`RecordOutcome::New`]. That single caller
//! is the only one allowed to run the handler.
//!
//! Entries move from [`LedgerStatus::Pending`] to a terminal status exactly once
//! and are immutable afterwards. A `Pending` entry whose execution was abandoned
//! before anything was appended is removed with
//! [`IdempotencyLedger::release_pending`] so the id can be submitted again.

use crate::BoxFuture;
use crate::command::Command;
use crate::result::CommandResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No entry exists for the command id.
    #[error("Ledger entry not found: {0}")]
    NotFound(String),

    /// The entry already holds a terminal status and cannot change.
    #[error("Ledger entry {command_id} is already terminal ({status})")]
    AlreadyTerminal {
        /// The command id.
        command_id: String,
        /// The status the entry already holds.
        status: LedgerStatus,
    },

    /// `Pending` is not a valid target for an update.
    #[error("Cannot update ledger entry {0} to a non-terminal status")]
    NonTerminalUpdate(String),

    /// Storage backend failure.
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Lifecycle status of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Recorded, handler not yet finished.
    Pending,
    /// Completed: success or a recorded business failure.
    Executed,
    /// Refused; nothing appended.
    Rejected,
    /// Completed with an infrastructure failure after the write path.
    Failed,
}

impl LedgerStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Idempotency key.
    pub command_id: String,
    /// Command type.
    pub command_type: String,
    /// Owning bounded context.
    pub bounded_context: String,
    /// Command arguments as submitted.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: LedgerStatus,
    /// Terminal result, once known.
    pub result: Option<CommandResult>,
}

impl LedgerEntry {
    /// A fresh `Pending` entry for a command.
    #[must_use]
    pub fn pending(command: &Command) -> Self {
        Self {
            command_id: command.id.clone(),
            command_type: command.command_type.clone(),
            bounded_context: command.bounded_context.clone(),
            payload: command.args.clone(),
            status: LedgerStatus::Pending,
            result: None,
        }
    }
}

/// Outcome of attempting to record a command.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordOutcome {
    /// First submission; the caller owns execution.
    New,
    /// The id was seen before.
    Duplicate {
        /// Status of the existing entry.
        status: LedgerStatus,
        /// Cached terminal result, absent while the entry is still `Pending`.
        result: Option<CommandResult>,
    },
}

/// Idempotency ledger abstraction.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so the coordinator can hold it as `Arc<dyn IdempotencyLedger>`.
pub trait IdempotencyLedger: Send + Sync {
    /// Record a command, or report that it was recorded before.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the backend cannot be reached.
    fn record_command(
        &self,
        entry: LedgerEntry,
    ) -> BoxFuture<'_, Result<RecordOutcome, LedgerError>>;

    /// Move a pending entry to its terminal status.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] if no entry exists
    /// - [`LedgerError::AlreadyTerminal`] if the entry is already terminal
    /// - [`LedgerError::NonTerminalUpdate`] if `status` is `Pending`
    fn update_result(
        &self,
        command_id: &str,
        status: LedgerStatus,
        result: CommandResult,
    ) -> BoxFuture<'_, Result<(), LedgerError>>;

    /// Remove an entry that is still `Pending`.
    ///
    /// Returns `true` if an entry was removed. Terminal entries are never
    /// touched and yield `false`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the backend cannot be reached.
    fn release_pending(&self, command_id: &str) -> BoxFuture<'_, Result<bool, LedgerError>>;

    /// Fetch an entry for introspection.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the backend cannot be reached.
    fn get(&self, command_id: &str) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>>;
}
