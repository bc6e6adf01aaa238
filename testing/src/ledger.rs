#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use commandeer_core::ledger::{
    IdempotencyLedger, LedgerEntry, LedgerError, LedgerStatus, RecordOutcome,
};
use commandeer_core::{BoxFuture, CommandResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory idempotency ledger.
///
/// `record_command` is a unique insert under one lock: of several concurrent
/// submissions of the same id, exactly one observes [`RecordOutcome::New`].
///
/// Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`LedgerError::Storage`] while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of one entry.
    #[must_use]
    pub fn entry(&self, command_id: &str) -> Option<LedgerEntry> {
        self.entries.lock().unwrap().get(command_id).cloned()
    }

    /// Status of one entry.
    #[must_use]
    pub fn status(&self, command_id: &str) -> Option<LedgerStatus> {
        self.entry(command_id).map(|e| e.status)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Storage("ledger unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl IdempotencyLedger for InMemoryLedger {
    fn record_command(
        &self,
        entry: LedgerEntry,
    ) -> BoxFuture<'_, Result<RecordOutcome, LedgerError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().unwrap();
            if let Some(existing) = entries.get(&entry.command_id) {
                return Ok(RecordOutcome::Duplicate {
                    status: existing.status,
                    result: existing.result.clone(),
                });
            }
            entries.insert(entry.command_id.clone(), entry);
            Ok(RecordOutcome::New)
        })
    }

    fn update_result(
        &self,
        command_id: &str,
        status: LedgerStatus,
        result: CommandResult,
    ) -> BoxFuture<'_, Result<(), LedgerError>> {
        let command_id = command_id.to_string();
        Box::pin(async move {
            self.check_available()?;
            if !status.is_terminal() {
                return Err(LedgerError::NonTerminalUpdate(command_id));
            }
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&command_id)
                .ok_or_else(|| LedgerError::NotFound(command_id.clone()))?;
            if entry.status.is_terminal() {
                return Err(LedgerError::AlreadyTerminal {
                    command_id,
                    status: entry.status,
                });
            }
            entry.status = status;
            entry.result = Some(result);
            Ok(())
        })
    }

    fn release_pending(&self, command_id: &str) -> BoxFuture<'_, Result<bool, LedgerError>> {
        let command_id = command_id.to_string();
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&command_id) {
                Some(entry) if entry.status == LedgerStatus::Pending => {
                    entries.remove(&command_id);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn get(&self, command_id: &str) -> BoxFuture<'_, Result<Option<LedgerEntry>, LedgerError>> {
        let command_id = command_id.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.entry(&command_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use serde_json::json;

    #[tokio::test]
    async fn unique_insert_then_terminal_update() {
        let ledger = InMemoryLedger::new();
        let command = fixtures::command("cmd-1", "CreateOrder", json!({"orderId": "o1"}));

        let first = ledger.record_command(LedgerEntry::pending(&command)).await;
        assert_eq!(first, Ok(RecordOutcome::New));

        let pending = ledger.record_command(LedgerEntry::pending(&command)).await;
        assert_eq!(
            pending,
            Ok(RecordOutcome::Duplicate {
                status: LedgerStatus::Pending,
                result: None
            })
        );

        let result = CommandResult::rejected("NOPE", "no");
        ledger
            .update_result("cmd-1", LedgerStatus::Rejected, result.clone())
            .await
            .unwrap();

        let again = ledger
            .update_result("cmd-1", LedgerStatus::Executed, result.clone())
            .await;
        assert!(matches!(again, Err(LedgerError::AlreadyTerminal { .. })));

        let duplicate = ledger.record_command(LedgerEntry::pending(&command)).await;
        assert_eq!(
            duplicate,
            Ok(RecordOutcome::Duplicate {
                status: LedgerStatus::Rejected,
                result: Some(result)
            })
        );
    }

    #[tokio::test]
    async fn rejects_pending_update_and_unknown_ids() {
        let ledger = InMemoryLedger::new();
        let result = CommandResult::rejected("X", "x");

        assert!(matches!(
            ledger.update_result("missing", LedgerStatus::Executed, result.clone()).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.update_result("missing", LedgerStatus::Pending, result).await,
            Err(LedgerError::NonTerminalUpdate(_))
        ));
    }

    #[tokio::test]
    async fn release_only_removes_pending_entries() {
        let ledger = InMemoryLedger::new();
        let pending = fixtures::command("cmd-1", "CreateOrder", json!({}));
        let done = fixtures::command("cmd-2", "CreateOrder", json!({}));
        ledger.record_command(LedgerEntry::pending(&pending)).await.unwrap();
        ledger.record_command(LedgerEntry::pending(&done)).await.unwrap();
        ledger
            .update_result("cmd-2", LedgerStatus::Rejected, CommandResult::rejected("X", "x"))
            .await
            .unwrap();

        assert_eq!(ledger.release_pending("cmd-1").await, Ok(true));
        assert_eq!(ledger.release_pending("cmd-2").await, Ok(false));
        assert_eq!(ledger.release_pending("missing").await, Ok(false));
        assert_eq!(ledger.status("cmd-1"), None);
        assert_eq!(ledger.status("cmd-2"), Some(LedgerStatus::Rejected));

        let again = ledger.record_command(LedgerEntry::pending(&pending)).await;
        assert_eq!(again, Ok(RecordOutcome::New));
    }

    #[tokio::test]
    async fn unavailable_ledger_reports_storage_error() {
        let ledger = InMemoryLedger::new();
        ledger.set_unavailable(true);
        let command = fixtures::command("cmd-1", "CreateOrder", json!({}));

        assert!(matches!(
            ledger.record_command(LedgerEntry::pending(&command)).await,
            Err(LedgerError::Storage(_))
        ));
    }
}
