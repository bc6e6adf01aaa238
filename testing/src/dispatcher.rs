#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use commandeer_core::BoxFuture;
use commandeer_core::dispatcher::{AsyncDispatcher, DispatchError, DispatchTask, TaskHandle};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Dispatcher that records every accepted task instead of running it.
///
/// Failures can be programmed per handler ([`fail_handler`](Self::fail_handler))
/// or globally ([`set_unavailable`](Self::set_unavailable)). Refused tasks are
/// not recorded.
///
/// Clones share the same recording.
#[derive(Clone, Debug, Default)]
pub struct RecordingDispatcher {
    tasks: Arc<Mutex<Vec<DispatchTask>>>,
    failing_handlers: Arc<Mutex<HashSet<String>>>,
    unavailable: Arc<AtomicBool>,
}

impl RecordingDispatcher {
    /// Create a dispatcher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every task addressed to `handler`.
    pub fn fail_handler(&self, handler: impl Into<String>) {
        self.failing_handlers.lock().unwrap().insert(handler.into());
    }

    /// Refuse every task while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Accepted tasks, in enqueue order.
    #[must_use]
    pub fn tasks(&self) -> Vec<DispatchTask> {
        self.tasks.lock().unwrap().clone()
    }

    /// Handler names of accepted tasks, in enqueue order.
    #[must_use]
    pub fn handlers(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.handler.as_str().to_string())
            .collect()
    }

    /// Accepted tasks addressed to `handler`.
    #[must_use]
    pub fn tasks_for(&self, handler: &str) -> Vec<DispatchTask> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.handler.as_str() == handler)
            .cloned()
            .collect()
    }

    /// Number of accepted tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Whether no task was accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Forget every accepted task.
    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }
}

impl AsyncDispatcher for RecordingDispatcher {
    fn enqueue(&self, task: DispatchTask) -> BoxFuture<'_, Result<TaskHandle, DispatchError>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(DispatchError::Unavailable("dispatcher offline".to_string()));
            }
            if self
                .failing_handlers
                .lock()
                .unwrap()
                .contains(task.handler.as_str())
            {
                return Err(DispatchError::Rejected {
                    handler: task.handler.clone(),
                    reason: "programmed failure".to_string(),
                });
            }

            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(task);
            Ok(TaskHandle(format!("task-{}", tasks.len())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commandeer_core::dispatcher::HandlerRef;
    use serde_json::json;

    #[tokio::test]
    async fn records_accepted_tasks_in_order() {
        let dispatcher = RecordingDispatcher::new();
        let first = dispatcher
            .enqueue(DispatchTask::new(HandlerRef::new("a"), json!(1)))
            .await
            .unwrap();
        dispatcher
            .enqueue(DispatchTask::new(HandlerRef::new("b"), json!(2)))
            .await
            .unwrap();

        assert_eq!(first, TaskHandle("task-1".to_string()));
        assert_eq!(dispatcher.handlers(), vec!["a", "b"]);
        assert_eq!(dispatcher.tasks_for("b")[0].args, json!(2));
    }

    #[tokio::test]
    async fn programmed_failures_are_not_recorded() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.fail_handler("bad");

        let refused = dispatcher
            .enqueue(DispatchTask::new(HandlerRef::new("bad"), json!({})))
            .await;
        assert!(matches!(refused, Err(DispatchError::Rejected { .. })));

        dispatcher.set_unavailable(true);
        let offline = dispatcher
            .enqueue(DispatchTask::new(HandlerRef::new("good"), json!({})))
            .await;
        assert!(matches!(offline, Err(DispatchError::Unavailable(_))));
        assert!(dispatcher.is_empty());
    }
}
