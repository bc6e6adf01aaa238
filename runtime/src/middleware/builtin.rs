//! Built-in middlewares.

use super::{BeforeOutcome, Middleware, MiddlewareContext, order};
use commandeer_core::command::Command;
use commandeer_core::{BoxFuture, HandlerResult, codes};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Logs every command on entry and exit, with its duration.
///
/// Runs first and finishes last, so the duration covers the whole chain.
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    started: Mutex<HashMap<String, Instant>>,
}

impl LoggingMiddleware {
    /// Create a logging middleware.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn order(&self) -> i32 {
        order::LOGGING
    }

    fn before<'a>(
        &'a self,
        command: &'a Command,
        context: MiddlewareContext,
    ) -> BoxFuture<'a, anyhow::Result<BeforeOutcome>> {
        Box::pin(async move {
            tracing::info!(
                command_id = %command.id,
                command_type = %command.command_type,
                bounded_context = %command.bounded_context,
                correlation_id = %command.chain.correlation_id,
                user_id = context.user_id(),
                "Command received"
            );
            self.started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(command.id.clone(), Instant::now());
            Ok(BeforeOutcome::Continue(context))
        })
    }

    fn after<'a>(
        &'a self,
        command: &'a Command,
        _context: &'a MiddlewareContext,
        result: HandlerResult,
    ) -> BoxFuture<'a, anyhow::Result<HandlerResult>> {
        Box::pin(async move {
            let started = self
                .started
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&command.id);
            let duration_ms = started
                .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default();

            match &result {
                HandlerResult::Rejected { code, reason, .. } => tracing::info!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    code = %code,
                    reason = %reason,
                    duration_ms,
                    "Command rejected"
                ),
                other => tracing::info!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    outcome = other.outcome(),
                    duration_ms,
                    "Command handled"
                ),
            }
            Ok(result)
        })
    }
}

/// Validates command arguments; `Err` carries the rejection reason.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Rejects commands whose arguments fail a per-type validator with
/// `VALIDATION_ERROR`. Command types without a validator pass through.
#[derive(Default)]
pub struct ValidationMiddleware {
    validators: HashMap<String, Validator>,
}

impl std::fmt::Debug for ValidationMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.validators.keys().collect();
        types.sort();
        f.debug_struct("ValidationMiddleware")
            .field("command_types", &types)
            .finish()
    }
}

impl ValidationMiddleware {
    /// Create a validation middleware with no validators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the validator for `command_type`, replacing any previous one.
    #[must_use]
    pub fn validator<F>(mut self, command_type: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators
            .insert(command_type.into(), Arc::new(validator));
        self
    }

    /// Reject when any of `fields` is missing or null.
    #[must_use]
    pub fn require_fields(self, command_type: impl Into<String>, fields: &[&str]) -> Self {
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
        self.validator(command_type, move |args| {
            let missing: Vec<&str> = fields
                .iter()
                .filter(|f| args.get(f.as_str()).is_none_or(Value::is_null))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!("Missing required fields: {}", missing.join(", ")))
            }
        })
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn order(&self) -> i32 {
        order::VALIDATION
    }

    fn before<'a>(
        &'a self,
        command: &'a Command,
        context: MiddlewareContext,
    ) -> BoxFuture<'a, anyhow::Result<BeforeOutcome>> {
        Box::pin(async move {
            let Some(validator) = self.validators.get(&command.command_type) else {
                return Ok(BeforeOutcome::Continue(context));
            };
            match validator(&command.args) {
                Ok(()) => Ok(BeforeOutcome::Continue(context)),
                Err(reason) => {
                    tracing::debug!(
                        command_id = %command.id,
                        command_type = %command.command_type,
                        reason = %reason,
                        "Command failed validation"
                    );
                    Ok(BeforeOutcome::ShortCircuit(HandlerResult::rejected(
                        codes::VALIDATION_ERROR,
                        reason,
                    )))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::middleware::MiddlewarePipeline;
    use commandeer_core::command::CommandCategory;
    use commandeer_core::environment::SystemClock;
    use commandeer_core::{EventData, Version};
    use serde_json::json;

    fn command(args: Value) -> Command {
        Command::new(
            "cmd-1",
            "CreateOrder",
            "orders",
            CommandCategory::Aggregate,
            args,
            &SystemClock,
        )
    }

    fn pipeline() -> MiddlewarePipeline {
        let pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(LoggingMiddleware::new())).unwrap();
        pipeline
            .add(Arc::new(
                ValidationMiddleware::new().require_fields("CreateOrder", &["orderId"]),
            ))
            .unwrap();
        pipeline
    }

    #[tokio::test]
    async fn missing_field_is_rejected_before_handler() {
        let cmd = command(json!({}));
        let outcome = pipeline()
            .execute(&cmd, MiddlewareContext::for_command(&cmd, None), |_| async {
                Ok(HandlerResult::rejected("UNREACHABLE", "handler ran"))
            })
            .await;

        assert!(!outcome.handler_invoked);
        assert_eq!(outcome.short_circuited_by.as_deref(), Some("validation"));
        assert_eq!(
            outcome.result,
            HandlerResult::rejected(codes::VALIDATION_ERROR, "Missing required fields: orderId")
        );
    }

    #[tokio::test]
    async fn valid_command_reaches_handler() {
        let cmd = command(json!({"orderId": "o1"}));
        let expected = HandlerResult::success(
            json!({}),
            Version::new(1),
            EventData::new("OrderCreated", "Order", "o1", "orders", json!({})),
        );
        let returned = expected.clone();

        let outcome = pipeline()
            .execute(&cmd, MiddlewareContext::for_command(&cmd, None), |_| async move {
                Ok(returned)
            })
            .await;

        assert!(outcome.handler_invoked);
        assert_eq!(outcome.result, expected);
    }

    #[test]
    fn builtin_orders() {
        assert_eq!(pipeline().names(), vec!["logging", "validation"]);
    }
}
