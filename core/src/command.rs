//! Commands and the correlation chain that traces everything they cause.
//!
//! A [`Command`] is an immutable request to change state. Its `id` is the
//! idempotency key: submitting the same id twice never runs its handler twice.
//!
//! Every command carries a [`CorrelationChain`]. The correlation id stays the
//! same across a whole causal chain (user request → command → event → saga
//! command → ...), while the causation id always points at the immediate cause.

use crate::environment::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Broad classification of a command, used by the batch executor and middleware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    /// Targets a single aggregate instance.
    Aggregate,
    /// Drives a long-running process or saga.
    Process,
    /// Infrastructure / housekeeping command.
    System,
    /// A command that itself fans out to many others.
    Batch,
}

impl CommandCategory {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Process => "process",
            Self::System => "system",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracing metadata linking a command to everything it transitively causes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationChain {
    /// The command this chain was derived for.
    pub command_id: String,
    /// Stable across the whole causal chain.
    pub correlation_id: String,
    /// The immediate cause (a command id or an event id).
    pub causation_id: String,
    /// The user on whose behalf the chain runs, if known.
    pub user_id: Option<String>,
    /// When this link of the chain was created.
    pub initiated_at: DateTime<Utc>,
}

impl CorrelationChain {
    /// Start a new chain for a user-initiated command.
    ///
    /// The command is its own cause and its own correlation root.
    #[must_use]
    pub fn root(command_id: impl Into<String>, initiated_at: DateTime<Utc>) -> Self {
        let command_id = command_id.into();
        Self {
            correlation_id: command_id.clone(),
            causation_id: command_id.clone(),
            command_id,
            user_id: None,
            initiated_at,
        }
    }

    /// Derive the chain for a command caused by another command.
    #[must_use]
    pub fn caused_by_command(
        &self,
        command_id: impl Into<String>,
        initiated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.command_id.clone(),
            user_id: self.user_id.clone(),
            initiated_at,
        }
    }

    /// Derive the chain for a command triggered by an event.
    #[must_use]
    pub fn caused_by_event(
        &self,
        event_id: impl Into<String>,
        command_id: impl Into<String>,
        initiated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            correlation_id: self.correlation_id.clone(),
            causation_id: event_id.into(),
            user_id: self.user_id.clone(),
            initiated_at,
        }
    }

    /// Override the correlation id (e.g. a batch-wide correlation).
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Attach the acting user.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Generate a fresh, random command or event id.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// An immutable request to change state.
///
/// # Examples
///
/// ```
/// use commandeer_core::command::{Command, CommandCategory};
/// use commandeer_core::environment::SystemClock;
/// use serde_json::json;
///
/// let command = Command::new(
///     "cmd-1",
///     "CreateOrder",
///     "orders",
///     CommandCategory::Aggregate,
///     json!({ "orderId": "o1" }),
///     &SystemClock,
/// );
///
/// assert_eq!(command.chain.correlation_id, "cmd-1");
/// assert_eq!(command.chain.causation_id, "cmd-1");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Idempotency key.
    pub id: String,
    /// Registered command type, e.g. `"CreateOrder"`.
    pub command_type: String,
    /// Owning bounded context.
    pub bounded_context: String,
    /// Broad classification.
    pub category: CommandCategory,
    /// Handler input.
    pub args: serde_json::Value,
    /// Correlation metadata.
    pub chain: CorrelationChain,
}

impl Command {
    /// Create a command with a fresh root correlation chain.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        command_type: impl Into<String>,
        bounded_context: impl Into<String>,
        category: CommandCategory,
        args: serde_json::Value,
        clock: &dyn Clock,
    ) -> Self {
        let id = id.into();
        let chain = CorrelationChain::root(id.clone(), clock.now());
        Self {
            id,
            command_type: command_type.into(),
            bounded_context: bounded_context.into(),
            category,
            args,
            chain,
        }
    }

    /// Replace the correlation chain, keeping `chain.command_id` in sync with `id`.
    #[must_use]
    pub fn with_chain(mut self, mut chain: CorrelationChain) -> Self {
        chain.command_id.clone_from(&self.id);
        self.chain = chain;
        self
    }

    /// Attach the acting user to the correlation chain.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.chain.user_id = Some(user_id.into());
        self
    }

    /// Look up a top-level string argument.
    #[must_use]
    pub fn arg_str(&self, field: &str) -> Option<&str> {
        self.args.get(field).and_then(serde_json::Value::as_str)
    }
}
