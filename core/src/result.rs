//! Handler outcomes and the terminal results callers observe.
//!
//! A domain handler produces exactly one [`HandlerResult`]. The coordinator
//! consumes it, performs the append and downstream dispatch, and answers the
//! caller with a [`CommandResult`]. Both are closed enums so every consumer has
//! to handle all three outcomes.

use crate::event::EventData;
use crate::stream::{GlobalPosition, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known rejection codes produced by the orchestration layer itself.
///
/// Domain handlers are free to use their own codes.
pub mod codes {
    /// The handler returned an error instead of a result.
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    /// A middleware before-hook failed.
    pub const MIDDLEWARE_ERROR: &str = "MIDDLEWARE_ERROR";
    /// The append lost the optimistic concurrency race.
    pub const CONCURRENCY_CONFLICT: &str = "CONCURRENCY_CONFLICT";
    /// No configuration is registered for the command type.
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    /// Another submission with the same id is still executing.
    pub const COMMAND_IN_PROGRESS: &str = "COMMAND_IN_PROGRESS";
    /// The idempotency ledger could not be consulted.
    pub const LEDGER_UNAVAILABLE: &str = "LEDGER_UNAVAILABLE";
    /// The durable log refused the append for a reason other than a conflict.
    pub const APPEND_FAILED: &str = "APPEND_FAILED";
    /// Input validation failed before the handler ran.
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
}

/// The outcome of a domain handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerResult {
    /// The command was accepted and produced an event.
    Success {
        /// Data returned to the caller.
        data: serde_json::Value,
        /// Stream version *after* the event is applied.
        version: Version,
        /// The event to append.
        event: EventData,
    },
    /// The command was refused; nothing is written to the log.
    Rejected {
        /// Machine-readable code.
        code: String,
        /// Human-readable reason.
        reason: String,
        /// Optional structured detail.
        context: Option<serde_json::Value>,
    },
    /// The command completed as a business failure that is itself recorded.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// The failure event to append.
        event: EventData,
        /// Expected stream version for the append (defaults to 0).
        expected_version: Option<Version>,
        /// Optional structured detail.
        context: Option<serde_json::Value>,
    },
}

impl HandlerResult {
    /// Construct a `Success`.
    #[must_use]
    pub fn success(data: serde_json::Value, version: Version, event: EventData) -> Self {
        Self::Success {
            data,
            version,
            event,
        }
    }

    /// Construct a `Rejected` without context.
    #[must_use]
    pub fn rejected(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            reason: reason.into(),
            context: None,
        }
    }

    /// Construct a `Failed` appended at the default expected version.
    #[must_use]
    pub fn failed(reason: impl Into<String>, event: EventData) -> Self {
        Self::Failed {
            reason: reason.into(),
            event,
            expected_version: None,
            context: None,
        }
    }

    /// Short outcome name for logs and metrics.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    /// The event this outcome would append, if any.
    #[must_use]
    pub const fn event(&self) -> Option<&EventData> {
        match self {
            Self::Success { event, .. } | Self::Failed { event, .. } => Some(event),
            Self::Rejected { .. } => None,
        }
    }
}

/// The terminal result of executing a command.
///
/// This is what the idempotency ledger caches and what every duplicate
/// submission receives verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResult {
    /// The event was appended.
    Success {
        /// Data returned by the handler.
        data: serde_json::Value,
        /// Stream version after the append.
        version: Version,
        /// Id of the appended event.
        event_id: String,
        /// Position of the appended event in the global log.
        global_position: GlobalPosition,
    },
    /// Nothing was written.
    Rejected {
        /// Machine-readable code.
        code: String,
        /// Human-readable reason.
        reason: String,
        /// Optional structured detail.
        context: Option<serde_json::Value>,
    },
    /// A business failure; its event was appended.
    Failed {
        /// Human-readable reason.
        reason: String,
        /// Id of the appended failure event.
        event_id: String,
        /// Position of the appended failure event.
        global_position: GlobalPosition,
        /// Optional structured detail.
        context: Option<serde_json::Value>,
    },
}

impl CommandResult {
    /// Construct a `Rejected` without context.
    #[must_use]
    pub fn rejected(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            reason: reason.into(),
            context: None,
        }
    }

    /// Whether this is a `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whether this is a `Rejected`.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Whether this is a `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The rejection code, if rejected.
    #[must_use]
    pub fn rejection_code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether this rejection was caused by an optimistic concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.rejection_code() == Some(codes::CONCURRENCY_CONFLICT)
    }

    /// Short outcome name for logs and metrics.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    /// Human-readable reason for a non-success result.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Rejected { reason, .. } | Self::Failed { reason, .. } => Some(reason),
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { version, .. } => write!(f, "success (version {version})"),
            Self::Rejected { code, reason, .. } => write!(f, "rejected [{code}]: {reason}"),
            Self::Failed { reason, .. } => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_result_serializes_with_status_tag() {
        let result = CommandResult::Success {
            data: json!({ "orderId": "o1" }),
            version: Version::new(1),
            event_id: "e1".to_string(),
            global_position: GlobalPosition::new(1),
        };
        let value = serde_json::to_value(&result).unwrap_or_default();
        assert_eq!(value["status"], "success");
        assert_eq!(value["version"], 1);

        let back: CommandResult = serde_json::from_value(value).unwrap_or_else(|_| {
            CommandResult::rejected("X", "decode failed")
        });
        assert_eq!(back, result);
    }

    #[test]
    fn conflict_detection() {
        assert!(CommandResult::rejected(codes::CONCURRENCY_CONFLICT, "lost race").is_conflict());
        assert!(!CommandResult::rejected(codes::HANDLER_ERROR, "boom").is_conflict());
    }

    #[test]
    fn handler_result_event_accessor() {
        let event = EventData::new("OrderFailed", "Order", "o1", "orders", json!({}));
        assert!(HandlerResult::failed("no stock", event.clone()).event().is_some());
        assert!(HandlerResult::rejected("X", "y").event().is_none());
        assert_eq!(
            HandlerResult::success(json!({}), Version::new(1), event).outcome(),
            "success"
        );
    }

    #[test]
    fn display() {
        assert_eq!(
            CommandResult::rejected("INVALID", "bad").to_string(),
            "rejected [INVALID]: bad"
        );
    }
}
