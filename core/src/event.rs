//! Events: immutable, versioned facts appended to the durable log.
//!
//! Handlers emit [`EventData`], which knows *what* happened and *where* (stream,
//! bounded context) but nothing about tracing. The coordinator stamps it with
//! [`EventMetadata`] derived from the command's correlation chain, producing the
//! [`Event`] that is appended and later broadcast.

use crate::command::{CorrelationChain, generate_id};
use crate::stream::{StreamId, StreamType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an event, used by subscription filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Internal to the owning bounded context.
    Domain,
    /// Published for other bounded contexts.
    Integration,
    /// Carries only ids; consumers fetch current state.
    Trigger,
    /// Carries a full state snapshot.
    Fat,
}

impl EventCategory {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Integration => "integration",
            Self::Trigger => "trigger",
            Self::Fat => "fat",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracing metadata stamped on every appended event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Correlation id of the chain that produced the event.
    pub correlation_id: String,
    /// The command that produced the event.
    pub causation_id: String,
    /// Acting user, if known.
    pub user_id: Option<String>,
    /// When the event was stamped.
    pub timestamp: DateTime<Utc>,
}

/// An event as emitted by a domain handler, before it is stamped and appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Event id; generated when the handler does not supply one.
    pub event_id: Option<String>,
    /// Event type, e.g. `"OrderCreated"`.
    pub event_type: String,
    /// Stream type, e.g. `"Order"`.
    pub stream_type: StreamType,
    /// Stream id, e.g. `"o1"`.
    pub stream_id: StreamId,
    /// Schema version of the payload.
    pub schema_version: u32,
    /// Event classification.
    pub category: EventCategory,
    /// Owning bounded context.
    pub bounded_context: String,
    /// Event body.
    pub payload: serde_json::Value,
}

impl EventData {
    /// Create a schema-version-1 domain event.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        stream_type: impl Into<StreamType>,
        stream_id: impl Into<StreamId>,
        bounded_context: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            stream_type: stream_type.into(),
            stream_id: stream_id.into(),
            schema_version: 1,
            category: EventCategory::Domain,
            bounded_context: bounded_context.into(),
            payload,
        }
    }

    /// Use a caller-chosen event id.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Set the event category.
    #[must_use]
    pub const fn with_category(mut self, category: EventCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the payload schema version.
    #[must_use]
    pub const fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Stamp the event with metadata derived from the producing command's chain.
    #[must_use]
    pub fn stamp(self, chain: &CorrelationChain, timestamp: DateTime<Utc>) -> Event {
        Event {
            event_id: self.event_id.unwrap_or_else(generate_id),
            event_type: self.event_type,
            stream_type: self.stream_type,
            stream_id: self.stream_id,
            schema_version: self.schema_version,
            category: self.category,
            bounded_context: self.bounded_context,
            payload: self.payload,
            metadata: EventMetadata {
                correlation_id: chain.correlation_id.clone(),
                causation_id: chain.command_id.clone(),
                user_id: chain.user_id.clone(),
                timestamp,
            },
        }
    }
}

/// An appended (or about-to-be-appended) event. Never mutated after append.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id.
    pub event_id: String,
    /// Event type, e.g. `"OrderCreated"`.
    pub event_type: String,
    /// Stream type, e.g. `"Order"`.
    pub stream_type: StreamType,
    /// Stream id, e.g. `"o1"`.
    pub stream_id: StreamId,
    /// Schema version of the payload.
    pub schema_version: u32,
    /// Event classification.
    pub category: EventCategory,
    /// Owning bounded context.
    pub bounded_context: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// Tracing metadata.
    pub metadata: EventMetadata,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ type: {}, stream: {}/{}, id: {} }}",
            self.event_type, self.stream_type, self.stream_id, self.event_id
        )
    }
}
