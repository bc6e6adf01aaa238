//! Durable, append-only log contract with optimistic concurrency control.
//!
//! # Design
//!
//! The `EventStore` trait is deliberately minimal. The orchestration layer only
//! needs to:
//!
//! - Append events to a stream, asserting the version the stream is expected to be at
//! - Read a stream back (introspection, tests, state loading by handlers)
//!
//! The expected-version check is the *only* concurrency-control point in the
//! whole system. It reports a conflict instead of blocking; retrying is the
//! caller's job.

use crate::BoxFuture;
use crate::event::Event;
use crate::stream::{GlobalPosition, StreamId, StreamType, Version};
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: expected version doesn't match current version.
    ///
    /// This typically means another command appended to the stream concurrently.
    #[error("Concurrency conflict on {stream_type}/{stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Stream type where the conflict occurred.
        stream_type: StreamType,
        /// Stream id where the conflict occurred.
        stream_id: StreamId,
        /// The version we expected the stream to be at.
        expected: Version,
        /// The actual current version of the stream.
        actual: Version,
    },

    /// The append carried no events.
    #[error("Nothing to append")]
    EmptyAppend,

    /// Database connection error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Whether the error is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Result of a successful append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResult {
    /// Global position of each appended event, in append order.
    pub global_positions: Vec<GlobalPosition>,
    /// Stream version after the append.
    pub new_version: Version,
}

impl AppendResult {
    /// Position of the first appended event.
    #[must_use]
    pub fn first_position(&self) -> Option<GlobalPosition> {
        self.global_positions.first().copied()
    }
}

/// An event as read back from the log.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// The event.
    pub event: Event,
    /// Its version within the stream (1-based).
    pub version: Version,
    /// Its position in the global log.
    pub global_position: GlobalPosition,
}

/// Event store abstraction.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so a single instance can serve
/// concurrent command executions.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventStore>`).
pub trait EventStore: Send + Sync {
    /// Append events to a stream with optimistic concurrency control.
    ///
    /// The append succeeds only if the stream is currently at `expected_version`.
    /// Appending `n` events to a stream at version `v` leaves it at `v + n`.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: the stream is not at `expected_version`
    /// - `EmptyAppend`: `events` is empty
    /// - `DatabaseError`: the backend failed
    fn append_to_stream(
        &self,
        stream_type: &StreamType,
        stream_id: &StreamId,
        expected_version: Version,
        events: Vec<Event>,
    ) -> BoxFuture<'_, Result<AppendResult, EventStoreError>>;

    /// Load all events of a stream, oldest first.
    ///
    /// A stream that doesn't exist yields an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the backend failed.
    fn load_stream(
        &self,
        stream_type: &StreamType,
        stream_id: &StreamId,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_error_display() {
        let error = EventStoreError::ConcurrencyConflict {
            stream_type: StreamType::new("Order"),
            stream_id: StreamId::new("o1"),
            expected: Version::new(0),
            actual: Version::new(1),
        };

        let display = format!("{error}");
        assert!(display.contains("Order/o1"));
        assert!(display.contains("expected version 0"));
        assert!(display.contains("found 1"));
        assert!(error.is_conflict());
    }

    #[test]
    fn database_error_is_not_conflict() {
        assert!(!EventStoreError::DatabaseError("down".to_string()).is_conflict());
    }

    #[test]
    fn first_position() {
        let result = AppendResult {
            global_positions: vec![GlobalPosition::new(7), GlobalPosition::new(8)],
            new_version: Version::new(2),
        };
        assert_eq!(result.first_position(), Some(GlobalPosition::new(7)));
    }
}
