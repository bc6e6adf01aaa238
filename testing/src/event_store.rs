#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use commandeer_core::event_store::{AppendResult, EventStore, EventStoreError, RecordedEvent};
use commandeer_core::{BoxFuture, Event, GlobalPosition, StreamId, StreamType, Version};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Log {
    events: Vec<RecordedEvent>,
    versions: HashMap<(StreamType, StreamId), Version>,
    fail_next: Option<EventStoreError>,
}

/// In-memory durable log for fast, deterministic tests.
///
/// The expected-version check and the write happen under one lock, so
/// concurrent appends against the same stream behave like a real log: exactly
/// one wins and the rest see `ConcurrencyConflict`.
///
/// Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    log: Arc<Mutex<Log>>,
    append_delay: Option<Duration>,
}

impl InMemoryEventStore {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every append, before the version check.
    ///
    /// Widens the race window for concurrency tests.
    #[must_use]
    pub const fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = Some(delay);
        self
    }

    /// Make the next append fail with `error`.
    pub fn fail_next_append(&self, error: EventStoreError) {
        self.log.lock().unwrap().fail_next = Some(error);
    }

    /// Every recorded event, in global order.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.log.lock().unwrap().events.clone()
    }

    /// Total number of recorded events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.log.lock().unwrap().events.len()
    }

    /// Events of one stream, oldest first.
    #[must_use]
    pub fn stream_events(&self, stream_type: &str, stream_id: &str) -> Vec<Event> {
        self.log
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|r| {
                r.event.stream_type.as_str() == stream_type
                    && r.event.stream_id.as_str() == stream_id
            })
            .map(|r| r.event.clone())
            .collect()
    }

    /// Number of events in one stream.
    #[must_use]
    pub fn stream_len(&self, stream_type: &str, stream_id: &str) -> usize {
        self.stream_events(stream_type, stream_id).len()
    }

    /// Current version of one stream.
    #[must_use]
    pub fn stream_version(&self, stream_type: &str, stream_id: &str) -> Version {
        self.log
            .lock()
            .unwrap()
            .versions
            .get(&(StreamType::new(stream_type), StreamId::new(stream_id)))
            .copied()
            .unwrap_or_default()
    }

    /// Events whose metadata names `command_id` as the cause.
    #[must_use]
    pub fn events_caused_by(&self, command_id: &str) -> Vec<Event> {
        self.log
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|r| r.event.metadata.causation_id == command_id)
            .map(|r| r.event.clone())
            .collect()
    }

    fn append(
        &self,
        key: (StreamType, StreamId),
        expected_version: Version,
        events: Vec<Event>,
    ) -> Result<AppendResult, EventStoreError> {
        let mut log = self.log.lock().unwrap();

        if let Some(error) = log.fail_next.take() {
            return Err(error);
        }
        if events.is_empty() {
            return Err(EventStoreError::EmptyAppend);
        }

        let current = log.versions.get(&key).copied().unwrap_or_default();
        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_type: key.0,
                stream_id: key.1,
                expected: expected_version,
                actual: current,
            });
        }

        let mut version = current;
        let mut global_positions = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let position = GlobalPosition::new(log.events.len() as u64 + 1);
            global_positions.push(position);
            log.events.push(RecordedEvent {
                event,
                version,
                global_position: position,
            });
        }
        tracing::trace!(stream_type = %key.0, stream_id = %key.1, %version, "Appended events");
        log.versions.insert(key, version);

        Ok(AppendResult {
            global_positions,
            new_version: version,
        })
    }
}

impl EventStore for InMemoryEventStore {
    fn append_to_stream(
        &self,
        stream_type: &StreamType,
        stream_id: &StreamId,
        expected_version: Version,
        events: Vec<Event>,
    ) -> BoxFuture<'_, Result<AppendResult, EventStoreError>> {
        let key = (stream_type.clone(), stream_id.clone());
        Box::pin(async move {
            if let Some(delay) = self.append_delay {
                tokio::time::sleep(delay).await;
            }
            self.append(key, expected_version, events)
        })
    }

    fn load_stream(
        &self,
        stream_type: &StreamType,
        stream_id: &StreamId,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        let stream_type = stream_type.clone();
        let stream_id = stream_id.clone();
        Box::pin(async move {
            Ok(self
                .log
                .lock()
                .unwrap()
                .events
                .iter()
                .filter(|r| r.event.stream_type == stream_type && r.event.stream_id == stream_id)
                .cloned()
                .collect())
        })
    }
}
