//! # Commandeer Testing
//!
//! In-memory collaborators and fixtures for testing command orchestration.
//!
//! This crate provides:
//! - [`InMemoryEventStore`]: a versioned, append-only log with optimistic
//!   concurrency checks and global positions
//! - [`InMemoryLedger`]: an idempotency ledger with unique-insert semantics
//! - [`RecordingDispatcher`]: captures every enqueued task, with programmable
//!   failures
//! - [`FixedClock`]: deterministic time
//! - [`fixtures`]: command and event builders
//!
//! ## Example
//!
//! ```
//! use commandeer_core::event_store::EventStore;
//! use commandeer_core::{EventData, StreamId, StreamType, Version};
//! use commandeer_testing::{InMemoryEventStore, fixtures};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryEventStore::new();
//! let event = fixtures::event(EventData::new("OrderCreated", "Order", "o1", "orders", json!({})));
//!
//! store
//!     .append_to_stream(&StreamType::new("Order"), &StreamId::new("o1"), Version::INITIAL, vec![event])
//!     .await?;
//!
//! assert_eq!(store.stream_len("Order", "o1"), 1);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use commandeer_core::environment::Clock;

/// In-memory asynchronous dispatcher.
pub mod dispatcher;

/// In-memory durable log.
pub mod event_store;

/// Command and event builders.
pub mod fixtures;

/// In-memory idempotency ledger.
pub mod ledger;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use commandeer_testing::mocks::FixedClock;
    /// use commandeer_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub use dispatcher::RecordingDispatcher;
pub use event_store::InMemoryEventStore;
pub use ledger::InMemoryLedger;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
