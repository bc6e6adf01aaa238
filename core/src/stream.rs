//! Stream identification, per-stream versions, and global log positions.
//!
//! Every event belongs to exactly one stream, addressed by a `(StreamType, StreamId)`
//! pair such as `Order/o1`. Within a stream, versions increase strictly by one per
//! appended event; across the whole log, each event also receives a monotonically
//! increasing [`GlobalPosition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for stream identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream identifier: {0}")]
pub struct ParseStreamIdError(String);

/// The kind of stream an event belongs to (usually the aggregate type).
///
/// # Examples
///
/// ```
/// use commandeer_core::stream::StreamType;
///
/// let stream_type = StreamType::new("Order");
/// assert_eq!(stream_type.as_str(), "Order");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamType(String);

impl StreamType {
    /// Create a new `StreamType`.
    #[must_use]
    pub fn new(stream_type: impl Into<String>) -> Self {
        Self(stream_type.into())
    }

    /// Get the stream type as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single stream instance (usually the aggregate id).
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings
/// - `From::from()` and `new()`: no validation, for trusted input
///
/// # Examples
///
/// ```
/// use commandeer_core::stream::StreamId;
///
/// let stream_id = StreamId::new("o1");
/// assert_eq!(stream_id.as_str(), "o1");
///
/// let parsed: StreamId = "o2".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("o2"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new `StreamId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the stream id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

macro_rules! string_newtype_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $ty {
            type Err = ParseStreamIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Err(ParseStreamIdError(format!(
                        "{} cannot be empty",
                        stringify!($ty)
                    )));
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype_impls!(StreamType);
string_newtype_impls!(StreamId);

/// Per-stream version used for optimistic concurrency control.
///
/// A stream with no events is at version 0. Appending one event to a stream at
/// version `n` moves it to `n + 1`. An append states the version it expects the
/// stream to be at; if the stream has moved on, the append is refused.
///
/// # Examples
///
/// ```
/// use commandeer_core::stream::Version;
///
/// let v1 = Version::INITIAL.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!(v1.previous(), Version::INITIAL);
/// assert_eq!(Version::INITIAL.previous(), Version::INITIAL);
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a stream that has no events yet.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the version that precedes this one, saturating at zero.
    ///
    /// A handler that reports the version its event produces implies the stream
    /// was at `version.previous()` when it decided.
    #[must_use]
    pub const fn previous(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Position of an event in the whole log, across all streams.
///
/// Projections use it as a checkpoint: applying events in global position
/// order reproduces the order in which they were committed.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    /// Create a new `GlobalPosition`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod stream_id_tests {
        use super::*;

        #[test]
        #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
        fn parse_from_str() {
            let id: StreamId = "o1".parse().expect("parse should succeed");
            assert_eq!(id, StreamId::new("o1"));
        }

        #[test]
        fn parse_empty_string_fails() {
            assert!("".parse::<StreamId>().is_err());
            assert!("".parse::<StreamType>().is_err());
        }

        #[test]
        fn serializes_transparently() {
            let json = serde_json::to_value(StreamId::new("o1")).unwrap_or_default();
            assert_eq!(json, serde_json::json!("o1"));
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", StreamType::new("Order")), "Order");
            assert_eq!(format!("{}", StreamId::new("o1")), "o1");
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn next_and_previous() {
            let v2 = Version::INITIAL.next().next();
            assert_eq!(v2, Version::new(2));
            assert_eq!(v2.previous(), Version::new(1));
        }

        #[test]
        fn previous_saturates_at_initial() {
            assert_eq!(Version::INITIAL.previous(), Version::INITIAL);
        }

        #[test]
        fn ordering() {
            assert!(Version::new(1) < Version::new(2));
            assert!(GlobalPosition::new(10) > GlobalPosition::new(3));
        }

        #[test]
        fn version_from_u64() {
            let version = Version::from(42_u64);
            let num: u64 = version.into();
            assert_eq!(num, 42);
            assert_eq!(version + 1, Version::new(43));
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn previous_undoes_next(value in 0_u64..u64::MAX) {
                let version = Version::new(value);
                prop_assert_eq!(version.next().previous(), version);
            }

            #[test]
            fn non_empty_ids_parse(id in "[a-zA-Z0-9-]{1,32}") {
                let parsed: Result<StreamId, _> = id.parse();
                prop_assert_eq!(parsed.map(StreamId::into_inner), Ok(id));
            }
        }
    }
}
