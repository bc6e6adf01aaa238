//! # Commandeer Core
//!
//! Core types and collaborator contracts for the Commandeer command
//! orchestration engine.
//!
//! This crate holds no behavior of its own. It defines:
//!
//! - **Data model**: [`command::Command`], [`command::CorrelationChain`],
//!   [`event::Event`], [`result::HandlerResult`], [`result::CommandResult`]
//! - **Collaborator contracts**: the durable log ([`event_store::EventStore`]),
//!   the idempotency ledger ([`ledger::IdempotencyLedger`]), the asynchronous
//!   dispatcher ([`dispatcher::AsyncDispatcher`]), and the command registry
//!   ([`registry::Registry`])
//!
//! The runtime crate wires these together; the testing crate provides
//! in-memory implementations.
//!
//! ## Architecture Principles
//!
//! - Closed sum types for every outcome
//! - Dependency injection via trait objects
//! - Downstream work crosses a message-passing boundary, never runs inline

use std::future::Future;
use std::pin::Pin;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Boxed, `Send` future used by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Commands, categories, and correlation chains.
pub mod command;

/// Asynchronous dispatcher contract.
pub mod dispatcher;

/// Injected environment (clock).
pub mod environment;

/// Events and event metadata.
pub mod event;

/// Durable log contract.
pub mod event_store;

/// Idempotency ledger contract.
pub mod ledger;

/// Command registration metadata.
pub mod registry;

/// Handler and command results.
pub mod result;

/// Stream identifiers, versions, and global positions.
pub mod stream;

pub use command::{Command, CommandCategory, CorrelationChain};
pub use event::{Event, EventCategory, EventData, EventMetadata};
pub use result::{CommandResult, HandlerResult, codes};
pub use stream::{GlobalPosition, StreamId, StreamType, Version};
