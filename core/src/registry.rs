//! Command registration metadata and read-only introspection.
//!
//! The registry is an explicitly constructed value that is injected where it is
//! needed (middleware context, batch pre-flight validation). Tests build a fresh
//! instance instead of resetting shared state.

use crate::command::CommandCategory;
use crate::stream::StreamType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while building a registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A registration with the same command type already exists.
    #[error("Command type already registered: {0}")]
    Duplicate(String),

    /// The command type is empty.
    #[error("Command type cannot be empty")]
    EmptyCommandType,

    /// An aggregate command must name its target aggregate.
    #[error("Aggregate command {0} has no target aggregate")]
    MissingTargetAggregate(String),
}

/// The aggregate an aggregate-category command acts on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAggregate {
    /// Aggregate (stream) type, e.g. `"Order"`.
    pub aggregate_type: StreamType,
    /// Argument field holding the aggregate id, e.g. `"orderId"`.
    pub id_field: String,
}

impl TargetAggregate {
    /// Create a target aggregate description.
    #[must_use]
    pub fn new(aggregate_type: impl Into<StreamType>, id_field: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            id_field: id_field.into(),
        }
    }

    /// Read the aggregate id out of command arguments.
    ///
    /// String ids are used verbatim and numeric ids are rendered as strings.
    #[must_use]
    pub fn resolve_id(&self, args: &serde_json::Value) -> Option<String> {
        match args.get(&self.id_field)? {
            serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Metadata describing one registered command type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRegistration {
    /// Command type, e.g. `"CreateOrder"`.
    pub command_type: String,
    /// Classification.
    pub category: CommandCategory,
    /// Owning bounded context.
    pub bounded_context: String,
    /// Target aggregate, required for aggregate-category commands.
    pub target_aggregate: Option<TargetAggregate>,
    /// Free-form description for tooling.
    pub description: Option<String>,
}

impl CommandRegistration {
    /// Registration for an aggregate-category command.
    #[must_use]
    pub fn aggregate(
        command_type: impl Into<String>,
        bounded_context: impl Into<String>,
        target: TargetAggregate,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            category: CommandCategory::Aggregate,
            bounded_context: bounded_context.into(),
            target_aggregate: Some(target),
            description: None,
        }
    }

    /// Registration for a non-aggregate command.
    #[must_use]
    pub fn new(
        command_type: impl Into<String>,
        bounded_context: impl Into<String>,
        category: CommandCategory,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            category,
            bounded_context: bounded_context.into(),
            target_aggregate: None,
            description: None,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.command_type.is_empty() {
            return Err(RegistryError::EmptyCommandType);
        }
        if self.category == CommandCategory::Aggregate && self.target_aggregate.is_none() {
            return Err(RegistryError::MissingTargetAggregate(
                self.command_type.clone(),
            ));
        }
        Ok(())
    }
}

/// Lookup seam consumed by middleware context building and batch validation.
pub trait Registry: Send + Sync {
    /// Registration for a command type, if registered.
    fn get_registration(&self, command_type: &str) -> Option<CommandRegistration>;
}

/// In-process registry of command registrations.
///
/// # Examples
///
/// ```
/// use commandeer_core::registry::{CommandRegistration, CommandRegistry, Registry, TargetAggregate};
///
/// let mut registry = CommandRegistry::new();
/// registry
///     .register(CommandRegistration::aggregate(
///         "CreateOrder",
///         "orders",
///         TargetAggregate::new("Order", "orderId"),
///     ))
///     .unwrap();
///
/// assert!(registry.get_registration("CreateOrder").is_some());
/// assert!(registry.register(CommandRegistration::aggregate(
///     "CreateOrder",
///     "orders",
///     TargetAggregate::new("Order", "orderId"),
/// )).is_err());
/// ```
#[derive(Clone, Debug, Default)]
pub struct CommandRegistry {
    registrations: BTreeMap<String, CommandRegistration>,
}

impl CommandRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Duplicate`] if the command type is already registered
    /// - [`RegistryError::EmptyCommandType`] / [`RegistryError::MissingTargetAggregate`]
    ///   if the registration is malformed
    pub fn register(&mut self, registration: CommandRegistration) -> Result<(), RegistryError> {
        registration.validate()?;
        if self.registrations.contains_key(&registration.command_type) {
            return Err(RegistryError::Duplicate(registration.command_type));
        }
        self.registrations
            .insert(registration.command_type.clone(), registration);
        Ok(())
    }

    /// Borrow a registration.
    #[must_use]
    pub fn get(&self, command_type: &str) -> Option<&CommandRegistration> {
        self.registrations.get(command_type)
    }

    /// Whether a command type is registered.
    #[must_use]
    pub fn contains(&self, command_type: &str) -> bool {
        self.registrations.contains_key(command_type)
    }

    /// All registered command types, sorted.
    #[must_use]
    pub fn command_types(&self) -> Vec<&str> {
        self.registrations.keys().map(String::as_str).collect()
    }

    /// All registrations owned by a bounded context.
    #[must_use]
    pub fn by_bounded_context(&self, bounded_context: &str) -> Vec<&CommandRegistration> {
        self.registrations
            .values()
            .filter(|r| r.bounded_context == bounded_context)
            .collect()
    }

    /// All registrations of a category.
    #[must_use]
    pub fn by_category(&self, category: CommandCategory) -> Vec<&CommandRegistration> {
        self.registrations
            .values()
            .filter(|r| r.category == category)
            .collect()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl Registry for CommandRegistry {
    fn get_registration(&self, command_type: &str) -> Option<CommandRegistration> {
        self.get(command_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_order() -> CommandRegistration {
        CommandRegistration::aggregate(
            "CreateOrder",
            "orders",
            TargetAggregate::new("Order", "orderId"),
        )
    }

    #[test]
    fn rejects_duplicates() {
        let mut registry = CommandRegistry::new();
        assert!(registry.register(create_order()).is_ok());
        assert_eq!(
            registry.register(create_order()),
            Err(RegistryError::Duplicate("CreateOrder".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn aggregate_registration_requires_target() {
        let mut registry = CommandRegistry::new();
        let result = registry.register(CommandRegistration::new(
            "CreateOrder",
            "orders",
            CommandCategory::Aggregate,
        ));
        assert_eq!(
            result,
            Err(RegistryError::MissingTargetAggregate("CreateOrder".to_string()))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn introspection_queries() {
        let mut registry = CommandRegistry::new();
        let _ = registry.register(create_order());
        let _ = registry.register(CommandRegistration::new(
            "RunFulfillment",
            "fulfillment",
            CommandCategory::Process,
        ));

        assert_eq!(registry.command_types(), vec!["CreateOrder", "RunFulfillment"]);
        assert_eq!(registry.by_bounded_context("orders").len(), 1);
        assert_eq!(registry.by_category(CommandCategory::Process).len(), 1);
        assert!(registry.contains("RunFulfillment"));
        assert!(registry.get_registration("Unknown").is_none());
    }

    #[test]
    fn resolves_aggregate_ids() {
        let target = TargetAggregate::new("Order", "orderId");
        assert_eq!(target.resolve_id(&json!({ "orderId": "o1" })), Some("o1".to_string()));
        assert_eq!(target.resolve_id(&json!({ "orderId": 42 })), Some("42".to_string()));
        assert_eq!(target.resolve_id(&json!({ "orderId": "" })), None);
        assert_eq!(target.resolve_id(&json!({ "other": "o1" })), None);
    }
}
