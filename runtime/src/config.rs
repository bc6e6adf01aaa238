//! Runtime configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```
//! use commandeer_runtime::config::CoordinatorConfig;
//!
//! let config: CoordinatorConfig =
//!     serde_json::from_str(r#"{ "dlq_max_size": 50, "default_retry_policy": { "max_retries": 5 } }"#)
//!         .unwrap();
//!
//! assert_eq!(config.dlq_max_size, 50);
//! assert_eq!(config.default_retry_policy.max_retries, 5);
//! ```

use crate::retry::RetryPolicy;
use serde::Deserialize;

/// Configuration for a [`CommandCoordinator`](crate::coordinator::CommandCoordinator).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of parked downstream dispatch failures
    pub dlq_max_size: usize,
    /// Policy used by `execute_with_retry` when the caller passes none
    pub default_retry_policy: RetryPolicy,
}

impl CoordinatorConfig {
    /// Set the dead-letter queue size.
    #[must_use]
    pub const fn with_dlq_max_size(mut self, max_size: usize) -> Self {
        self.dlq_max_size = max_size;
        self
    }

    /// Set the default conflict retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dlq_max_size: 1000,
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builder_setters() {
        let config = CoordinatorConfig::default()
            .with_dlq_max_size(5)
            .with_retry_policy(RetryPolicy::none());

        assert_eq!(config.dlq_max_size, 5);
        assert_eq!(config.default_retry_policy.max_retries, 0);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config: CoordinatorConfig = serde_json::from_str("{}").unwrap_or_default();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(
            config.default_retry_policy.initial_delay,
            Duration::from_millis(50)
        );
    }
}
