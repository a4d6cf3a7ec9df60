//! Engine configuration.
//!
//! All knobs are externally supplied: the daemon reads them from the
//! bootstrap document, embedders pass them directly. Defaults favor a small
//! deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRIES, RetryPolicy};

const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 60;
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_CONCURRENT_UPDATES: usize = 8;

/// Tunables for the update engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between global update cycles.
    pub update_interval_secs: u64,
    /// Retries per handler before the fallback list advances.
    pub max_retries: u32,
    /// Base of the exponential backoff schedule, in seconds.
    pub backoff_factor: f64,
    /// Deadline for a single handler invocation, in seconds.
    pub handler_timeout_secs: u64,
    /// How many entities may update concurrently within one cycle.
    pub max_concurrent_updates: usize,
    /// Run the dynamic-refactor pass each cycle.
    pub refactor_enabled: bool,
    /// Run the autopoiesis pass each cycle.
    pub autopoiesis_enabled: bool,
    /// Run graph analysis and authority smoothing each cycle.
    pub authority_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
            max_concurrent_updates: DEFAULT_MAX_CONCURRENT_UPDATES,
            refactor_enabled: false,
            autopoiesis_enabled: false,
            authority_enabled: false,
        }
    }
}

impl EngineConfig {
    /// The cycle period as a duration.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// The handler invocation deadline as a duration.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// The retry policy iQueries built from this configuration should use.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_factor: self.backoff_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.update_interval(), Duration::from_secs(60));
        assert_eq!(config.handler_timeout(), Duration::from_secs(15));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(!config.authority_enabled);
    }

    #[test]
    fn partial_documents_fill_from_defaults() {
        let config: EngineConfig =
            serde_yml::from_str("update_interval_secs: 5\nauthority_enabled: true").unwrap();
        assert_eq!(config.update_interval_secs, 5);
        assert!(config.authority_enabled);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }
}
