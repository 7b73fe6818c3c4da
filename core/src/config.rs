// Network configuration: tunables for the pool, paths, swarms and retries

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::api::RetryPolicy;

const MAINNET_SEEDS: [&str; 3] = [
    "https://seed1.getsession.org:4443/json_rpc",
    "https://seed2.getsession.org:4443/json_rpc",
    "https://seed3.getsession.org:4443/json_rpc",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkEnvironment {
    Mainnet,
    /// Local or test network with operator-supplied seeds
    Custom { seeds: Vec<String> },
}

impl NetworkEnvironment {
    pub fn seed_urls(&self) -> Vec<String> {
        match self {
            NetworkEnvironment::Mainnet => MAINNET_SEEDS.iter().map(|s| s.to_string()).collect(),
            NetworkEnvironment::Custom { seeds } => seeds.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub environment: NetworkEnvironment,

    /// Hops per onion path, guard included
    pub path_size: usize,

    /// Guards kept warm for new paths
    pub guard_count: usize,

    /// Pool size below which the seeds are queried again
    pub min_pool_size: usize,

    /// Smallest swarm accepted from `get_snodes_for_pubkey`
    pub min_swarm_size: usize,

    pub batch_window_ms: u64,

    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,

    /// Throttle between successful clock resyncs
    pub clock_resync_interval_secs: u64,

    pub retry: RetryPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            environment: NetworkEnvironment::Mainnet,
            path_size: 3,
            guard_count: 2,
            min_pool_size: 12,
            min_swarm_size: 3,
            batch_window_ms: 100,
            http_timeout_secs: 30,
            clock_resync_interval_secs: 600,
            retry: RetryPolicy::default(),
        }
    }
}

impl NetworkConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn clock_resync_interval(&self) -> Duration {
        Duration::from_secs(self.clock_resync_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.path_size == 0 {
            return Err(invalid("path_size", "must be at least 1"));
        }
        if self.guard_count == 0 {
            return Err(invalid("guard_count", "must be at least 1"));
        }
        if self.min_pool_size < self.path_size + self.guard_count {
            return Err(invalid(
                "min_pool_size",
                "must hold a full path plus the guard set",
            ));
        }
        if self.min_swarm_size == 0 {
            return Err(invalid("min_swarm_size", "must be at least 1"));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid("http_timeout_secs", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if let NetworkEnvironment::Custom { seeds } = &self.environment {
            if seeds.is_empty() {
                return Err(invalid("environment.seeds", "custom environment needs seeds"));
            }
            if let Some(bad) = seeds.iter().find(|s| !s.starts_with("http://") && !s.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field: "environment.seeds",
                    reason: format!("not an http(s) url: {}", bad),
                });
            }
        }
        Ok(())
    }

    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: NetworkConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Backoff;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.environment.seed_urls().len(), 3);
        assert_eq!(config.batch_window(), Duration::from_millis(100));
        assert_eq!(config.clock_resync_interval(), Duration::from_secs(600));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = NetworkConfig::default();
        config.min_pool_size = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "min_pool_size", .. })
        ));

        let config = NetworkConfig {
            environment: NetworkEnvironment::Custom { seeds: vec![] },
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());

        let config = NetworkConfig {
            environment: NetworkEnvironment::Custom {
                seeds: vec!["seed.local:22023".into()],
            },
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");

        let config = NetworkConfig {
            environment: NetworkEnvironment::Custom {
                seeds: vec!["http://127.0.0.1:22023/json_rpc".into()],
            },
            retry: RetryPolicy {
                max_attempts: 5,
                backoff: Backoff::Fixed { delay_ms: 50 },
            },
            ..NetworkConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(NetworkConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"path_size": 4}"#).unwrap();
        assert_eq!(config.path_size, 4);
        assert_eq!(config.environment, NetworkEnvironment::Mainnet);
    }
}
