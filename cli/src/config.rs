// Configuration management for the swarmnet CLI
//
// Stored as JSON in the platform config dir:
// - Linux: ~/.config/swarmnet/config.json
// - macOS: ~/Library/Application Support/swarmnet/config.json
// - Windows: %APPDATA%\swarmnet\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use swarmnet_core::api::Backoff;
use swarmnet_core::{NetworkConfig, NetworkEnvironment};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,

    /// Snode store location; the data dir when unset
    pub storage_path: Option<String>,

    /// Also write daily-rolling logs into the data dir
    pub log_to_file: bool,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("swarmnet");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("swarmnet");
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("store")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.network.validate().context("Invalid network config")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value; the result is validated before it is kept
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        let network = &mut updated.network;
        match key {
            "environment" => {
                network.environment = match value {
                    "mainnet" => NetworkEnvironment::Mainnet,
                    "custom" => NetworkEnvironment::Custom {
                        seeds: network.environment.seed_urls(),
                    },
                    _ => anyhow::bail!("Unknown environment: {} (mainnet|custom)", value),
                }
            }
            "seeds" => {
                let seeds = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                network.environment = NetworkEnvironment::Custom { seeds };
            }
            "path_size" => network.path_size = value.parse().context("Invalid number")?,
            "guard_count" => network.guard_count = value.parse().context("Invalid number")?,
            "min_pool_size" => network.min_pool_size = value.parse().context("Invalid number")?,
            "min_swarm_size" => network.min_swarm_size = value.parse().context("Invalid number")?,
            "batch_window_ms" => network.batch_window_ms = value.parse().context("Invalid number")?,
            "http_timeout_secs" => {
                network.http_timeout_secs = value.parse().context("Invalid number")?
            }
            "clock_resync_interval_secs" => {
                network.clock_resync_interval_secs = value.parse().context("Invalid number")?
            }
            "retry.max_attempts" => {
                network.retry.max_attempts = value.parse().context("Invalid number")?
            }
            "retry.delay_ms" => {
                let delay_ms: u64 = value.parse().context("Invalid number")?;
                network.retry.backoff = if delay_ms == 0 {
                    Backoff::None
                } else {
                    Backoff::Fixed { delay_ms }
                };
            }
            "storage_path" => {
                updated.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_to_file" => updated.log_to_file = value.parse().context("Invalid boolean value")?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.network.validate().context("Invalid network config")?;
        *self = updated;
        Ok(())
    }

    /// All settable keys with their current values
    pub fn list(&self) -> Vec<(&'static str, String)> {
        let network = &self.network;
        let environment = match &network.environment {
            NetworkEnvironment::Mainnet => "mainnet",
            NetworkEnvironment::Custom { .. } => "custom",
        };
        let backoff = match network.retry.backoff {
            Backoff::None => "none".to_string(),
            Backoff::Fixed { delay_ms } => format!("fixed {}ms", delay_ms),
            Backoff::Uniform { min_ms, max_ms } => format!("uniform {}-{}ms", min_ms, max_ms),
        };
        vec![
            ("environment", environment.to_string()),
            ("seeds", network.environment.seed_urls().join(",")),
            ("path_size", network.path_size.to_string()),
            ("guard_count", network.guard_count.to_string()),
            ("min_pool_size", network.min_pool_size.to_string()),
            ("min_swarm_size", network.min_swarm_size.to_string()),
            ("batch_window_ms", network.batch_window_ms.to_string()),
            ("http_timeout_secs", network.http_timeout_secs.to_string()),
            (
                "clock_resync_interval_secs",
                network.clock_resync_interval_secs.to_string(),
            ),
            ("retry.max_attempts", network.retry.max_attempts.to_string()),
            ("retry.backoff", backoff),
            ("storage_path", self.storage_path.clone().unwrap_or_default()),
            ("log_to_file", self.log_to_file.to_string()),
        ]
    }
}
