// Configuration management for the flurry CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/flurry/config.json
// - Linux: ~/.config/flurry/config.json
// - Windows: %APPDATA%\flurry\config.json

use anyhow::{Context, Result};
use flurry_core::config::DEFAULT_BROKER_URL;
use flurry_core::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker signaling endpoint
    pub broker_url: String,

    /// STUN servers for the negotiation primitive
    pub stun_servers: Vec<String>,

    /// Concurrently hosted clients
    pub max_num_clients: usize,

    /// Storage path for persisted proxy state
    pub storage_path: Option<String>,

    /// Timing settings
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Seconds between broker reconnect attempts
    pub retry_interval: u64,

    /// Broker connect failures before giving up
    pub max_retries: u8,

    /// Broker dial timeout in seconds
    pub connect_timeout: u64,

    /// NAT probe timeout in seconds
    pub probe_timeout: u64,

    /// Seconds to wait for a client's answer
    pub datachannel_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        let proxy = ProxyConfig::default();
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            stun_servers: proxy.stun_servers,
            max_num_clients: proxy.max_num_clients,
            storage_path: None,
            timing: TimingConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        let proxy = ProxyConfig::default();
        Self {
            retry_interval: proxy.retry_interval.as_secs(),
            max_retries: proxy.max_retries,
            connect_timeout: proxy.connect_timeout.as_secs(),
            probe_timeout: proxy.probe_timeout.as_secs(),
            datachannel_timeout: proxy.datachannel_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("flurry");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("flurry");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Directory holding the persisted proxy state
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("state")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory; the caller saves
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let previous = self.clone();
        match key {
            "broker_url" => {
                self.broker_url = value.to_string();
            }
            "stun_servers" => {
                self.stun_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "max_num_clients" => {
                self.max_num_clients = value.parse().context("Invalid number")?;
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "retry_interval" => {
                self.timing.retry_interval = value.parse().context("Invalid number of seconds")?;
            }
            "max_retries" => {
                self.timing.max_retries = value.parse().context("Invalid retry count")?;
            }
            "connect_timeout" => {
                self.timing.connect_timeout =
                    value.parse().context("Invalid number of seconds")?;
            }
            "probe_timeout" => {
                self.timing.probe_timeout = value.parse().context("Invalid number of seconds")?;
            }
            "datachannel_timeout" => {
                self.timing.datachannel_timeout =
                    value.parse().context("Invalid number of seconds")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        if let Err(e) = self.to_proxy_config() {
            *self = previous;
            return Err(e.context(format!("Rejected value for {}", key)));
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "broker_url" => Some(self.broker_url.clone()),
            "stun_servers" => Some(self.stun_servers.join(",")),
            "max_num_clients" => Some(self.max_num_clients.to_string()),
            "storage_path" => self.storage_path.clone(),
            "retry_interval" => Some(self.timing.retry_interval.to_string()),
            "max_retries" => Some(self.timing.max_retries.to_string()),
            "connect_timeout" => Some(self.timing.connect_timeout.to_string()),
            "probe_timeout" => Some(self.timing.probe_timeout.to_string()),
            "datachannel_timeout" => Some(self.timing.datachannel_timeout.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("broker_url".to_string(), self.broker_url.clone()),
            ("stun_servers".to_string(), self.stun_servers.join(",")),
            ("max_num_clients".to_string(), self.max_num_clients.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("retry_interval".to_string(), format!("{}s", self.timing.retry_interval)),
            ("max_retries".to_string(), self.timing.max_retries.to_string()),
            ("connect_timeout".to_string(), format!("{}s", self.timing.connect_timeout)),
            ("probe_timeout".to_string(), format!("{}s", self.timing.probe_timeout)),
            (
                "datachannel_timeout".to_string(),
                format!("{}s", self.timing.datachannel_timeout),
            ),
        ]
    }

    /// Build and validate the core proxy configuration
    pub fn to_proxy_config(&self) -> Result<ProxyConfig> {
        let config = ProxyConfig {
            broker_url: self.broker_url.clone(),
            stun_servers: self.stun_servers.clone(),
            max_num_clients: self.max_num_clients,
            retry_interval: Duration::from_secs(self.timing.retry_interval),
            max_retries: self.timing.max_retries,
            connect_timeout: Duration::from_secs(self.timing.connect_timeout),
            probe_timeout: Duration::from_secs(self.timing.probe_timeout),
            datachannel_timeout: Duration::from_secs(self.timing.datachannel_timeout),
            ..ProxyConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
