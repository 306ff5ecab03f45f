//! Proxy configuration
//!
//! Timing and capacity knobs for the relay-session manager. The defaults are
//! the values the public volunteer deployment runs with.

use std::time::Duration;
use thiserror::Error;

/// Default rendezvous broker endpoint.
pub const DEFAULT_BROKER_URL: &str = "wss://snowflake-broker.torproject.net/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the proxy controller and everything it owns
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Broker signaling endpoint (ws:// or wss://)
    pub broker_url: String,
    /// STUN servers handed to the negotiation primitive
    pub stun_servers: Vec<String>,
    /// Admission cap: concurrently hosted sessions
    pub max_num_clients: usize,
    /// Fixed wait between broker reconnect attempts
    pub retry_interval: Duration,
    /// Consecutive broker connect failures tolerated before giving up
    pub max_retries: u8,
    /// Upper bound on a single broker dial
    pub connect_timeout: Duration,
    /// Upper bound on NAT classification
    pub probe_timeout: Duration,
    /// Upper bound on waiting for an answer once an offer is out, and again
    /// on waiting for the data channel once the answer is applied
    pub datachannel_timeout: Duration,
    /// Upper bound on a single call into the negotiation primitive
    pub negotiation_timeout: Duration,
    /// Delay before a terminated session is replaced
    pub replacement_delay: Duration,
    /// Uptime accounting granularity, in whole seconds
    pub uptime_tick: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun.services.mozilla.com:3478".to_string(),
            ],
            max_num_clients: 1,
            retry_interval: Duration::from_secs(5),
            max_retries: 5,
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            datachannel_timeout: Duration::from_secs(20),
            negotiation_timeout: Duration::from_secs(10),
            replacement_delay: Duration::from_secs(1),
            uptime_tick: Duration::from_secs(1),
        }
    }
}

impl ProxyConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.broker_url.starts_with("ws://") || self.broker_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "broker_url must be a ws:// or wss:// URL, got {}",
                self.broker_url
            )));
        }

        if self.max_num_clients == 0 {
            return Err(ConfigError::Invalid(
                "max_num_clients must be > 0".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0".to_string()));
        }

        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("probe_timeout", self.probe_timeout),
            ("datachannel_timeout", self.datachannel_timeout),
            ("negotiation_timeout", self.negotiation_timeout),
            ("uptime_tick", self.uptime_tick),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        if self.uptime_tick.subsec_nanos() != 0 {
            return Err(ConfigError::Invalid(format!(
                "uptime_tick must be whole seconds, got {:?}",
                self.uptime_tick
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_num_clients, 1);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.datachannel_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_rejects_http_broker() {
        let config = ProxyConfig {
            broker_url: "https://broker.example".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_cap() {
        let config = ProxyConfig {
            max_num_clients: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let config = ProxyConfig {
            probe_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("probe_timeout must be non-zero".to_string()))
        );
    }

    #[test]
    fn test_rejects_fractional_uptime_tick() {
        let config = ProxyConfig {
            uptime_tick: Duration::from_millis(500),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProxyConfig {
            uptime_tick: Duration::from_millis(2500),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProxyConfig {
            uptime_tick: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
