use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub advertise: AdvertiseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Interface to run discovery on; every interface when unset
    pub interface: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Notifications buffered per subscriber before deliveries are dropped
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdvertiseConfig {
    /// Host for registered records that name no server
    pub hostname: Option<String>,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_subscriber_queue() -> usize {
    1024
}

fn default_listen() -> String {
    "127.0.0.1:8053".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        if config.broker.subscriber_queue == 0 {
            anyhow::bail!("broker.subscriber_queue must be at least 1");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.discovery.interface, None);
        assert_eq!(config.discovery.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.broker.subscriber_queue, 1024);
        assert_eq!(config.api.listen, "127.0.0.1:8053");
        assert_eq!(config.advertise.hostname, None);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [discovery]
            interface = "wlan0"
            poll_interval_secs = 5

            [broker]
            subscriber_queue = 32

            [api]
            listen = "[::]:9000"

            [advertise]
            hostname = "kiosk.local."
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.interface.as_deref(), Some("wlan0"));
        assert_eq!(config.discovery.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.broker.subscriber_queue, 32);
        assert_eq!(config.api.listen, "[::]:9000");
        assert_eq!(config.advertise.hostname.as_deref(), Some("kiosk.local."));
    }

    #[test]
    fn test_zero_queue_rejected() {
        assert!(Config::parse("[broker]\nsubscriber_queue = 0").is_err());
    }
}
