//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ports: PortsConfig,
    pub connection: ConnectionConfig,
    pub enrichment: EnrichmentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    pub host: String,
    /// First port of the listening range (inclusive)
    pub range_start: u16,
    /// Last port of the listening range (inclusive)
    pub range_end: u16,
    /// Ports inside the range that must not be bound
    #[serde(default)]
    pub skip: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// How long a connection may stay open before being force-closed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Payload sent immediately on accept; the connection is closed after sending.
    /// Takes precedence over `reply` when both are set.
    #[serde(default)]
    pub send: Option<String>,
    /// Payload sent in response to the first inbound data
    #[serde(default)]
    pub reply: Option<String>,
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    /// Path to a GeoLite2/GeoIP2 City database
    #[serde(default)]
    pub city_database: String,
    /// Optional GeoIP2 ISP database for provider attribution
    #[serde(default)]
    pub isp_database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for per-connection summary logs; empty disables the file sink
    #[serde(default)]
    pub directory: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(config::Environment::with_prefix("PORTTRAP"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.ports.host.is_empty() {
            anyhow::bail!("Listen host cannot be empty");
        }
        if self.ports.range_start == 0 {
            anyhow::bail!("Invalid range_start: 0 is not a bindable port");
        }
        if self.ports.range_start > self.ports.range_end {
            anyhow::bail!(
                "Invalid port range: range_start {} is greater than range_end {}",
                self.ports.range_start,
                self.ports.range_end
            );
        }
        if self.connection.idle_timeout_ms == 0 {
            anyhow::bail!("Invalid idle_timeout_ms: 0 would close connections at accept");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.idle_timeout_ms)
    }

    /// Ports the manager will actually bind, in ascending order
    pub fn listen_ports(&self) -> Vec<u16> {
        (self.ports.range_start..=self.ports.range_end)
            .filter(|p| !self.ports.skip.contains(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            ports: PortsConfig {
                host: "0.0.0.0".to_string(),
                range_start: 8000,
                range_end: 8005,
                skip: vec![8002, 8004],
            },
            connection: ConnectionConfig {
                idle_timeout_ms: 30_000,
                send: None,
                reply: None,
            },
            enrichment: EnrichmentConfig {
                enabled: false,
                city_database: String::new(),
                isp_database: String::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                directory: String::new(),
            },
        }
    }

    #[test]
    fn listen_ports_excludes_skip_list() {
        let config = base_config();
        assert_eq!(config.listen_ports(), vec![8000, 8001, 8003, 8005]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = base_config();
        config.ports.range_start = 9000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let mut config = base_config();
        config.connection.idle_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut config = base_config();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
