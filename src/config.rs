//! Configuration Module
//!
//! Environment-driven settings for the API, the broker and the position source.

use std::path::PathBuf;

const DEFAULT_API_URL: &str = "http://192.168.234.250:8080";
const DEFAULT_BROKER_URL: &str = "tcp://192.168.234.250:1883";
const DEFAULT_TOPIC: &str = "tracking/coordinates";
const DEFAULT_GPSD_ADDR: &str = "127.0.0.1:2947";
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Broker host and port parsed from a `tcp://` or `mqtt://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse a broker URL such as `tcp://10.0.0.5:1883`
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let rest = url
            .strip_prefix("tcp://")
            .or_else(|| url.strip_prefix("mqtt://"))
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(url.to_string()))?;
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidBrokerUrl(url.to_string()))?;
                (host, port)
            }
            None => (rest, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return Err(ConfigError::InvalidBrokerUrl(url.to_string()));
        }

        Ok(Self { host: host.to_string(), port })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub broker: BrokerAddress,
    pub topic: String,
    pub gpsd_addr: String,
    pub data_dir: PathBuf,
    pub bus_name: String,
}

impl Config {
    /// Load configuration from `BUS_TRACKER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let api_url = get("BUS_TRACKER_API_URL", DEFAULT_API_URL);
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::InvalidApiUrl(api_url));
        }

        let broker = BrokerAddress::parse(&get("BUS_TRACKER_BROKER_URL", DEFAULT_BROKER_URL))?;

        let data_dir = lookup("BUS_TRACKER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let bus_name = lookup("BUS_TRACKER_BUS_NAME")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                whoami::fallible::hostname().unwrap_or_else(|_| "unknown bus".to_string())
            });

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            broker,
            topic: get("BUS_TRACKER_TOPIC", DEFAULT_TOPIC),
            gpsd_addr: get("BUS_TRACKER_GPSD_ADDR", DEFAULT_GPSD_ADDR),
            data_dir,
            bus_name,
        })
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("BusTracker")
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Invalid API URL: {0}")]
    InvalidApiUrl(String),
}
