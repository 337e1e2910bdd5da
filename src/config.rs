use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be between 0.0 and 1.0, got {value}")]
    OutOfRange { key: &'static str, value: f32 },
    #[error("{key} must be at least 1 millisecond")]
    ZeroInterval { key: &'static str },
}

/// Application configuration
/// In debug builds a .env file is read into the environment first
#[derive(Clone, Debug)]
pub struct Config {
    /// Catalog server base URL; timeline reporting is off without it
    pub server_url: Option<String>,
    pub token: Option<String>,
    /// Stable identifier sent with every report
    pub client_id: String,
    pub progress_interval: Duration,
    pub report_interval: Duration,
    pub report_timeout: Duration,
    /// Volume used while another app holds transient audio focus. Applies
    /// to renderers built with `LocalRenderer::from_config`; the bundled
    /// binary plays through a simulated renderer and ignores it.
    pub duck_volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            client_id: uuid::Uuid::new_v4().to_string(),
            progress_interval: Duration::from_millis(1000),
            report_interval: Duration::from_millis(10_000),
            report_timeout: Duration::from_millis(5000),
            duck_volume: 0.2,
        }
    }
}

impl Config {
    /// Load configuration based on build mode
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                info!("Config: Dev mode activated - loaded .env file");
            } else {
                info!("Config: No .env file found, using environment only");
            }
        }

        Self::from_env()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match non_empty(key) {
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(0) => Err(ConfigError::ZeroInterval { key }),
                    Ok(ms) => Ok(Duration::from_millis(ms)),
                    Err(_) => Err(ConfigError::InvalidNumber { key, value }),
                },
                None => Ok(default),
            }
        };

        let duck_volume = match non_empty("TONEARM_DUCK_VOLUME") {
            Some(value) => {
                let parsed = value.trim().parse::<f32>().map_err(|_| ConfigError::InvalidNumber {
                    key: "TONEARM_DUCK_VOLUME",
                    value: value.clone(),
                })?;
                if !(0.0..=1.0).contains(&parsed) {
                    return Err(ConfigError::OutOfRange {
                        key: "TONEARM_DUCK_VOLUME",
                        value: parsed,
                    });
                }
                parsed
            }
            None => defaults.duck_volume,
        };

        let server_url = non_empty("TONEARM_SERVER_URL");
        match &server_url {
            Some(url) => info!("Config: Reporting timeline to {}", url),
            None => info!("Config: No server configured, timeline reporting disabled"),
        }

        Ok(Self {
            server_url,
            token: non_empty("TONEARM_TOKEN"),
            client_id: non_empty("TONEARM_CLIENT_ID").unwrap_or(defaults.client_id),
            progress_interval: millis("TONEARM_PROGRESS_INTERVAL_MS", defaults.progress_interval)?,
            report_interval: millis("TONEARM_REPORT_INTERVAL_MS", defaults.report_interval)?,
            report_timeout: millis("TONEARM_REPORT_TIMEOUT_MS", defaults.report_timeout)?,
            duck_volume,
        })
    }
}
