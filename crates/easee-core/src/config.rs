use std::time::Duration;

use thiserror::Error;
use tracing::error;

pub const DEFAULT_API_URL: &str = "https://api.easee.com";
pub const DEFAULT_STREAM_URL: &str = "https://streams.easee.com/hubs/chargers";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no username set")]
    MissingUsername,
    #[error("no password set")]
    MissingPassword,
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub username: String,
    pub password: String,
    pub poll_interval: Duration,
    pub min_session_interval: Duration,
    pub enable_push: bool,
    pub api_url: String,
    pub stream_url: String,
    pub circuit_debounce: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_session_interval: Duration::from_secs(120),
            enable_push: false,
            api_url: DEFAULT_API_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            circuit_debounce: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl AdapterConfig {
    /// Replaces out-of-range values with their defaults. Never fails.
    pub fn normalized(mut self) -> Self {
        if self.poll_interval < MIN_POLL_INTERVAL {
            error!(
                poll_interval_ms = %self.poll_interval.as_millis(),
                fallback_secs = DEFAULT_POLL_INTERVAL.as_secs(),
                "poll interval too short, using default"
            );
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            self.max_reconnect_delay = self.reconnect_delay;
        }
        self
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = self.username.trim();
        // "+49" is the prefilled placeholder of the settings form.
        if username.is_empty() || username == "+49" {
            return Err(ConfigError::MissingUsername);
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingPassword);
        }
        Ok(Credentials {
            username: username.to_string(),
            password: self.password.clone(),
        })
    }

    /// Number of poll cycles that must pass before monthly sessions are fetched again.
    pub fn session_round_threshold(&self) -> f64 {
        self.min_session_interval.as_secs_f64() / self.poll_interval.as_secs_f64()
    }
}
