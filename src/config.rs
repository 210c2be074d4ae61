//! Configuration for the connectivity client
//!
//! Sources, later ones overriding earlier: built-in defaults, an optional
//! `gl-connect.toml` in the working directory, then `GL_*` environment
//! variables (a `.env` file is loaded first).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{GlError, Result};
use crate::market::split_key;
use crate::protocol::{Routing, MAX_HEADER_NUMBER};
use crate::session::{
    SessionSettings, DEFAULT_DICTIONARY_DELAY, DEFAULT_DICTIONARY_QUIET_PERIOD,
    DEFAULT_LOGIN_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub market_data_host: String,
    pub market_data_port: u16,
    /// Called address in market-data headers
    pub market_data_address: u32,

    pub order_entry_host: String,
    pub order_entry_port: u16,
    pub order_entry_address: u32,

    /// Our address until the venue assigns one at login
    pub calling_address: u32,

    pub username: String,
    pub password: String,
    /// Account number carried by every order
    pub user_number: String,

    pub login_timeout_secs: u64,
    pub request_timeout_secs: u64,

    pub dictionary_delay_ms: u64,
    pub dictionary_quiet_secs: u64,
    /// Comma separated `exchange:market` pairs
    pub dictionary_catalog: String,

    /// Comma separated instrument keys subscribed at startup
    pub subscriptions: String,

    /// IPC socket path for publishing events
    pub ipc_socket_path: String,

    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            market_data_host: "127.0.0.1".to_string(),
            market_data_port: 5000,
            market_data_address: 1,
            order_entry_host: "127.0.0.1".to_string(),
            order_entry_port: 5001,
            order_entry_address: 2,
            calling_address: 0,
            username: String::new(),
            password: String::new(),
            user_number: String::new(),
            login_timeout_secs: DEFAULT_LOGIN_TIMEOUT.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            dictionary_delay_ms: DEFAULT_DICTIONARY_DELAY.as_millis() as u64,
            dictionary_quiet_secs: DEFAULT_DICTIONARY_QUIET_PERIOD.as_secs(),
            dictionary_catalog: String::new(),
            subscriptions: String::new(),
            ipc_socket_path: "/tmp/gl-connect.sock".to_string(),
            health_port: 9090,
        }
    }
}

impl Config {
    /// Load from `gl-connect.toml` (optional) and `GL_*` environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("gl-connect").required(false))
            .add_source(config::Environment::with_prefix("GL").try_parsing(true))
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file only
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.market_data_port == 0 || self.order_entry_port == 0 {
            return Err(GlError::ConfigError("ports must be non-zero".to_string()));
        }
        for (name, address) in [
            ("market_data_address", self.market_data_address),
            ("order_entry_address", self.order_entry_address),
            ("calling_address", self.calling_address),
        ] {
            if address > MAX_HEADER_NUMBER {
                return Err(GlError::ConfigError(format!(
                    "{} {} exceeds header maximum {}",
                    name, address, MAX_HEADER_NUMBER
                )));
            }
        }
        if self.user_number.len() > crate::order::builder::USER_NUMBER_WIDTH {
            return Err(GlError::ConfigError(format!(
                "user number {} longer than {} characters",
                self.user_number,
                crate::order::builder::USER_NUMBER_WIDTH
            )));
        }
        Ok(())
    }

    fn session_settings(&self, host: &str, port: u16, called: u32) -> SessionSettings {
        let mut settings = SessionSettings::new(host, port, &self.username, &self.password)
            .with_routing(Routing::new(called, self.calling_address))
            .with_login_timeout(Duration::from_secs(self.login_timeout_secs));
        settings.request_timeout = Duration::from_secs(self.request_timeout_secs);
        settings
    }

    pub fn market_data_settings(&self) -> SessionSettings {
        self.session_settings(
            &self.market_data_host,
            self.market_data_port,
            self.market_data_address,
        )
    }

    pub fn order_entry_settings(&self) -> SessionSettings {
        self.session_settings(
            &self.order_entry_host,
            self.order_entry_port,
            self.order_entry_address,
        )
    }

    pub fn dictionary_delay(&self) -> Duration {
        Duration::from_millis(self.dictionary_delay_ms)
    }

    pub fn dictionary_quiet_period(&self) -> Duration {
        Duration::from_secs(self.dictionary_quiet_secs)
    }

    /// Parsed catalog; malformed entries are skipped
    pub fn dictionary_catalog(&self) -> Vec<(String, String)> {
        split_list(&self.dictionary_catalog)
            .filter_map(|entry| match entry.split_once(':') {
                Some((exchange, market)) if !exchange.is_empty() && !market.is_empty() => {
                    Some((exchange.trim().to_string(), market.trim().to_string()))
                }
                _ => {
                    warn!(entry = %entry, "Ignoring malformed dictionary catalog entry");
                    None
                }
            })
            .collect()
    }

    /// Instrument keys to subscribe at startup; malformed keys are skipped
    pub fn subscription_keys(&self) -> Vec<String> {
        split_list(&self.subscriptions)
            .filter(|key| {
                let valid = split_key(key).is_some();
                if !valid {
                    warn!(key = %key, "Ignoring malformed subscription key");
                }
                valid
            })
            .map(str::to_string)
            .collect()
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}
