//! Market-data and order-entry sessions
//!
//! Both sessions sit on a [`Connection`], which owns the transport, the login
//! handshake and the receive loop, and differ only in how they handle the
//! frames it dispatches.

mod connection;
mod events;
mod market_data;
mod order_entry;

pub use connection::{Connection, FrameHandler};
pub use events::{EventHub, ListenerId, MarketEvent, OrderEvent};
pub use market_data::{
    MarketDataSession, DEFAULT_DICTIONARY_DELAY, DEFAULT_DICTIONARY_QUIET_PERIOD,
};
pub use order_entry::OrderEntrySession;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Routing;

pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle.
///
/// `Disconnected -> Connecting -> LoggingIn -> Ready`, and back to
/// `Disconnected` from any state on error or close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    LoggingIn,
    Ready,
}

/// Everything needed to open and log in one session
#[derive(Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub routing: Routing,
    pub username: String,
    pub password: String,
    pub client_version: String,
    pub login_timeout: Duration,
    pub request_timeout: Duration,
}

impl SessionSettings {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            routing: Routing::default(),
            username: username.to_string(),
            password: password.to_string(),
            client_version: concat!("gl-connect/", env!("CARGO_PKG_VERSION")).to_string(),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("routing", &self.routing)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_version", &self.client_version)
            .field("login_timeout", &self.login_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
