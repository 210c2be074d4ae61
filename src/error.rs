//! Error types for the exchange connectivity client

use thiserror::Error;

/// Errors surfaced by the protocol engine and its sessions
#[derive(Error, Debug)]
pub enum GlError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Field too long: {len} bytes exceeds the single-byte length encoding")]
    FieldTooLong { len: usize },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Order replies must be subscribed before submitting orders")]
    RepliesNotSubscribed,

    #[error("Order {0} has no exchange number yet")]
    MissingExchangeNumber(String),

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid instrument key: {0}")]
    InvalidInstrumentKey(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl GlError {
    /// True for caller mistakes rejected before any bytes reach the wire
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            GlError::RepliesNotSubscribed
                | GlError::MissingExchangeNumber(_)
                | GlError::UnknownOrder(_)
                | GlError::InvalidOrder(_)
                | GlError::InvalidInstrumentKey(_)
                | GlError::FieldTooLong { .. }
        )
    }

    /// True when the session that produced this error is gone
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GlError::Transport(_) | GlError::NotConnected | GlError::ConnectionTimeout
        )
    }
}

impl From<std::io::Error> for GlError {
    fn from(err: std::io::Error) -> Self {
        GlError::Transport(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for GlError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        GlError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for GlError {
    fn from(err: config::ConfigError) -> Self {
        GlError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GlError>;
