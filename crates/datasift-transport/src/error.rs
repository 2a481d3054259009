//! Transport layer errors

use thiserror::Error;

/// HTTP 401: the username/API key pair was refused.
pub const STATUS_INVALID_CREDENTIALS: u16 = 401;
/// HTTP 404: the stream endpoint does not know the requested hash.
pub const STATUS_INVALID_STREAM: u16 = 404;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Fatal HTTP status {status}: {reason}")]
    Fatal { status: u16, reason: String },

    #[error("Transport stopped")]
    Stopped,
}

impl TransportError {
    /// Build the error for a non-success response status.
    ///
    /// 401 and 404 are fatal when `halt_on_fatal` is set: the endpoint will
    /// keep refusing us, so reconnecting is pointless.
    pub fn from_status(status: u16, halt_on_fatal: bool) -> Self {
        match status {
            STATUS_INVALID_CREDENTIALS if halt_on_fatal => Self::Fatal {
                status,
                reason: "invalid credentials".to_string(),
            },
            STATUS_INVALID_STREAM if halt_on_fatal => Self::Fatal {
                status,
                reason: "invalid stream identifier".to_string(),
            },
            _ => Self::Status(status),
        }
    }

    /// Whether this error ends the connection for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::ConnectionFailed(err.to_string())
        } else if err.is_builder() {
            Self::InvalidConfig(err.to_string())
        } else {
            Self::ReceiveFailed(err.to_string())
        }
    }
}
