//! Events published to client listeners

use serde_json::Value;

use crate::error::ClientError;

/// Everything the client reports while running
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A link to the stream is up
    Connect,
    /// The connection was stopped
    Disconnect,
    Error(ClientError),
    /// Server status message with `"status":"success"`
    Success { message: String, raw: Value },
    /// Server warning, or a record that could not be decoded (`raw` is `None`)
    Warning { message: String, raw: Option<Value> },
    Interaction(Value),
    Delete(Value),
    Tick(Value),
    UnknownEvent(Value),
    /// Diagnostic text about connection and subscription housekeeping
    Debug(String),
}

impl ClientEvent {
    /// Short lowercase name, as used by listeners keyed on event type
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error(_) => "error",
            Self::Success { .. } => "success",
            Self::Warning { .. } => "warning",
            Self::Interaction(_) => "interaction",
            Self::Delete(_) => "delete",
            Self::Tick(_) => "tick",
            Self::UnknownEvent(_) => "unknownEvent",
            Self::Debug(_) => "debug",
        }
    }

    /// Raw record carried by the event, if any
    pub fn record(&self) -> Option<&Value> {
        match self {
            Self::Success { raw, .. } => Some(raw),
            Self::Warning { raw, .. } => raw.as_ref(),
            Self::Interaction(v) | Self::Delete(v) | Self::Tick(v) | Self::UnknownEvent(v) => Some(v),
            _ => None,
        }
    }
}
