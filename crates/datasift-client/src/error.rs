//! Error types for DataSift client operations

use datasift_transport::TransportError;
use thiserror::Error;

/// Result type alias for DataSift client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur during DataSift client operations
///
/// Cloneable so the same error can reach every waiter of a shared
/// subscription and travel inside [`ClientEvent::Error`](crate::ClientEvent).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Missing or unusable construction parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stream hash is not 32 hex characters
    #[error("Invalid stream hash: {0:?}")]
    InvalidIdentifier(String),

    /// Server refused a specific stream hash
    #[error("Subscription to {hash} rejected: {message}")]
    SubscriptionRejected { hash: String, message: String },

    /// Connection-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Server reported a failure status
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Recycling a stalled connection failed
    #[error("Failed to reconnect: {0}")]
    ReconnectFailed(TransportError),

    /// Subscribe was called with no hashes
    #[error("At least one stream hash is required")]
    NoStreams,

    /// Unsubscribed before the subscription was confirmed
    #[error("Unsubscribed from {0} before the subscription was confirmed")]
    Unsubscribed(String),

    /// The client was stopped while the request was pending
    #[error("Client stopped")]
    Stopped,

    /// The client task is gone
    #[error("Client is no longer running")]
    Closed,
}
