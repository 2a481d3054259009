//! Persistent transport for the DataSift stream
//!
//! Keeps one long-lived chunked HTTP request open against the stream
//! endpoint: writes go out on the request body, the response body comes back
//! as [`TransportEvent::Data`] chunks. Lost links are re-established with
//! exponential back-off; 401/404 responses stop the connection for good.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use datasift_transport::{HttpConnector, PersistentConnection, TransportConfig, TransportEvent};
//!
//! # async fn example() -> Result<(), datasift_transport::TransportError> {
//! let config = TransportConfig::parse("http://stream.datasift.com:80/")?
//!     .with_header("Authorization", "user:key")?;
//! let connector = Arc::new(HttpConnector::from_config(&config)?);
//! let (connection, mut events) = PersistentConnection::spawn(connector, config);
//!
//! connection.start().await?;
//! connection.write("{\"action\":\"subscribe\",\"hash\":\"...\"}\n")?;
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::Data { chunk, .. } = event {
//!         println!("{} bytes", chunk.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
mod connector;
pub mod error;
pub mod mock;

pub use config::TransportConfig;
pub use connection::{
    reconnect_delay, ConnectionState, ConnectionStatus, PersistentConnection, RecoverReason,
    TransportEvent,
};
pub use connector::{ByteStream, ConnectRequest, Connector, Established, HttpConnector};
pub use error::TransportError;
