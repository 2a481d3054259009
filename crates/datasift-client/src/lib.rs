//! DataSift streaming client
//!
//! Subscribes to DataSift streams over one persistent chunked HTTP
//! connection and publishes the decoded records as [`ClientEvent`]s.
//!
//! # Example
//!
//! ```rust,no_run
//! use datasift_client::{ClientEvent, DataSiftClient, StreamSet};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = DataSiftClient::new("username", "api-key")?;
//!     let mut events = client.events();
//!
//!     let streams = StreamSet::new()
//!         .with("0123456789abcdef0123456789abcdef", json!({"name": "mentions"}));
//!     for outcome in client.subscribe(streams).await? {
//!         if let Err(e) = outcome.result {
//!             eprintln!("{}: {e}", outcome.hash);
//!         }
//!     }
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ClientEvent::Interaction(record) => println!("{record}"),
//!             ClientEvent::Error(e) => eprintln!("error: {e}"),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module runs a local fake stream endpoint:
//!
//! ```rust,ignore
//! use datasift_client::testing::TestUpstream;
//!
//! let upstream = TestUpstream::start().await?;
//! let client = upstream.client()?;
//! client.start().await?;
//! let mut connection = upstream.next_connection().await.unwrap();
//! connection.send_line(r#"{"tick":1}"#);
//! ```

pub mod classify;
mod client;
pub mod config;
mod error;
mod events;
pub mod framing;
pub mod subscriptions;
pub mod testing;

pub use client::DataSiftClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::ClientEvent;
pub use framing::{DecodeError, LineDecoder};
pub use subscriptions::{is_valid_hash, StreamSet, StreamState, SubscribeOutcome, Subscription};

// Re-export transport types for convenience
pub use datasift_transport::{
    ConnectionState, ConnectionStatus, Connector, RecoverReason, TransportError,
};
