//! Connector trait and the reqwest-backed HTTP implementation

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use url::Url;

use crate::config::TransportConfig;
use crate::TransportError;

/// Response body of an established connection
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Everything a connector needs to open one upstream request
pub struct ConnectRequest {
    /// Request body: every payload written while this link is up, in order.
    /// The body ends when the sender side is dropped.
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

/// A request whose response headers have arrived
pub struct Established {
    /// HTTP status of the response
    pub status: u16,
    /// Chunked response body
    pub body: ByteStream,
}

/// Opens the single long-lived request the transport multiplexes over.
///
/// The transport driver calls this once per connect attempt, after any
/// back-off delay. Implementations must return as soon as response headers
/// are available and must not buffer the body.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, TransportError>;
}

/// Chunked HTTP connector built on reqwest
///
/// Sends a streaming POST whose body is fed from the transport's write queue
/// and hands back the streaming response body.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
}

impl HttpConnector {
    pub fn new(
        endpoint: Url,
        headers: HeaderMap,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        // No overall request timeout: the request lives as long as the stream.
        // Idle detection is the driver's socket timeout.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            headers,
        })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        Self::new(
            config.endpoint.clone(),
            config.headers.clone(),
            config.connect_timeout,
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, TransportError> {
        debug!(endpoint = %self.endpoint, "Opening chunked stream request");

        let outbound =
            UnboundedReceiverStream::new(request.outbound).map(Ok::<Bytes, std::io::Error>);

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .body(reqwest::Body::wrap_stream(outbound))
            .send()
            .await?;

        let status = response.status().as_u16();
        debug!(status, "Stream response headers received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::ReceiveFailed(e.to_string())))
            .boxed();

        Ok(Established { status, body })
    }
}
