//! Test utilities for datasift-client
//!
//! [`TestUpstream`] is a local stand-in for the stream endpoint. Every POST
//! it receives becomes an [`UpstreamConnection`] the test drives by hand:
//! push response lines, read back the commands the client wrote.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::framing::LineDecoder;
use crate::{ClientConfig, ClientError, DataSiftClient, Result};

#[derive(Clone)]
struct UpstreamState {
    statuses: Arc<Mutex<VecDeque<StatusCode>>>,
    connections: mpsc::UnboundedSender<UpstreamConnection>,
}

/// A fake stream endpoint that shuts down when dropped
pub struct TestUpstream {
    pub addr: SocketAddr,
    statuses: Arc<Mutex<VecDeque<StatusCode>>>,
    connections: mpsc::UnboundedReceiver<UpstreamConnection>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestUpstream {
    /// Bind to an ephemeral port and start serving
    ///
    /// # Example
    ///
    /// ```ignore
    /// use datasift_client::testing::TestUpstream;
    ///
    /// let mut upstream = TestUpstream::start().await?;
    /// let client = upstream.client()?;
    /// client.start().await?;
    ///
    /// let mut connection = upstream.next_connection().await.unwrap();
    /// assert_eq!(connection.header("authorization"), Some("testuser:testkey"));
    /// ```
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ClientError::Configuration(format!("bind test upstream: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ClientError::Configuration(format!("test upstream address: {e}")))?;

        let statuses = Arc::new(Mutex::new(VecDeque::new()));
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        let state = UpstreamState {
            statuses: statuses.clone(),
            connections: connections_tx,
        };
        let router = Router::new()
            .route("/", post(stream_handler))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            statuses,
            connections: connections_rx,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Client settings pointing at this upstream
    pub fn config(&self, username: &str, api_key: &str) -> ClientConfig {
        ClientConfig::new(username, api_key)
            .with_host("127.0.0.1")
            .with_port(self.addr.port())
    }

    /// A client with credentials `testuser:testkey`
    pub fn client(&self) -> Result<DataSiftClient> {
        DataSiftClient::with_config(self.config("testuser", "testkey"))
    }

    /// Answer the next connection with `status` instead of 200
    pub async fn respond_with(&self, status: StatusCode) {
        self.statuses.lock().await.push_back(status);
    }

    /// Wait for the next connection, up to five seconds
    pub async fn next_connection(&mut self) -> Option<UpstreamConnection> {
        tokio::time::timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .ok()
            .flatten()
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn stream_handler(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let status = state
        .statuses
        .lock()
        .await
        .pop_front()
        .unwrap_or(StatusCode::OK);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut body = body.into_data_stream();
        while let Some(Ok(chunk)) = body.next().await {
            if command_tx.send(chunk).is_err() {
                break;
            }
        }
    });

    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<Bytes>();
    let _ = state.connections.send(UpstreamConnection {
        status,
        headers,
        outbound: chunk_tx,
        commands: command_rx,
        decoder: LineDecoder::new(),
        decoded: VecDeque::new(),
    });

    let mut response = Response::new(Body::from_stream(
        UnboundedReceiverStream::new(chunk_rx).map(Ok::<_, Infallible>),
    ));
    *response.status_mut() = status;
    response
}

/// Server side of one request to a [`TestUpstream`]
///
/// Dropping it ends the response body.
pub struct UpstreamConnection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    outbound: mpsc::UnboundedSender<Bytes>,
    commands: mpsc::UnboundedReceiver<Bytes>,
    decoder: LineDecoder,
    decoded: VecDeque<Value>,
}

impl UpstreamConnection {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Push a raw response chunk; false once the client hung up
    pub fn send(&self, chunk: impl Into<Bytes>) -> bool {
        self.outbound.send(chunk.into()).is_ok()
    }

    /// Push one newline-terminated record
    pub fn send_line(&self, line: &str) -> bool {
        self.send(format!("{line}\n"))
    }

    /// End the response body
    pub fn close(self) {}

    /// Next JSON command from the request body, up to five seconds
    pub async fn next_command(&mut self) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(command) = self.decoded.pop_front() {
                return Some(command);
            }
            let chunk = tokio::time::timeout_at(deadline, self.commands.recv())
                .await
                .ok()
                .flatten()?;
            self.decoded
                .extend(self.decoder.feed(&chunk).into_iter().filter_map(|r| r.ok()));
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_points_at_upstream() {
        let upstream = TestUpstream::start().await.unwrap();
        let config = upstream.config("u", "k");
        assert_eq!(config.endpoint(), format!("http://{}/", upstream.addr));
        assert_eq!(config.host_header(), format!("127.0.0.1:{}", upstream.addr.port()));
        upstream.shutdown().await;
    }
}
