//! Mock connector for testing
//!
//! Every accepted connect attempt produces a [`MockSession`] that the test
//! drives by hand: push response chunks, fail or end the body, and read back
//! what the client wrote on the request body.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::connector::{ConnectRequest, Connector, Established};
use crate::TransportError;

/// Scripted result of one connect attempt
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Respond with this status and hand the session to the test
    Accept(u16),
    /// Fail the attempt
    Refuse(TransportError),
    /// Never complete (simulates a connect that hangs)
    Hang,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockOutcome>,
    attempts: Vec<Instant>,
}

/// Mock connector; unscripted attempts are accepted with 200
pub struct MockConnector {
    state: Mutex<MockState>,
    sessions: mpsc::UnboundedSender<MockSession>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockSessions) {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(MockState::default()),
            sessions: sessions_tx,
        });
        (connector, MockSessions(sessions_rx))
    }

    /// Queue the outcome of the next unscripted attempt
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Number of connect attempts so far
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// When each connect attempt reached the connector
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().attempts.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Established, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state.attempts.push(Instant::now());
            state.script.pop_front().unwrap_or(MockOutcome::Accept(200))
        };

        match outcome {
            MockOutcome::Accept(status) => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                tracing::debug!(status, "Mock connector: accepted");
                let _ = self.sessions.send(MockSession {
                    status,
                    inbound: inbound_tx,
                    outbound: request.outbound,
                });
                Ok(Established {
                    status,
                    body: UnboundedReceiverStream::new(inbound_rx).boxed(),
                })
            }
            MockOutcome::Refuse(err) => Err(err),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}

/// Sessions accepted by a [`MockConnector`], in connect order
pub struct MockSessions(mpsc::UnboundedReceiver<MockSession>);

impl MockSessions {
    /// Wait for the next accepted connection
    pub async fn next(&mut self) -> Option<MockSession> {
        self.0.recv().await
    }

    /// Take an already accepted connection, if any
    pub fn try_next(&mut self) -> Option<MockSession> {
        self.0.try_recv().ok()
    }
}

/// Server side of one mock connection
///
/// Dropping the session ends the response body, which the transport sees as
/// a server end.
pub struct MockSession {
    pub status: u16,
    inbound: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl MockSession {
    /// Push a raw response chunk; false once the client dropped the link
    pub fn send(&self, chunk: impl Into<Bytes>) -> bool {
        self.inbound.send(Ok(chunk.into())).is_ok()
    }

    /// Push one newline-terminated record
    pub fn send_line(&self, line: &str) -> bool {
        self.send(format!("{line}\n"))
    }

    /// Fail the response body mid-stream
    pub fn fail(&self, error: TransportError) -> bool {
        self.inbound.send(Err(error)).is_ok()
    }

    /// End the response body
    pub fn close(self) {}

    /// Next raw write on the request body; `None` once the body is closed
    pub async fn next_write(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Next non-blank line the client wrote, trimmed
    pub async fn next_command(&mut self) -> Option<String> {
        while let Some(write) = self.outbound.recv().await {
            if let Some(command) = non_blank(&write) {
                return Some(command);
            }
        }
        None
    }

    /// Every non-blank line written so far, without waiting
    pub fn drain_commands(&mut self) -> Vec<String> {
        let mut commands = Vec::new();
        while let Ok(write) = self.outbound.try_recv() {
            commands.extend(non_blank(&write));
        }
        commands
    }
}

fn non_blank(write: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(write);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
