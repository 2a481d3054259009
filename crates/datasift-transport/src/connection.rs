//! Persistent connection state machine
//!
//! A [`PersistentConnection`] is a cheap, clonable handle onto a single driver
//! task. The driver owns the live request and is the only place connection
//! state changes, so start/stop/recover/timeouts never interleave.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connector::{ByteStream, ConnectRequest, Connector, Established};
use crate::TransportError;

const BACKOFF_BASE_MS: u64 = 10_000;
const BACKOFF_MAX_MS: u64 = 320_000;

/// Delay before the given connect attempt (1-based).
///
/// The first attempt goes out immediately, then 10s, 20s, 40s, ... capped at
/// 320s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    if attempt < 2 {
        return Duration::ZERO;
    }
    let ms = 2u64
        .checked_pow(attempt - 2)
        .and_then(|factor| factor.checked_mul(BACKOFF_BASE_MS))
        .map_or(BACKOFF_MAX_MS, |ms| ms.min(BACKOFF_MAX_MS));
    Duration::from_millis(ms)
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why a link is being re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverReason {
    /// The server finished the response body
    ServerEnd,
    /// No inbound bytes for the socket timeout
    SocketTimeout,
    /// The response body failed mid-stream
    TransportError,
    /// The upstream reported a failure status record
    UpstreamFailure,
    /// Forced stop + reconnect of a stalled link
    Recycle,
    /// Caller asked for it
    Manual,
}

impl fmt::Display for RecoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ServerEnd => "server end",
            Self::SocketTimeout => "socket timeout",
            Self::TransportError => "transport error",
            Self::UpstreamFailure => "upstream failure",
            Self::Recycle => "recycle",
            Self::Manual => "manual recover",
        };
        f.write_str(text)
    }
}

/// Snapshot of the connection, published on every transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Connect attempts since the last successful connect
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Status of the most recent response
    pub last_status: Option<u16>,
}

/// Events emitted by the driver, in the order they happen
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// First link after `start()`
    Connected { status: u16 },
    /// A chunk of the response body
    Data { chunk: Bytes, status: Option<u16> },
    /// The response body ended (server end, error, timeout or drained stop)
    End { status: Option<u16> },
    /// A link came back after loss or `recover()`
    Recovered { reason: RecoverReason },
    /// Connection-level failure; fatal errors are followed by `Stopped`
    Error(TransportError),
    /// Transitioned to disconnected and will not reconnect on its own
    Stopped,
}

type Waiter = oneshot::Sender<Result<(), TransportError>>;

enum Command {
    Start(Waiter),
    Stop(oneshot::Sender<()>),
    Write(Bytes),
    Recover(RecoverReason, Waiter),
}

/// Handle to a persistent chunked HTTP connection
#[derive(Debug, Clone)]
pub struct PersistentConnection {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(_) => f.write_str("Start"),
            Self::Stop(_) => f.write_str("Stop"),
            Self::Write(payload) => write!(f, "Write({} bytes)", payload.len()),
            Self::Recover(reason, _) => write!(f, "Recover({reason})"),
        }
    }
}

impl PersistentConnection {
    /// Spawn the driver task. Must be called inside a tokio runtime.
    ///
    /// The driver exits once every handle has been dropped.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let driver = Driver {
            connector,
            config,
            commands: command_rx,
            events: event_tx,
            status_tx,
            status: ConnectionStatus::default(),
            recovering: None,
            connecting: None,
            pending_writer: None,
            writer: None,
            inbound: None,
            idle_deadline: Instant::now(),
            draining: None,
            drain_deadline: Instant::now(),
            start_waiters: Vec::new(),
            recover_waiters: Vec::new(),
        };
        tokio::spawn(driver.run());

        (
            Self {
                commands: command_tx,
                status: status_rx,
            },
            event_rx,
        )
    }

    /// Connect if not already connected; resolves once a link is up.
    pub async fn start(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Close the request body and stop reconnecting.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx))?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    /// Queue bytes on the live request body, or on the attempt in flight
    pub fn write(&self, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(Command::Write(payload.into()))
    }

    /// Drop the current link (if any) and connect again.
    pub async fn recover(&self, reason: RecoverReason) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Recover(reason, tx))?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

enum ChunkOutcome {
    Data(Bytes),
    Ended,
    Failed(TransportError),
    TimedOut,
}

struct Driver {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    status: ConnectionStatus,
    /// Set while re-establishing a lost or recycled link
    recovering: Option<RecoverReason>,
    connecting: Option<BoxFuture<'static, Result<Established, TransportError>>>,
    /// Request body of the in-flight connect attempt
    pending_writer: Option<mpsc::UnboundedSender<Bytes>>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    inbound: Option<ByteStream>,
    idle_deadline: Instant,
    /// Response body of a stopped link, read until it ends or the grace expires
    draining: Option<ByteStream>,
    drain_deadline: Instant,
    start_waiters: Vec<Waiter>,
    recover_waiters: Vec<Waiter>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                result = poll_slot(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }
                chunk = next_chunk(&mut self.inbound, self.idle_deadline) => self.on_inbound(chunk),
                chunk = next_chunk(&mut self.draining, self.drain_deadline) => self.on_drain(chunk),
            }
        }
        debug!("Transport driver exiting");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.start(reply),
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Write(payload) => self.write(payload),
            Command::Recover(reason, reply) => self.recover(reason, reply),
        }
    }

    fn start(&mut self, reply: Waiter) {
        match self.status.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.start_waiters.push(reply),
            ConnectionState::Disconnected => {
                self.start_waiters.push(reply);
                self.begin_connect();
            }
        }
    }

    fn stop(&mut self) {
        self.connecting = None;
        self.pending_writer = None;
        self.recovering = None;
        // Closing the request body ends the conversation; the server's last
        // words are still read from the drain.
        self.writer = None;
        if let Some(inbound) = self.inbound.take() {
            self.draining = Some(inbound);
            self.drain_deadline = Instant::now() + self.config.stop_grace;
        }

        settle(&mut self.start_waiters, Err(TransportError::Stopped));
        settle(&mut self.recover_waiters, Err(TransportError::Stopped));

        if self.status.state != ConnectionState::Disconnected {
            info!("Stream transport stopped");
            self.set_state(ConnectionState::Disconnected);
            self.emit(TransportEvent::Stopped);
        }
    }

    /// Writes go on the live request body, or on the body of the attempt in
    /// flight while connecting.
    fn write(&mut self, payload: Bytes) {
        let Some(writer) = self.writer.as_ref().or(self.pending_writer.as_ref()) else {
            debug!(len = payload.len(), "No link, dropping write");
            return;
        };
        if let Err(mpsc::error::SendError(payload)) = writer.send(payload) {
            debug!(len = payload.len(), "Request body closed, dropping write");
        }
    }

    fn recover(&mut self, reason: RecoverReason, reply: Waiter) {
        self.recover_waiters.push(reply);

        // Already re-establishing: ride along instead of starting over.
        if self.connecting.is_some() {
            debug!(%reason, "Recover requested while connecting");
            self.recovering.get_or_insert(reason);
            return;
        }

        info!(%reason, "Recovering stream transport");
        let was_live = self.writer.is_some() || self.inbound.is_some();
        self.teardown();
        if was_live {
            self.emit(TransportEvent::End {
                status: self.status.last_status,
            });
        }
        self.recovering = Some(reason);
        self.begin_connect();
    }

    fn begin_connect(&mut self) {
        // One live request per connection: a new attempt ends any drain.
        self.draining = None;

        self.status.reconnect_attempts = self.status.reconnect_attempts.saturating_add(1);
        let attempt = self.status.reconnect_attempts;
        let delay = reconnect_delay(attempt);
        self.set_state(ConnectionState::Connecting);

        let (writer, outbound) = mpsc::unbounded_channel();
        if let Some(greeting) = &self.config.greeting {
            let _ = writer.send(greeting.clone());
        }
        self.pending_writer = Some(writer);

        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Connecting stream transport"
        );

        let connector = Arc::clone(&self.connector);
        self.connecting = Some(Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            connector.connect(ConnectRequest { outbound }).await
        }));
    }

    fn on_connect_result(&mut self, result: Result<Established, TransportError>) {
        let established = match result {
            Ok(established) => established,
            Err(e) => {
                self.on_connect_failed(e);
                return;
            }
        };

        let status = established.status;
        self.status.last_status = Some(status);

        if !(200..300).contains(&status) {
            let err = TransportError::from_status(status, self.config.halt_on_fatal_status);
            if err.is_fatal() {
                self.halt(err);
            } else {
                self.on_connect_failed(err);
            }
            return;
        }

        self.writer = self.pending_writer.take();
        self.inbound = Some(established.body);
        self.idle_deadline = Instant::now() + self.config.socket_timeout;

        self.status.reconnect_attempts = 0;
        self.status.last_connected_at = Some(Utc::now());
        self.set_state(ConnectionState::Connected);

        match self.recovering.take() {
            Some(reason) => {
                info!(%reason, status, "Stream transport recovered");
                self.emit(TransportEvent::Recovered { reason });
                settle(&mut self.recover_waiters, Ok(()));
            }
            None => {
                info!(status, "Stream transport connected");
                self.emit(TransportEvent::Connected { status });
            }
        }
        settle(&mut self.start_waiters, Ok(()));
    }

    fn on_connect_failed(&mut self, err: TransportError) {
        warn!(
            attempt = self.status.reconnect_attempts,
            error = %err,
            "Connect attempt failed"
        );
        self.pending_writer = None;
        self.emit(TransportEvent::Error(err));
        self.begin_connect();
    }

    /// Fatal response: disconnect and stay down.
    fn halt(&mut self, err: TransportError) {
        warn!(error = %err, "Fatal response, not reconnecting");
        self.teardown();
        self.recovering = None;
        settle(&mut self.start_waiters, Err(err.clone()));
        settle(&mut self.recover_waiters, Err(err.clone()));
        self.set_state(ConnectionState::Disconnected);
        self.emit(TransportEvent::Error(err));
        self.emit(TransportEvent::Stopped);
    }

    fn on_inbound(&mut self, chunk: ChunkOutcome) {
        match chunk {
            ChunkOutcome::Data(chunk) => {
                self.idle_deadline = Instant::now() + self.config.socket_timeout;
                self.emit(TransportEvent::Data {
                    chunk,
                    status: self.status.last_status,
                });
            }
            ChunkOutcome::Ended => self.lose_link(RecoverReason::ServerEnd, None),
            ChunkOutcome::Failed(e) => self.lose_link(RecoverReason::TransportError, Some(e)),
            ChunkOutcome::TimedOut => {
                let err = TransportError::Timeout(format!(
                    "no data for {}ms",
                    self.config.socket_timeout.as_millis()
                ));
                self.lose_link(RecoverReason::SocketTimeout, Some(err));
            }
        }
    }

    fn lose_link(&mut self, reason: RecoverReason, error: Option<TransportError>) {
        info!(%reason, "Stream link lost, reconnecting");
        self.inbound = None;
        self.writer = None;
        self.emit(TransportEvent::End {
            status: self.status.last_status,
        });
        if let Some(e) = error {
            self.emit(TransportEvent::Error(e));
        }
        self.recovering = Some(reason);
        self.begin_connect();
    }

    fn on_drain(&mut self, chunk: ChunkOutcome) {
        match chunk {
            ChunkOutcome::Data(chunk) => self.emit(TransportEvent::Data {
                chunk,
                status: self.status.last_status,
            }),
            ChunkOutcome::Ended => self.finish_drain(),
            ChunkOutcome::Failed(e) => {
                debug!(error = %e, "Drain ended with error");
                self.finish_drain();
            }
            ChunkOutcome::TimedOut => {
                debug!("Stop grace expired, dropping response");
                self.finish_drain();
            }
        }
    }

    fn finish_drain(&mut self) {
        self.draining = None;
        self.emit(TransportEvent::End {
            status: self.status.last_status,
        });
    }

    fn teardown(&mut self) {
        self.connecting = None;
        self.pending_writer = None;
        self.writer = None;
        self.inbound = None;
        self.draining = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.status.state = state;
        self.status_tx.send_replace(self.status.clone());
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

fn settle(waiters: &mut Vec<Waiter>, result: Result<(), TransportError>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(result.clone());
    }
}

async fn poll_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(stream: &mut Option<ByteStream>, deadline: Instant) -> ChunkOutcome {
    let Some(stream) = stream.as_mut() else {
        return std::future::pending().await;
    };
    match tokio::time::timeout_at(deadline, stream.next()).await {
        Ok(Some(Ok(chunk))) => ChunkOutcome::Data(chunk),
        Ok(Some(Err(e))) => ChunkOutcome::Failed(e),
        Ok(None) => ChunkOutcome::Ended,
        Err(_) => ChunkOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_sequence() {
        let delays: Vec<u64> = (1..=9)
            .map(|attempt| reconnect_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![0, 10_000, 20_000, 40_000, 80_000, 160_000, 320_000, 320_000, 320_000]
        );
    }

    #[test]
    fn test_reconnect_delay_never_overflows() {
        assert_eq!(reconnect_delay(0), Duration::ZERO);
        assert_eq!(reconnect_delay(70), Duration::from_millis(BACKOFF_MAX_MS));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_millis(BACKOFF_MAX_MS));
    }

    #[test]
    fn test_recover_reason_text() {
        assert_eq!(RecoverReason::ServerEnd.to_string(), "server end");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
