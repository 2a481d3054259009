//! DataSift stream client
//!
//! [`DataSiftClient`] is a cheap, clonable handle. One task owns the
//! subscription table, the line decoder and the interaction watchdog, and
//! handles caller commands and transport events one at a time.

use std::pin::Pin;
use std::sync::Arc;

use datasift_transport::{
    ConnectionState, ConnectionStatus, Connector, HttpConnector, PersistentConnection,
    RecoverReason, TransportConfig, TransportError, TransportEvent,
};
use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::classify::{classify, rejected_hash, RecordKind, STOP_ACKNOWLEDGED};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::framing::{DecodeError, LineDecoder};
use crate::subscriptions::{
    is_valid_hash, StreamSet, StreamState, StreamTable, SubscribeOutcome, Subscription,
};

/// Buffered events per listener before it starts lagging
const EVENT_CAPACITY: usize = 1024;

type Reply = oneshot::Sender<Result<()>>;
type PendingOutcomes = Vec<(String, oneshot::Receiver<Result<Subscription>>)>;

enum Command {
    Subscribe {
        streams: StreamSet,
        reply: oneshot::Sender<PendingOutcomes>,
    },
    Unsubscribe {
        hash: String,
        reply: oneshot::Sender<()>,
    },
    Start(Reply),
    Stop(Reply),
    Shutdown(Reply),
    Recycle(Reply),
    Tracked(oneshot::Sender<Vec<Subscription>>),
}

/// Client for the DataSift stream
///
/// # Example
///
/// ```no_run
/// use datasift_client::{ClientEvent, DataSiftClient};
///
/// # async fn example() -> datasift_client::Result<()> {
/// let client = DataSiftClient::new("username", "api-key")?;
/// let mut events = client.events();
///
/// for outcome in client.subscribe("0123456789abcdef0123456789abcdef").await? {
///     println!("{}: {:?}", outcome.hash, outcome.result);
/// }
///
/// while let Ok(event) = events.recv().await {
///     if let ClientEvent::Interaction(record) = event {
///         println!("{record}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DataSiftClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    transport: PersistentConnection,
    username: String,
}

impl DataSiftClient {
    /// Create a client against the default stream host
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(username: &str, api_key: &str) -> Result<Self> {
        Self::with_config(ClientConfig::new(username, api_key))
    }

    /// Create a client talking HTTP to the configured host
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let transport_config = config.transport_config()?;
        let connector = HttpConnector::from_config(&transport_config)?;
        Ok(Self::spawn(config, transport_config, Arc::new(connector)))
    }

    /// Create a client over a custom connector
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let transport_config = config.transport_config()?;
        Ok(Self::spawn(config, transport_config, connector))
    }

    fn spawn(
        config: ClientConfig,
        transport_config: TransportConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (transport, transport_events) = PersistentConnection::spawn(connector, transport_config);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            config: config.clone(),
            commands: command_rx,
            transport_events,
            transport: transport.clone(),
            events: events.clone(),
            decoder: LineDecoder::new(),
            streams: StreamTable::default(),
            online: false,
            halted: false,
            starting: false,
            recycling: false,
            watchdog: None,
            acks: FuturesUnordered::new(),
            ops: FuturesUnordered::new(),
            start_waiters: Vec::new(),
            recycle_waiters: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            events,
            transport,
            username: config.username,
        }
    }

    /// Listen to client events
    ///
    /// Only events published after this call are received.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Make `streams` the complete set of subscriptions
    ///
    /// Tracked hashes missing from the set are unsubscribed. Resolves once
    /// every requested hash is confirmed or rejected, one outcome per hash.
    /// Connects first if needed.
    pub async fn subscribe(&self, streams: impl Into<StreamSet>) -> Result<Vec<SubscribeOutcome>> {
        let streams = streams.into();
        if streams.is_empty() {
            return Err(ClientError::NoStreams);
        }

        let pending = self
            .request(|reply| Command::Subscribe { streams, reply })
            .await?;

        Ok(join_all(pending.into_iter().map(|(hash, waiter)| async move {
            let result = waiter.await.unwrap_or(Err(ClientError::Closed));
            SubscribeOutcome { hash, result }
        }))
        .await)
    }

    /// Stop tracking `hash` and tell the server
    pub async fn unsubscribe(&self, hash: &str) -> Result<()> {
        let hash = hash.to_string();
        self.request(|reply| Command::Unsubscribe { hash, reply })
            .await
    }

    /// Connect; resolves once a link is up
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    /// Unsubscribe everything on the wire and disconnect, keeping the tracked set
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await?
    }

    /// Like [`stop`](Self::stop), and forget every tracked stream
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await?
    }

    /// Tear the connection down and bring it back with every stream resubscribed
    pub async fn recycle(&self) -> Result<()> {
        self.request(Command::Recycle).await?
    }

    /// Every tracked stream
    pub async fn tracked_streams(&self) -> Result<Vec<Subscription>> {
        self.request(Command::Tracked).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }
}

/// Completion of a transport call made on the task's behalf
enum Op {
    Started(std::result::Result<(), TransportError>),
    Stopped(Option<Reply>, std::result::Result<(), TransportError>),
    Recovered(RecoverReason, std::result::Result<(), TransportError>),
    Recycled(std::result::Result<(), TransportError>),
}

struct Actor {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport: PersistentConnection,
    events: broadcast::Sender<ClientEvent>,
    decoder: LineDecoder,
    streams: StreamTable,
    /// A link is up and subscribe commands reach the server
    online: bool,
    /// Stopped by the caller or the server; links that come up are closed again
    halted: bool,
    starting: bool,
    recycling: bool,
    /// Fires after the interaction timeout without interactions
    watchdog: Option<Pin<Box<Sleep>>>,
    /// Confirmation windows, yielding (hash, generation)
    acks: FuturesUnordered<BoxFuture<'static, (String, u64)>>,
    ops: FuturesUnordered<BoxFuture<'static, Op>>,
    start_waiters: Vec<Reply>,
    recycle_waiters: Vec<Reply>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.transport_events.recv() => self.on_transport_event(event),
                Some((hash, generation)) = self.acks.next(), if !self.acks.is_empty() => {
                    self.on_ack_window(&hash, generation);
                }
                Some(op) = self.ops.next(), if !self.ops.is_empty() => self.on_op(op),
                () = watchdog(&mut self.watchdog) => {
                    self.watchdog = None;
                    self.on_watchdog();
                }
            }
        }
        debug!("Client task exiting");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { streams, reply } => {
                let pending = self.subscribe(streams);
                let _ = reply.send(pending);
            }
            Command::Unsubscribe { hash, reply } => {
                self.unsubscribe(&hash);
                let _ = reply.send(());
            }
            Command::Start(reply) => self.ensure_started(Some(reply)),
            Command::Stop(reply) => self.halt(false, Some(reply)),
            Command::Shutdown(reply) => self.halt(true, Some(reply)),
            Command::Recycle(reply) => {
                if self.halted {
                    let _ = reply.send(Err(ClientError::Stopped));
                } else {
                    self.begin_recycle(Some(reply));
                }
            }
            Command::Tracked(reply) => {
                let _ = reply.send(self.streams.snapshot());
            }
        }
    }

    fn subscribe(&mut self, streams: StreamSet) -> PendingOutcomes {
        for hash in self.streams.difference(&streams) {
            self.unsubscribe(&hash);
        }

        let mut pending = Vec::with_capacity(streams.len());
        for (hash, metadata) in streams {
            let (tx, rx) = oneshot::channel();
            pending.push((hash.clone(), rx));

            if !is_valid_hash(&hash) {
                let _ = tx.send(Err(ClientError::InvalidIdentifier(hash)));
                continue;
            }

            if let Some(entry) = self.streams.get_mut(&hash) {
                entry.attach(tx);
                if !self.online {
                    self.ensure_started(None);
                }
                continue;
            }

            self.streams.insert(hash.clone(), metadata).attach(tx);
            if self.online {
                self.send_subscribe(&hash);
            } else {
                self.ensure_started(None);
            }
        }
        pending
    }

    fn unsubscribe(&mut self, hash: &str) {
        if self.online {
            self.write_command(json!({"action": "unsubscribe", "hash": hash}));
        }
        if let Some(mut entry) = self.streams.remove(hash) {
            debug!(hash, "Unsubscribed");
            entry.reject_waiters(&ClientError::Unsubscribed(hash.to_string()));
        }
    }

    /// Write the subscribe for `hash` on the current link, opening its
    /// confirmation window unless one is already running
    fn send_subscribe(&mut self, hash: &str) {
        let Some(entry) = self.streams.get_mut(hash) else {
            return;
        };
        entry.sent = true;
        let arm = entry.state == StreamState::Pending && !entry.ack_armed;
        entry.ack_armed |= arm;
        let generation = entry.generation;

        self.write_command(json!({"action": "subscribe", "hash": hash}));

        if arm {
            let wait = self.config.subscribe_wait();
            let hash = hash.to_string();
            self.acks.push(
                async move {
                    tokio::time::sleep(wait).await;
                    (hash, generation)
                }
                .boxed(),
            );
        }
    }

    fn on_ack_window(&mut self, hash: &str, generation: u64) {
        let online = self.online;
        let Some(entry) = self.streams.get_mut(hash) else {
            return;
        };
        if entry.generation != generation || entry.state != StreamState::Pending {
            return;
        }
        if !online {
            // Re-armed when the subscribe goes out on the next link
            entry.ack_armed = false;
            return;
        }

        entry.confirm();
        let replayed = std::mem::take(&mut entry.replayed);
        debug!(hash, "Subscription confirmed");
        if replayed {
            self.emit_debug(format!("reconnected to stream hash {hash}"));
        }
    }

    fn ensure_started(&mut self, reply: Option<Reply>) {
        self.halted = false;
        if self.online {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        self.start_waiters.extend(reply);
        if self.starting {
            return;
        }
        self.starting = true;
        let transport = self.transport.clone();
        self.ops
            .push(async move { Op::Started(transport.start().await) }.boxed());
    }

    /// Stop the connection; `forget` also clears the tracked set
    fn halt(&mut self, forget: bool, reply: Option<Reply>) {
        self.halted = true;
        self.watchdog = None;

        if self.online {
            for hash in self.streams.hashes() {
                self.write_command(json!({"action": "unsubscribe", "hash": hash}));
            }
            self.write_command(json!({"action": "stop"}));
        } else if self.transport.state() == ConnectionState::Connecting {
            // Nothing subscribed yet; the stop rides on the request in flight
            self.write_command(json!({"action": "stop"}));
        }
        self.online = false;

        if forget {
            self.streams.clear(&ClientError::Stopped);
        } else {
            // Kept streams are confirmed again on the next start
            self.streams.reject_pending(&ClientError::Stopped);
            self.streams.rewind();
        }
        self.streams.mark_unsent();
        self.push_stop(reply);
    }

    fn push_stop(&mut self, reply: Option<Reply>) {
        let transport = self.transport.clone();
        self.ops
            .push(async move { Op::Stopped(reply, transport.stop().await) }.boxed());
    }

    /// Drop the current link and reconnect; subscriptions wait for the new one
    fn push_recover(&mut self, reason: RecoverReason) {
        self.online = false;
        self.streams.rewind();
        self.streams.mark_unsent();
        let transport = self.transport.clone();
        self.ops.push(
            async move { Op::Recovered(reason, transport.recover(reason).await) }.boxed(),
        );
    }

    fn begin_recycle(&mut self, reply: Option<Reply>) {
        self.recycle_waiters.extend(reply);
        if self.recycling {
            return;
        }
        self.recycling = true;
        self.emit_debug("recycling connection".to_string());
        self.online = false;
        self.streams.rewind();
        self.streams.mark_unsent();

        let transport = self.transport.clone();
        self.ops.push(
            async move {
                let result = match transport.stop().await {
                    Ok(()) => transport.recover(RecoverReason::Recycle).await,
                    Err(e) => Err(e),
                };
                Op::Recycled(result)
            }
            .boxed(),
        );
    }

    fn on_op(&mut self, op: Op) {
        match op {
            Op::Started(result) => {
                self.starting = false;
                let reply = result.clone().map_err(ClientError::from);
                for waiter in self.start_waiters.drain(..) {
                    let _ = waiter.send(reply.clone());
                }
                if let Err(error) = result {
                    self.fail_pending(&error);
                }
            }
            Op::Stopped(reply, result) => {
                if let Some(reply) = reply {
                    let _ = reply.send(result.map_err(ClientError::from));
                }
            }
            Op::Recovered(reason, result) => {
                if let Err(error) = result {
                    debug!(%reason, %error, "Recover did not complete");
                }
            }
            Op::Recycled(result) => {
                self.recycling = false;
                let reply = match result {
                    Ok(()) => Ok(()),
                    Err(_) if self.halted => Err(ClientError::Stopped),
                    Err(error) => {
                        warn!(%error, "Recycle failed");
                        let error = ClientError::ReconnectFailed(error);
                        self.emit(ClientEvent::Error(error.clone()));
                        Err(error)
                    }
                };
                for waiter in self.recycle_waiters.drain(..) {
                    let _ = waiter.send(reply.clone());
                }
            }
        }
    }

    /// The connection gave up for good: pending subscriptions fail with it
    fn fail_pending(&mut self, error: &TransportError) {
        if *error == TransportError::Stopped {
            return;
        }
        let failed = self.streams.take_pending();
        if failed.is_empty() {
            return;
        }

        let client_error = ClientError::Transport(error.clone());
        for mut entry in failed {
            entry.reject_waiters(&client_error);
        }
        if self.streams.is_empty() {
            self.emit_debug("no streams left after connection failure".to_string());
            self.halt(true, None);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { status } => {
                info!(status, "Connected to stream");
                self.emit_debug(format!("connected with status code {status}"));
                self.on_link_up(None);
            }
            TransportEvent::Recovered { reason } => {
                info!(%reason, "Stream connection recovered");
                self.emit_debug(format!("reconnected after {reason}"));
                self.on_link_up(Some(reason));
            }
            TransportEvent::Data { chunk, .. } => {
                for record in self.decoder.feed(&chunk) {
                    self.on_record(record);
                }
            }
            TransportEvent::End { status } => {
                let code = status.map_or_else(|| "none".to_string(), |s| s.to_string());
                self.emit_debug(format!("end event received with status code {code}"));
                self.online = false;
                self.streams.mark_unsent();
                if let Some(record) = self.decoder.finish(status) {
                    self.on_record(record);
                }
            }
            TransportEvent::Error(error) => {
                warn!(%error, "Stream transport error");
                self.emit(ClientEvent::Error(ClientError::Transport(error.clone())));
                if error.is_fatal() {
                    self.fail_pending(&error);
                }
            }
            TransportEvent::Stopped => {
                self.online = false;
                self.streams.mark_unsent();
                self.emit(ClientEvent::Disconnect);
            }
        }
    }

    /// Bring subscriptions onto a fresh link
    ///
    /// After a server end the entries keep their state and are only written
    /// again; every other recovery starts a new subscribe round.
    fn on_link_up(&mut self, reason: Option<RecoverReason>) {
        self.decoder.reset();
        if self.halted {
            self.emit_debug("link came up after stop, closing it".to_string());
            self.push_stop(None);
            return;
        }

        self.online = true;
        self.emit(ClientEvent::Connect);
        match reason {
            None | Some(RecoverReason::ServerEnd) => {
                for hash in self.streams.unsent() {
                    self.send_subscribe(&hash);
                }
            }
            Some(_) => {
                for hash in self.streams.hashes() {
                    self.streams.renew(&hash);
                    self.send_subscribe(&hash);
                }
            }
        }
    }

    fn on_record(&mut self, record: std::result::Result<Value, DecodeError>) {
        match record {
            Ok(record) => self.on_message(record),
            Err(error) => {
                warn!(line = %error.line, "Could not decode record");
                self.emit(ClientEvent::Warning {
                    message: error.to_string(),
                    raw: None,
                });
            }
        }
    }

    fn on_message(&mut self, record: Value) {
        match classify(&record) {
            RecordKind::Failure { message } if message == STOP_ACKNOWLEDGED => {
                debug!("Server acknowledged stop");
                self.online = false;
                self.halted = true;
                self.watchdog = None;
                self.streams.reject_pending(&ClientError::Stopped);
                self.streams.rewind();
                self.streams.mark_unsent();
                if self.transport.state() != ConnectionState::Disconnected {
                    self.push_stop(None);
                }
            }
            RecordKind::Failure { message } => {
                warn!(%message, "Upstream failure");
                self.emit(ClientEvent::Error(ClientError::UpstreamFailure(message)));
                if !self.halted {
                    self.push_recover(RecoverReason::UpstreamFailure);
                }
            }
            RecordKind::Success { message } => {
                self.emit(ClientEvent::Success {
                    message,
                    raw: record,
                });
            }
            RecordKind::Warning { message } => {
                self.emit(ClientEvent::Warning {
                    message: message.clone(),
                    raw: Some(record),
                });
                self.on_rejection(&message);
            }
            RecordKind::Delete => self.emit(ClientEvent::Delete(record)),
            RecordKind::Tick => self.emit(ClientEvent::Tick(record)),
            RecordKind::Interaction => {
                self.arm_watchdog();
                self.emit(ClientEvent::Interaction(record));
            }
            RecordKind::Unknown => self.emit(ClientEvent::UnknownEvent(record)),
        }
    }

    fn on_rejection(&mut self, message: &str) {
        let Some(hash) = rejected_hash(message) else {
            return;
        };
        let Some(mut entry) = self.streams.remove(hash) else {
            return;
        };

        warn!(hash, %message, "Subscription rejected");
        if entry.replayed {
            self.emit_debug(format!(
                "failed to reconnect to stream hash {hash} with error: {message}"
            ));
        }
        entry.reject_waiters(&ClientError::SubscriptionRejected {
            hash: hash.to_string(),
            message: message.to_string(),
        });

        if entry.state == StreamState::Pending && self.streams.is_empty() {
            self.emit_debug("no valid streams left, shutting down".to_string());
            self.halt(true, None);
        }
    }

    fn arm_watchdog(&mut self) {
        if self.halted {
            return;
        }
        let deadline = Instant::now() + self.config.interaction_timeout();
        match &mut self.watchdog {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.watchdog = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    fn on_watchdog(&mut self) {
        info!(
            timeout_ms = self.config.interaction_timeout_ms,
            "No interactions received, recycling connection"
        );
        self.emit_debug(format!(
            "no interactions for {} ms",
            self.config.interaction_timeout_ms
        ));
        self.begin_recycle(None);
    }

    fn write_command(&self, command: Value) {
        let mut line = command.to_string();
        line.push('\n');
        if let Err(error) = self.transport.write(line) {
            warn!(%error, "Failed to queue command");
        }
    }

    fn emit_debug(&self, message: String) {
        debug!("{message}");
        self.emit(ClientEvent::Debug(message));
    }

    fn emit(&self, event: ClientEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }
}

async fn watchdog(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_missing_credentials_fail_synchronously() {
        let err = assert_err!(DataSiftClient::new("", "key"));
        assert!(matches!(err, ClientError::Configuration(_)));

        let err = assert_err!(DataSiftClient::new("user", ""));
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_stream_set() {
        let client = DataSiftClient::new("user", "key").unwrap();
        assert_eq!(
            client.subscribe(StreamSet::new()).await.unwrap_err(),
            ClientError::NoStreams
        );
        assert_eq!(client.username(), "user");
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
