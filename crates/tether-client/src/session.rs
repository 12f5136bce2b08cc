//! Client connection session.
//!
//! A [`ClientSession`] is a handle to a background task that owns the
//! transport, the heartbeat timer and the retry timer. Commands reach the
//! task over a channel; state changes, inbound envelopes and RTT samples
//! are published to listeners registered on the handle.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use tether_core::ids::{EnvelopeId, SessionId};
use tether_core::protocol::{Body, ClientLogRecord, Envelope};
use tether_settings::ClientSettings;

use crate::connection_log::ConnectionLog;
use crate::error::{ClientError, TransportError};
use crate::heartbeat::HeartbeatTracker;
use crate::listeners::{ListenerId, Listeners};
use crate::reconnect::{ReconnectController, ReconnectPolicy};
use crate::status::{ConnectionState, StatusInfo};
use crate::transport::{Connector, Transport, WsConnector};
use crate::endpoint::{format_websocket_url, is_valid_websocket_url};

pub const CONNECTION_TIMEOUT_MESSAGE: &str = "Connection timed out";
pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost";
pub const MAX_ATTEMPTS_MESSAGE: &str = "Maximum reconnection attempts reached";
const LOCAL_DISCONNECT_REASON: &str = "Disconnected by client";

/// Timing for one client session.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Connection log records are sent at least this often while connected.
    pub log_flush_interval: Duration,
    /// Buffered connection log records that trigger an immediate send.
    pub log_batch_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ClientConfig {
    fn from(s: &ClientSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(s.reconnect_initial_ms),
                max: Duration::from_millis(s.reconnect_max_ms),
                max_attempts: s.reconnect_max_attempts,
            },
            log_flush_interval: Duration::from_millis(s.log_flush_interval_ms),
            log_batch_size: s.log_batch_size,
        }
    }
}

enum Command {
    Connect(String),
    Disconnect(oneshot::Sender<()>),
    Send(Envelope, oneshot::Sender<Result<(), ClientError>>),
    SendLogs(Vec<ClientLogRecord>, oneshot::Sender<Result<(), ClientError>>),
}

#[derive(Default)]
struct Shared {
    status: Mutex<StatusInfo>,
    status_listeners: Listeners<StatusInfo>,
    message_listeners: Listeners<Envelope>,
    rtt_listeners: Listeners<i64>,
}

/// Handle to a client session. Dropping it closes the connection.
pub struct ClientSession {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ClientSession {
    /// Spawn a session task using `connector`. Must run inside a Tokio runtime.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let actor = Actor {
            heartbeat: HeartbeatTracker::new(config.heartbeat_interval),
            reconnect: ReconnectController::new(config.reconnect.clone()),
            log: ConnectionLog::new(config.log_batch_size),
            config,
            connector,
            shared: Arc::clone(&shared),
            commands: rx,
            state: ConnectionState::Disconnected,
            url: None,
            connection_id: None,
            connecting: None,
            transport: None,
            ping_timer: None,
            log_timer: None,
            retry: None,
        };
        tokio::spawn(actor.run());
        Self { commands, shared }
    }

    /// A session over WebSocket.
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    /// Begin connecting to `url`. Progress is reported to status listeners.
    pub fn connect(&self, url: &str) -> Result<(), ClientError> {
        if !is_valid_websocket_url(url) {
            return Err(ClientError::InvalidUrl(url.to_string()));
        }
        self.commands
            .send(Command::Connect(format_websocket_url(url)))
            .map_err(|_| ClientError::Stopped)
    }

    /// Close the connection and cancel any pending retry.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a `user_input`. Its id is the `reply_to` of every envelope
    /// produced while answering it.
    pub async fn send_user_input(&self, text: &str) -> Result<EnvelopeId, ClientError> {
        let envelope = Envelope::user_input(text);
        let id = envelope.id.clone();
        self.request(|tx| Command::Send(envelope, tx)).await?;
        Ok(id)
    }

    /// Forward log records to the server's log sink.
    pub async fn send_logs(&self, records: Vec<ClientLogRecord>) -> Result<(), ClientError> {
        self.request(|tx| Command::SendLogs(records, tx)).await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), ClientError>>) -> Command,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub fn status(&self) -> StatusInfo {
        self.shared.status.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    pub fn add_status_listener(
        &self,
        f: impl Fn(&StatusInfo) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.status_listeners.add(f)
    }

    /// Called for every known envelope type except `pong`.
    pub fn add_message_listener(
        &self,
        f: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.message_listeners.add(f)
    }

    /// Called with each RTT sample in milliseconds.
    pub fn add_rtt_listener(&self, f: impl Fn(&i64) + Send + Sync + 'static) -> ListenerId {
        self.shared.rtt_listeners.add(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.status_listeners.remove(id)
            || self.shared.message_listeners.remove(id)
            || self.shared.rtt_listeners.remove(id)
    }
}

enum Event {
    Command(Option<Command>),
    ConnectFinished(Result<Transport, TransportError>),
    Frame(Option<Result<String, TransportError>>),
    PingDue,
    LogFlushDue,
    RetryDue,
}

struct Actor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: ConnectionState,
    url: Option<String>,
    /// Fresh for every attempt; a reconnect is a new session.
    connection_id: Option<SessionId>,
    connecting: Option<BoxFuture<'static, Result<Transport, TransportError>>>,
    transport: Option<Transport>,
    heartbeat: HeartbeatTracker,
    ping_timer: Option<Interval>,
    log: ConnectionLog,
    log_timer: Option<Interval>,
    reconnect: ReconnectController,
    retry: Option<Pin<Box<Sleep>>>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                cmd = self.commands.recv() => Event::Command(cmd),
                res = poll_connecting(&mut self.connecting) => Event::ConnectFinished(res),
                frame = next_frame(&mut self.transport) => Event::Frame(frame),
                _ = tick(&mut self.ping_timer) => Event::PingDue,
                _ = tick(&mut self.log_timer) => Event::LogFlushDue,
                _ = wait(&mut self.retry) => Event::RetryDue,
            };

            match event {
                Event::Command(None) => break,
                Event::Command(Some(cmd)) => self.on_command(cmd).await,
                Event::ConnectFinished(res) => {
                    self.connecting = None;
                    self.on_connect_finished(res).await;
                }
                Event::Frame(Some(Ok(text))) => self.on_frame(&text).await,
                Event::Frame(Some(Err(e))) => self.on_lost(Some(e.to_string())),
                Event::Frame(None) => self.on_lost(None),
                Event::PingDue => self.send_ping().await,
                Event::LogFlushDue => self.flush_logs().await,
                Event::RetryDue => {
                    self.retry = None;
                    self.begin_attempt();
                }
            }

            if self.log.is_full() {
                self.flush_logs().await;
            }
        }

        if let Some(mut transport) = self.transport.take() {
            let _ = transport.sink.close().await;
        }
        debug!("client session task stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(url) => {
                if self.state == ConnectionState::Connected && self.url.as_deref() == Some(&url) {
                    warn!(url = %url, "already connected");
                    return;
                }
                self.close_live_connection().await;
                self.teardown().await;
                self.reconnect.reset();
                if self.state != ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Disconnected, None);
                }
                self.url = Some(url);
                self.begin_attempt();
            }
            Command::Disconnect(ack) => {
                self.close_live_connection().await;
                self.teardown().await;
                self.reconnect.reset();
                if self.state != ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Disconnected, None);
                }
                info!("disconnected");
                let _ = ack.send(());
            }
            Command::Send(envelope, reply) => {
                let kind = envelope.body.type_name().to_string();
                let id = envelope.id.clone();
                let result = self.send(envelope).await;
                if result.is_ok() {
                    self.log.message_sent(&kind, &id);
                }
                let _ = reply.send(result);
            }
            Command::SendLogs(records, reply) => {
                let connection_id = self
                    .connection_id
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_default();
                let envelope = Envelope::client_log(connection_id, records);
                let _ = reply.send(self.send(envelope).await);
            }
        }
    }

    /// Record the local close and send what is buffered while the
    /// transport is still open.
    async fn close_live_connection(&mut self) {
        if self.transport.is_some() {
            self.log.disconnected(LOCAL_DISCONNECT_REASON);
            self.flush_logs().await;
        }
    }

    /// Drop the transport, the in-flight attempt and every timer.
    async fn teardown(&mut self) {
        self.retry = None;
        self.connecting = None;
        self.log_timer = None;
        self.stop_heartbeat();
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.sink.close().await;
        }
    }

    fn begin_attempt(&mut self) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let connection_id = SessionId::new();
        self.log.begin(&connection_id, &url);
        self.connection_id = Some(connection_id);
        self.set_state(ConnectionState::Connecting, None);
        info!(url = %url, attempt = self.reconnect.attempts(), "connecting");

        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
    }

    async fn on_connect_finished(&mut self, result: Result<Transport, TransportError>) {
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.reconnect.reset();
                self.set_state(ConnectionState::Connected, None);
                info!(url = ?self.url, "connected");
                self.log.connected();
                let period = self.config.log_flush_interval;
                self.log_timer = Some(tokio::time::interval_at(Instant::now() + period, period));
                self.start_heartbeat().await;
            }
            Err(e) => {
                warn!(error = %e, "connect attempt failed");
                let message = match e {
                    TransportError::Timeout(_) => CONNECTION_TIMEOUT_MESSAGE.to_string(),
                    other => other.to_string(),
                };
                self.log.error(&message);
                self.set_state(ConnectionState::Error, Some(message));
                self.schedule_retry();
            }
        }
    }

    fn on_lost(&mut self, error: Option<String>) {
        self.transport = None;
        self.log_timer = None;
        self.stop_heartbeat();
        match &error {
            Some(e) => warn!(error = %e, "connection lost"),
            None => info!("connection closed by peer"),
        }
        let reason = error.unwrap_or_else(|| CONNECTION_LOST_MESSAGE.to_string());
        self.log.disconnected(&reason);
        self.set_state(ConnectionState::Disconnected, Some(reason));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        match self.reconnect.next_delay() {
            Some(delay) => {
                info!(
                    attempt = self.reconnect.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.set_state(ConnectionState::Reconnecting, None);
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                warn!(attempts = self.reconnect.attempts(), "giving up on reconnecting");
                self.set_state(ConnectionState::Error, Some(MAX_ATTEMPTS_MESSAGE.to_string()));
            }
        }
    }

    async fn start_heartbeat(&mut self) {
        let period = self.heartbeat.interval();
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ping_timer = Some(timer);
        self.send_ping().await;
    }

    fn stop_heartbeat(&mut self) {
        self.ping_timer = None;
        self.heartbeat.stop();
    }

    async fn send_ping(&mut self) {
        let ping = self.heartbeat.ping();
        debug!(id = %ping.id, "ping");
        let sent_at = ping.timestamp;
        if self.send(ping).await.is_ok() {
            self.log.ping_sent(sent_at);
        }
    }

    /// Forward buffered connection records. Kept for later while offline.
    async fn flush_logs(&mut self) {
        if self.transport.is_none() || self.log.is_empty() {
            return;
        }
        let connection_id = self
            .connection_id
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        let records = self.log.take();
        debug!(records = records.len(), "flushing connection log");
        let _ = self.send(Envelope::client_log(connection_id, records)).await;
    }

    async fn send(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let result = transport.sink.send(envelope.encode()).await;
        if let Err(e) = result {
            self.on_lost(Some(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_frame(&mut self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };

        match &envelope.body {
            Body::Pong => {
                if let Some(rtt) = self.heartbeat.on_pong(&envelope) {
                    debug!(rtt_ms = rtt, "pong");
                    self.log.pong_received(envelope.timestamp, rtt);
                    self.shared.status.lock().rtt_ms = Some(rtt);
                    self.shared.rtt_listeners.notify(&rtt);
                }
            }
            Body::Ping => {
                let _ = self.send(Envelope::pong().reply_to(envelope.id.clone())).await;
            }
            Body::Unknown { kind, .. } => {
                debug!(kind = %kind, "ignoring unknown envelope type");
            }
            body => {
                self.log.message_received(body.type_name(), &envelope.id);
                self.shared.message_listeners.notify(&envelope);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState, error: Option<String>) {
        self.state = state;
        let info = {
            let mut status = self.shared.status.lock();
            status.state = state;
            status.error = error;
            status.url = self.url.clone();
            status.rtt_ms = self.heartbeat.rtt_ms();
            status.clone()
        };
        self.shared.status_listeners.notify(&info);
    }
}

async fn poll_connecting(
    connecting: &mut Option<BoxFuture<'static, Result<Transport, TransportError>>>,
) -> Result<Transport, TransportError> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(transport: &mut Option<Transport>) -> Option<Result<String, TransportError>> {
    match transport {
        Some(t) => t.stream.next().await,
        None => pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => pending().await,
    }
}

async fn wait(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(s) => s.as_mut().await,
        None => pending().await,
    }
}
