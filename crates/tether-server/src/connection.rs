use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_core::logs::LogSink;
use tether_core::protocol::{Body, Envelope, StatusKind};

use crate::orchestrator::{SessionAgent, TurnOrchestrator};
use crate::registry::{ConnectionRegistry, SessionHandle};

/// Everything a connection needs from the server.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub registry: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub log_sink: Arc<dyn LogSink>,
    pub ping_interval: Duration,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

/// Per-connection dispatch state. Inbound frames are handled one at a
/// time, in receipt order.
struct Dispatcher {
    session: Arc<SessionHandle>,
    agent: SessionAgent,
    orchestrator: Arc<TurnOrchestrator>,
    log_sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn handle_text(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, len = text.len(), "dropping malformed envelope");
                return;
            }
        };

        match envelope.body {
            Body::Ping => {
                self.session.send(Envelope::pong().reply_to(envelope.id)).await;
            }
            Body::UserInput(payload) => {
                debug!(session_id = %self.session.id(), input_id = %envelope.id, len = payload.text.len(), "user input");
                self.orchestrator
                    .start_turn(
                        &self.agent,
                        Arc::clone(&self.session),
                        envelope.id,
                        payload.text,
                        self.cancel.clone(),
                    )
                    .await;
            }
            Body::ClientLog(payload) => {
                let sink = Arc::clone(&self.log_sink);
                let session_id = self.session.id().clone();
                trace!(session_id = %session_id, records = payload.logs.len(), "client logs");
                // SQLite I/O stays off the connection's task.
                tokio::task::spawn_blocking(move || sink.append(&session_id, &payload.logs));
            }
            Body::Unknown { kind, .. } => {
                debug!(session_id = %self.session.id(), kind = %kind, "ignoring unknown envelope type");
            }
            other => {
                debug!(session_id = %self.session.id(), kind = other.type_name(), "ignoring envelope not meant for the server");
            }
        }
    }
}

/// Serve one accepted WebSocket until either side closes it.
pub async fn handle_connection(socket: WebSocket, deps: ConnectionDeps) {
    let (session, rx) = deps.registry.register();
    let session_id = session.id().clone();
    info!(session_id = %session_id, open = deps.registry.count(), "client connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, Arc::clone(&session), deps.ping_interval));

    session
        .send(Envelope::system_status(StatusKind::Connected, "Connected to server"))
        .await;

    let dispatcher = Dispatcher {
        agent: deps.orchestrator.session_agent(session_id.clone()),
        session: Arc::clone(&session),
        orchestrator: Arc::clone(&deps.orchestrator),
        log_sink: Arc::clone(&deps.log_sink),
        cancel: CancellationToken::new(),
    };

    let reader = async {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    session.record_received();
                    dispatcher.handle_text(text.as_str()).await;
                }
                Ok(WsMessage::Pong(_)) => session.record_pong(),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => session.touch(),
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "websocket read error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = reader => {},
        _ = &mut writer => {},
        _ = deps.shutdown.cancelled() => {
            debug!(session_id = %session_id, "closing session for shutdown");
        }
    }

    writer.abort();
    dispatcher.cancel.cancel();
    deps.registry.unregister(&session_id);
    info!(
        session_id = %session_id,
        sent = session.messages_sent(),
        received = session.messages_received(),
        age_secs = (Utc::now() - session.created_at()).num_seconds(),
        idle_ms = session.idle().as_millis() as u64,
        rtt_ms = session.rtt().map(|d| d.as_millis() as u64),
        "client disconnected"
    );
}

/// Drain the outbound queue to the socket and send transport pings.
async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    session: Arc<SessionHandle>,
    ping_interval: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                session.record_ping_sent();
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!(session_id = %session.id(), "sent ping");
            }
        }
    }
    let _ = ws_tx.close().await;
}
