use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use tether_core::ids::SessionId;
use tether_core::protocol::{now_millis, Envelope};
use tether_telemetry::MetricsRecorder;

/// Lifetime totals shared by every session of one registry.
#[derive(Debug, Default)]
struct Totals {
    sessions_opened: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Server-side state of one accepted connection.
///
/// Outbound frames go through a single bounded queue drained by the
/// connection's writer, so envelopes reach the wire in the order they
/// were sent here.
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<String>,
    created_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    last_ping_ms: AtomicI64,
    rtt_ms: AtomicI64,
    totals: Arc<Totals>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Time since the last inbound frame.
    pub fn idle(&self) -> Duration {
        let idle = now_millis() - self.last_activity_ms();
        Duration::from_millis(idle.max(0) as u64)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Round trip of the last transport ping, once one has been answered.
    pub fn rtt(&self) -> Option<Duration> {
        let rtt = self.rtt_ms.load(Ordering::Relaxed);
        (rtt >= 0).then(|| Duration::from_millis(rtt as u64))
    }

    /// Queue an envelope for the wire. Returns false once the connection is gone.
    pub async fn send(&self, envelope: Envelope) -> bool {
        let kind = envelope.body.type_name().to_string();
        match self.tx.send(envelope.encode()).await {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.totals.messages_sent.fetch_add(1, Ordering::Relaxed);
                trace!(session_id = %self.id, kind = %kind, "envelope queued");
                true
            }
            Err(_) => {
                debug!(session_id = %self.id, kind = %kind, "session closed, envelope discarded");
                false
            }
        }
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.touch();
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.totals.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping_sent(&self) {
        self.last_ping_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn record_pong(&self) {
        self.touch();
        let sent = self.last_ping_ms.load(Ordering::Relaxed);
        if sent > 0 {
            self.rtt_ms.store((now_millis() - sent).max(0), Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of registry activity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub open_sessions: usize,
    pub total_sessions: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// All live sessions, keyed by identity.
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    totals: Arc<Totals>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            totals: Arc::new(Totals::default()),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Mint a session for a newly accepted connection.
    /// The receiver is the connection's outbound queue.
    pub fn register(&self) -> (Arc<SessionHandle>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let now = now_millis();
        let handle = Arc::new(SessionHandle {
            id: SessionId::new(),
            tx,
            created_at: Utc::now(),
            last_activity_ms: AtomicI64::new(now),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_ping_ms: AtomicI64::new(0),
            rtt_ms: AtomicI64::new(-1),
            totals: Arc::clone(&self.totals),
        });
        self.sessions.insert(handle.id.clone(), Arc::clone(&handle));
        self.totals.sessions_opened.fetch_add(1, Ordering::Relaxed);
        (handle, rx)
    }

    pub fn unregister(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            open_sessions: self.sessions.len(),
            total_sessions: self.totals.sessions_opened.load(Ordering::Relaxed),
            messages_sent: self.totals.messages_sent.load(Ordering::Relaxed),
            messages_received: self.totals.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Periodically log registry activity and record it as metrics.
pub fn start_metrics_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    recorder: Option<Arc<MetricsRecorder>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick

        loop {
            ticker.tick().await;
            let snap = registry.snapshot();
            info!(
                open_sessions = snap.open_sessions,
                total_sessions = snap.total_sessions,
                messages_sent = snap.messages_sent,
                messages_received = snap.messages_received,
                "connection metrics"
            );

            let Some(recorder) = &recorder else {
                continue;
            };
            recorder.gauge_set("ws_open_sessions", &[], snap.open_sessions as f64);
            recorder.gauge_set("ws_sessions_total", &[], snap.total_sessions as f64);
            recorder.gauge_set("ws_messages_sent_total", &[], snap.messages_sent as f64);
            recorder.gauge_set("ws_messages_received_total", &[], snap.messages_received as f64);
            if let Err(e) = recorder.snapshot() {
                warn!(error = %e, "failed to persist metrics snapshot");
            }
        }
    })
}
