//! Connection lifecycle records, buffered for forwarding as `client_log`.
//!
//! The session feeds this from its transitions and heartbeat. Records
//! survive a lost connection and go out with the next flush, so the
//! server also learns why the previous connection ended.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use tether_core::ids::{EnvelopeId, SessionId};
use tether_core::protocol::ClientLogRecord;

/// Batches kept while offline before the oldest records are dropped.
const MAX_BUFFERED_BATCHES: usize = 4;

pub struct ConnectionLog {
    batch_size: usize,
    buffer: Vec<ClientLogRecord>,
    connection_id: Option<String>,
    started: Instant,
    connected: bool,
    pings_sent: u64,
    pongs_received: u64,
    messages_sent: u64,
    messages_received: u64,
}

impl ConnectionLog {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            connection_id: None,
            started: Instant::now(),
            connected: false,
            pings_sent: 0,
            pongs_received: 0,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Start tracking a new connection attempt. Counters restart; buffered
    /// records from earlier attempts are kept.
    pub fn begin(&mut self, connection_id: &SessionId, url: &str) {
        self.connection_id = Some(connection_id.as_str().to_string());
        self.started = Instant::now();
        self.connected = false;
        self.pings_sent = 0;
        self.pongs_received = 0;
        self.messages_sent = 0;
        self.messages_received = 0;
        self.push("info", "Connecting to server", json!({ "url": url }));
    }

    pub fn connected(&mut self) {
        self.connected = true;
        let elapsed = self.uptime_ms();
        self.push("info", "Connected to server", json!({ "connectMs": elapsed }));
    }

    pub fn ping_sent(&mut self, ping_time: i64) {
        self.pings_sent += 1;
        let meta = json!({
            "pingTime": ping_time,
            "pingsSent": self.pings_sent,
            "uptimeMs": self.uptime_ms(),
        });
        self.push("info", "Ping sent", meta);
    }

    pub fn pong_received(&mut self, pong_time: i64, rtt_ms: i64) {
        self.pongs_received += 1;
        let meta = json!({
            "pongTime": pong_time,
            "rttMs": rtt_ms,
            "pongsReceived": self.pongs_received,
            "uptimeMs": self.uptime_ms(),
        });
        self.push("info", "Pong received", meta);
    }

    pub fn message_sent(&mut self, kind: &str, id: &EnvelopeId) {
        self.messages_sent += 1;
        let meta = json!({
            "messageType": kind,
            "messageId": id.as_str(),
            "messagesSent": self.messages_sent,
        });
        self.push("debug", "Message sent", meta);
    }

    pub fn message_received(&mut self, kind: &str, id: &EnvelopeId) {
        self.messages_received += 1;
        let meta = json!({
            "messageType": kind,
            "messageId": id.as_str(),
            "messagesReceived": self.messages_received,
        });
        self.push("debug", "Message received", meta);
    }

    pub fn disconnected(&mut self, reason: &str) {
        let meta = json!({
            "closeReason": reason,
            "connectionMs": self.uptime_ms(),
            "messagesSent": self.messages_sent,
            "messagesReceived": self.messages_received,
            "pingsSent": self.pings_sent,
            "pongsReceived": self.pongs_received,
            "wasConnected": self.connected,
        });
        self.push("info", "Disconnected from server", meta);
        self.connected = false;
    }

    pub fn error(&mut self, message: &str) {
        let meta = json!({ "errorMessage": message, "uptimeMs": self.uptime_ms() });
        self.push("error", "Error occurred", meta);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// A full batch is waiting.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.batch_size
    }

    pub fn take(&mut self) -> Vec<ClientLogRecord> {
        std::mem::take(&mut self.buffer)
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn push(&mut self, level: &str, message: &str, meta: Value) {
        let mut extra = match meta {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(id) = &self.connection_id {
            extra.insert("connectionId".into(), Value::String(id.clone()));
        }
        let limit = self.batch_size * MAX_BUFFERED_BATCHES;
        if self.buffer.len() >= limit {
            self.buffer.remove(0);
        }
        self.buffer.push(ClientLogRecord {
            source: "client".into(),
            level: level.into(),
            message: message.into(),
            timestamp: Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            extra,
        });
    }
}
