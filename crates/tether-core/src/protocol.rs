//! Wire envelope exchanged over the session connection.
//!
//! Every frame is one JSON object: `{type, payload, timestamp, id, reply_to?}`.
//! Decoding is two-stage: the outer envelope is read loosely, then the payload
//! is parsed according to `type`. An unrecognized `type` decodes to
//! [`Body::Unknown`] so receivers can ignore it without dropping the connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{EnvelopeId, ToolCallId};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The closed set of envelope types this protocol defines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    UserInput,
    Ping,
    Pong,
    LlmOutput,
    SystemStatus,
    ClientLog,
    Thinking,
    ToolCall,
    ToolResult,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::LlmOutput => "llm_output",
            Self::SystemStatus => "system_status",
            Self::ClientLog => "client_log",
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user_input" => Self::UserInput,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "llm_output" => Self::LlmOutput,
            "system_status" => Self::SystemStatus,
            "client_log" => Self::ClientLog,
            "thinking" => Self::Thinking,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            _ => return None,
        })
    }
}

// --- Payloads ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThinkingPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connected,
    Disconnected,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemStatusPayload {
    pub status: StatusKind,
    pub message: String,
}

/// One log record forwarded by a client. Extra fields are kept verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientLogRecord {
    #[serde(default = "default_log_source")]
    pub source: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_log_source() -> String {
    "client".into()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientLogPayload {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default)]
    pub logs: Vec<ClientLogRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: ToolCallId,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Typed envelope body. Matching on this is how receivers dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    UserInput(TextPayload),
    Ping,
    Pong,
    LlmOutput(TextPayload),
    SystemStatus(SystemStatusPayload),
    ClientLog(ClientLogPayload),
    Thinking(ThinkingPayload),
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    /// A `type` this build does not know. Accepted and ignored.
    Unknown { kind: String, payload: Value },
}

impl Body {
    pub fn kind(&self) -> Option<EnvelopeKind> {
        Some(match self {
            Self::UserInput(_) => EnvelopeKind::UserInput,
            Self::Ping => EnvelopeKind::Ping,
            Self::Pong => EnvelopeKind::Pong,
            Self::LlmOutput(_) => EnvelopeKind::LlmOutput,
            Self::SystemStatus(_) => EnvelopeKind::SystemStatus,
            Self::ClientLog(_) => EnvelopeKind::ClientLog,
            Self::Thinking(_) => EnvelopeKind::Thinking,
            Self::ToolCall(_) => EnvelopeKind::ToolCall,
            Self::ToolResult(_) => EnvelopeKind::ToolResult,
            Self::Unknown { .. } => return None,
        })
    }

    /// The wire `type` string, including unknown ones.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Unknown { kind, .. } => kind,
            other => other.kind().map_or("unknown", |k| k.as_str()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One unit of wire exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    pub body: Body,
    pub timestamp: i64,
    pub id: EnvelopeId,
    pub reply_to: Option<EnvelopeId>,
}

impl Envelope {
    /// Stamp a fresh id and the current time.
    pub fn new(body: Body) -> Self {
        Self {
            body,
            timestamp: now_millis(),
            id: EnvelopeId::new(),
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, id: EnvelopeId) -> Self {
        self.reply_to = Some(id);
        self
    }

    pub fn user_input(text: impl Into<String>) -> Self {
        Self::new(Body::UserInput(TextPayload { text: text.into() }))
    }

    pub fn ping() -> Self {
        Self::new(Body::Ping)
    }

    /// A pong carries the responder's current time in `timestamp`.
    pub fn pong() -> Self {
        Self::new(Body::Pong)
    }

    pub fn llm_output(text: impl Into<String>) -> Self {
        Self::new(Body::LlmOutput(TextPayload { text: text.into() }))
    }

    pub fn system_status(status: StatusKind, message: impl Into<String>) -> Self {
        Self::new(Body::SystemStatus(SystemStatusPayload {
            status,
            message: message.into(),
        }))
    }

    pub fn client_log(connection_id: impl Into<String>, logs: Vec<ClientLogRecord>) -> Self {
        Self::new(Body::ClientLog(ClientLogPayload {
            connection_id: connection_id.into(),
            logs,
        }))
    }

    pub fn kind(&self) -> Option<EnvelopeKind> {
        self.body.kind()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        raw.into_envelope()
    }

    pub fn encode(&self) -> String {
        // RawEnvelope only holds JSON-native values, so this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Loose outer shape used on both sides of (de)serialization.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    timestamp: i64,
    id: EnvelopeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<EnvelopeId>,
}

impl RawEnvelope {
    fn into_envelope(self) -> Result<Envelope, ProtocolError> {
        let body = match EnvelopeKind::parse(&self.kind) {
            None => Body::Unknown {
                kind: self.kind,
                payload: self.payload,
            },
            Some(kind) => {
                let payload = self.payload;
                let parse_err = |source| ProtocolError::InvalidPayload {
                    kind: kind.as_str(),
                    source,
                };
                match kind {
                    EnvelopeKind::Ping => Body::Ping,
                    EnvelopeKind::Pong => Body::Pong,
                    EnvelopeKind::UserInput => {
                        Body::UserInput(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                    EnvelopeKind::LlmOutput => {
                        Body::LlmOutput(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                    EnvelopeKind::SystemStatus => {
                        Body::SystemStatus(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                    EnvelopeKind::ClientLog => {
                        Body::ClientLog(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                    EnvelopeKind::Thinking => {
                        Body::Thinking(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                    EnvelopeKind::ToolCall => {
                        Body::ToolCall(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                    EnvelopeKind::ToolResult => {
                        Body::ToolResult(serde_json::from_value(payload).map_err(parse_err)?)
                    }
                }
            }
        };
        Ok(Envelope {
            body,
            timestamp: self.timestamp,
            id: self.id,
            reply_to: self.reply_to,
        })
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        raw.into_envelope()
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(env: Envelope) -> Self {
        let kind = env.body.type_name().to_string();
        let payload = match env.body {
            Body::Ping | Body::Pong => Value::Object(Map::new()),
            Body::UserInput(p) | Body::LlmOutput(p) => to_value(p),
            Body::Thinking(p) => to_value(p),
            Body::SystemStatus(p) => to_value(p),
            Body::ClientLog(p) => to_value(p),
            Body::ToolCall(p) => to_value(p),
            Body::ToolResult(p) => to_value(p),
            Body::Unknown { payload, .. } => payload,
        };
        Self {
            kind,
            payload,
            timestamp: env.timestamp,
            id: env.id,
            reply_to: env.reply_to,
        }
    }
}

fn to_value<T: Serialize>(payload: T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_user_input() {
        let env = Envelope::decode(
            r#"{"type":"user_input","payload":{"text":"hello"},"timestamp":1700000000000,"id":"u1"}"#,
        )
        .unwrap();
        assert_eq!(env.id.as_str(), "u1");
        assert_eq!(env.timestamp, 1_700_000_000_000);
        assert_eq!(env.kind(), Some(EnvelopeKind::UserInput));
        match env.body {
            Body::UserInput(p) => assert_eq!(p.text, "hello"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_accepted() {
        let env = Envelope::decode(
            r#"{"type":"typing_indicator","payload":{"on":true},"timestamp":1,"id":"x"}"#,
        )
        .unwrap();
        assert_eq!(env.kind(), None);
        assert_eq!(env.body.type_name(), "typing_indicator");
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let env = Envelope::decode(
            r#"{"type":"llm_output","payload":{"text":"hi","lang":"en"},"timestamp":1,"id":"a","trace":"t"}"#,
        )
        .unwrap();
        assert!(matches!(env.body, Body::LlmOutput(ref p) if p.text == "hi"));
    }

    #[test]
    fn ping_without_payload_decodes() {
        let env = Envelope::decode(r#"{"type":"ping","timestamp":5,"id":"ping-5"}"#).unwrap();
        assert_eq!(env.body, Body::Ping);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        // known type with the wrong payload shape
        assert!(matches!(
            Envelope::decode(r#"{"type":"user_input","payload":{"body":1},"timestamp":1,"id":"a"}"#),
            Err(ProtocolError::InvalidPayload { kind: "user_input", .. })
        ));
    }

    #[test]
    fn encodes_reply_to_and_payload() {
        let env = Envelope::llm_output("hi").reply_to(EnvelopeId::from_raw("u1"));
        let value: Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(value["type"], "llm_output");
        assert_eq!(value["payload"], json!({"text": "hi"}));
        assert_eq!(value["reply_to"], "u1");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn reply_to_omitted_when_absent() {
        let value: Value = serde_json::from_str(&Envelope::ping().encode()).unwrap();
        assert!(value.get("reply_to").is_none());
        assert_eq!(value["payload"], json!({}));
    }

    #[test]
    fn tool_result_error_is_optional() {
        let env = Envelope::decode(
            r#"{"type":"tool_result","payload":{"tool_call_id":"c1","tool_name":"get_skill","success":true,"content":"ok"},"timestamp":1,"id":"r"}"#,
        )
        .unwrap();
        match env.body {
            Body::ToolResult(p) => {
                assert!(p.success);
                assert!(p.error.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn client_log_keeps_extra_record_fields() {
        let env = Envelope::decode(
            r#"{"type":"client_log","payload":{"connectionId":"conn_1","logs":[{"source":"client","level":"warn","message":"slow","timestamp":"2026-01-01T00:00:00Z","screen":"chat"}]},"timestamp":1,"id":"l"}"#,
        )
        .unwrap();
        let Body::ClientLog(p) = env.body else {
            panic!("expected client_log");
        };
        assert_eq!(p.connection_id, "conn_1");
        assert_eq!(p.logs[0].extra["screen"], "chat");
    }

    #[test]
    fn status_kind_wire_names() {
        let env = Envelope::system_status(StatusKind::Connected, "welcome");
        let value: Value = serde_json::from_str(&env.encode()).unwrap();
        assert_eq!(value["payload"]["status"], "connected");
    }
}
