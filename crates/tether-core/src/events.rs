use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::ids::{EnvelopeId, ToolCallId};
use crate::protocol::{
    Body, Envelope, TextPayload, ThinkingPayload, ToolCallPayload, ToolResultPayload,
};

/// Intermediate state of a running turn, forwarded to the peer as it happens.
/// Never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Thinking {
        step: u32,
        text: String,
    },
    ToolCall {
        id: ToolCallId,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolResult {
        tool_call_id: ToolCallId,
        tool_name: String,
        success: bool,
        content: String,
        error: Option<String>,
    },
    Completion {
        text: String,
    },
}

impl ProgressEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Completion { .. } => "completion",
        }
    }

    /// Wire form of this event. A completion travels as `llm_output`.
    pub fn into_envelope(self, reply_to: EnvelopeId) -> Envelope {
        let body = match self {
            Self::Thinking { step, text } => Body::Thinking(ThinkingPayload {
                text,
                step: Some(step),
            }),
            Self::ToolCall {
                id,
                name,
                arguments,
            } => Body::ToolCall(ToolCallPayload {
                id,
                name,
                arguments,
            }),
            Self::ToolResult {
                tool_call_id,
                tool_name,
                success,
                content,
                error,
            } => Body::ToolResult(ToolResultPayload {
                tool_call_id,
                tool_name,
                success,
                content,
                error,
            }),
            Self::Completion { text } => Body::LlmOutput(TextPayload { text }),
        };
        Envelope::new(body).reply_to(reply_to)
    }
}

/// Where a running turn sends its progress events.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: ProgressEvent);
}

#[async_trait]
impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    async fn emit(&self, event: ProgressEvent) {
        if self.send(event).is_err() {
            tracing::debug!("progress receiver dropped");
        }
    }
}
