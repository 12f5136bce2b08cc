use crate::messages::{Message, ToolCall};
use crate::tools::ToolDefinition;

/// The complete request sent to a provider for one model call.
#[derive(Clone, Debug)]
pub struct LlmContext {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    /// Create an empty context (useful for testing).
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Text of the most recent user turn, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User { content } => Some(content.as_str()),
            _ => None,
        })
    }
}

/// What the model returned for one call: answer text, plus tool calls when
/// it wants to act before answering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }

    /// No tool calls means this is the terminal answer.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_user_text_skips_other_roles() {
        let mut ctx = LlmContext::empty();
        ctx.messages.push(Message::system("sys"));
        ctx.messages.push(Message::user_text("first"));
        ctx.messages.push(Message::assistant_text("reply"));
        ctx.messages.push(Message::user_text("second"));
        ctx.messages.push(Message::assistant_text("again"));
        assert_eq!(ctx.last_user_text(), Some("second"));
        assert_eq!(LlmContext::empty().last_user_text(), None);
    }

    #[test]
    fn response_finality() {
        assert!(ChatResponse::text("hi").is_final());
        let resp = ChatResponse::with_tool_calls("", vec![ToolCall::new("c1", "t", json!({}))]);
        assert!(!resp.is_final());
    }
}
