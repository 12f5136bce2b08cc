//! Conversion between [`LlmContext`] and the OpenAI chat-completions wire format.

use serde_json::{json, Map, Value};
use tracing::warn;

use tether_core::context::{ChatResponse, LlmContext};
use tether_core::errors::GatewayError;
use tether_core::ids::ToolCallId;
use tether_core::messages::{Message, ToolCall};
use tether_core::tools::ToolDefinition;

/// Build the request body for `POST /chat/completions`.
pub fn build_request_body(context: &LlmContext, model: &str, max_tokens: u32) -> Value {
    let messages: Vec<Value> = context.messages.iter().map(convert_message).collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
    });

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context.tools.iter().map(convert_tool).collect();
        body["tools"] = Value::Array(tools);
    }

    body
}

fn convert_message(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({"role": "system", "content": content}),
        Message::User { content } => json!({"role": "user", "content": content}),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            if tool_calls.is_empty() {
                return json!({"role": "assistant", "content": content});
            }
            let calls: Vec<Value> = tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": Value::Object(call.arguments.clone()).to_string(),
                        }
                    })
                })
                .collect();
            // Some servers reject an empty string next to tool_calls
            let content = if content.is_empty() {
                Value::Null
            } else {
                Value::String(content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Message::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

/// Parse a chat-completions response body.
pub fn parse_response(body: &Value) -> Result<ChatResponse, GatewayError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| GatewayError::InvalidResponse("response has no choices".into()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        tool_calls,
    })
}

fn parse_tool_call(raw: &Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let Some(name) = function.get("name").and_then(Value::as_str) else {
        warn!(call = %raw, "dropping tool call without a function name");
        return None;
    };
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(ToolCallId::from_raw)
        .unwrap_or_default();

    Some(ToolCall {
        id,
        name: name.to_string(),
        arguments: parse_arguments(name, function.get("arguments")),
    })
}

/// Arguments arrive as a JSON-encoded string; some servers send an object.
fn parse_arguments(tool: &str, raw: Option<&Value>) -> Map<String, Value> {
    match raw {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) if s.trim().is_empty() => Map::new(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(tool, arguments = %s, "tool call arguments are not a JSON object");
                Map::new()
            }
        },
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_tools() -> LlmContext {
        LlmContext {
            messages: vec![
                Message::system("sys"),
                Message::user_text("find skill"),
                Message::Assistant {
                    content: String::new(),
                    tool_calls: vec![ToolCall::new("c1", "get_skill", json!({"skill_name": "pdf"}))],
                },
                Message::tool_result(ToolCallId::from_raw("c1"), "# Skill: pdf"),
            ],
            tools: vec![ToolDefinition {
                name: "get_skill".into(),
                description: "Load a skill".into(),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    #[test]
    fn request_body_shape() {
        let body = build_request_body(&context_with_tools(), "gpt-4o", 4096);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_skill");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], Value::Null);
        let call = &messages[2]["tool_calls"][0];
        assert_eq!(call["id"], "c1");
        assert_eq!(call["function"]["arguments"], r#"{"skill_name":"pdf"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
    }

    #[test]
    fn tools_omitted_when_none() {
        let mut ctx = LlmContext::empty();
        ctx.messages.push(Message::user_text("hi"));
        let body = build_request_body(&ctx, "m", 16);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn parses_plain_text() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.content, "hi");
        assert!(resp.is_final());
    }

    #[test]
    fn parses_tool_calls_with_string_arguments() {
        let body = json!({"choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_9",
                "type": "function",
                "function": {"name": "get_skill", "arguments": "{\"skill_name\":\"x\"}"}
            }]
        }}]});
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id.as_str(), "call_9");
        assert_eq!(resp.tool_calls[0].arguments["skill_name"], "x");
    }

    #[test]
    fn bad_arguments_become_empty_map() {
        let body = json!({"choices": [{"message": {
            "tool_calls": [{"id": "c", "function": {"name": "t", "arguments": "{not json"}}]
        }}]});
        let resp = parse_response(&body).unwrap();
        assert!(resp.tool_calls[0].arguments.is_empty());
    }

    #[test]
    fn missing_choices_is_invalid_response() {
        let err = parse_response(&json!({"error": "x"})).unwrap_err();
        assert_eq!(err.error_kind(), "invalid_response");
    }
}
