use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tether_core::context::{ChatResponse, LlmContext};
use tether_core::errors::GatewayError;
use tether_core::messages::ToolCall;
use tether_core::provider::LlmProvider;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Reply(ChatResponse),
    Error(GatewayError),
    /// Wait a duration, then produce the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(ChatResponse::text(text))
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::Reply(ChatResponse::with_tool_calls("", calls))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
///
/// Every context it receives is recorded so tests can inspect what the
/// model was shown.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    repeat: Option<MockResponse>,
    seen: Mutex<Vec<LlmContext>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Returns `response` on every call.
    pub fn repeating(response: MockResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn contexts(&self) -> Vec<LlmContext> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn chat(&self, context: &LlmContext) -> Result<ChatResponse, GatewayError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push(context.clone());

        let next = self.responses.lock().pop_front().or_else(|| self.repeat.clone());
        let mut response = next.ok_or_else(|| {
            GatewayError::InvalidResponse("mock provider has no more responses".into())
        })?;

        loop {
            match response {
                MockResponse::Reply(reply) => return Ok(reply),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
            }
        }
    }
}
