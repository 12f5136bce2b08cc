use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use tether_core::context::{ChatResponse, LlmContext};
use tether_core::errors::GatewayError;
use tether_core::provider::LlmProvider;

/// Stand-in used when no API key is configured.
///
/// Answers every request with `Echo: <last user text>` after a short
/// randomized pause, never requesting tools.
pub struct EchoProvider {
    min_delay: Duration,
    max_delay: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_secs(1), Duration::from_secs(2))
    }

    pub fn with_delay(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    fn pause(&self) -> Duration {
        if self.max_delay == self.min_delay {
            return self.min_delay;
        }
        rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo"
    }

    async fn chat(&self, context: &LlmContext) -> Result<ChatResponse, GatewayError> {
        let pause = self.pause();
        debug!(delay_ms = pause.as_millis() as u64, "echo provider replying");
        tokio::time::sleep(pause).await;

        let text = context.last_user_text().unwrap_or_default();
        Ok(ChatResponse::text(format!("Echo: {text}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::messages::Message;

    #[tokio::test(start_paused = true)]
    async fn echoes_last_user_text() {
        let mut ctx = LlmContext::empty();
        ctx.messages.push(Message::system("sys"));
        ctx.messages.push(Message::user_text("hello there"));

        let start = tokio::time::Instant::now();
        let resp = EchoProvider::new().chat(&ctx).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(resp.content, "Echo: hello there");
        assert!(resp.is_final());
        assert!(elapsed >= Duration::from_secs(1) && elapsed <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_delay_for_tests() {
        let provider = EchoProvider::with_delay(Duration::ZERO, Duration::ZERO);
        let resp = provider.chat(&LlmContext::empty()).await.unwrap();
        assert_eq!(resp.content, "Echo: ");
    }
}
