use async_trait::async_trait;

use crate::context::{ChatResponse, LlmContext};
use crate::errors::GatewayError;

/// Request/response capability of a language-model backend.
///
/// Implementations must fail explicitly on transport or auth problems; the
/// orchestrator treats any `Err` as terminal for the current step.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn chat(&self, context: &LlmContext) -> Result<ChatResponse, GatewayError>;
}
