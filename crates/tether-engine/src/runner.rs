use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tether_core::context::LlmContext;
use tether_core::events::{ProgressEvent, ProgressSink};
use tether_core::ids::SessionId;
use tether_core::messages::{ConversationHistory, ToolCall};
use tether_core::provider::LlmProvider;
use tether_core::tools::{ToolContext, ToolResult};

use crate::error::EngineError;
use crate::registry::ToolRegistry;

pub const DEFAULT_MAX_STEPS: u32 = 100;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Answer sent in place of a model reply when the model call fails.
pub const FALLBACK_REPLY: &str =
    "Sorry, the AI service is temporarily unavailable. Please try again later.";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Most model calls one turn may make.
    pub max_steps: u32,
    pub tool_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// How a turn ended without error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model gave a final answer.
    Completed { text: String, steps: u32 },
    /// The step ceiling was reached while the model still wanted tools.
    Exhausted { steps: u32 },
}

impl TurnOutcome {
    pub fn steps(&self) -> u32 {
        match self {
            Self::Completed { steps, .. } | Self::Exhausted { steps } => *steps,
        }
    }
}

/// Drives tool-augmented turns for one session.
///
/// The conversation history lives as long as the agent, so consecutive
/// turns see what came before.
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    history: ConversationHistory,
    config: AgentConfig,
    session_id: SessionId,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
        session_id: SessionId,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            history: ConversationHistory::new(system_prompt),
            config,
            session_id,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Run one user turn to completion, exhaustion, or failure.
    ///
    /// A model failure emits [`FALLBACK_REPLY`] as the completion before the
    /// error is returned. Cancellation is checked before each step.
    #[instrument(skip_all, fields(session_id = %self.session_id, model = %self.provider.model()))]
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        self.history.push_user(user_text);
        let tool_defs = self.tools.definitions();

        for step in 1..=self.config.max_steps {
            if cancel.is_cancelled() {
                info!(step, "turn cancelled");
                return Err(EngineError::Aborted);
            }

            sink.emit(ProgressEvent::Thinking {
                step,
                text: format!("Step {step}: calling the model..."),
            })
            .await;

            let context = LlmContext {
                messages: self.history.turns().to_vec(),
                tools: tool_defs.clone(),
            };
            let response = match self.provider.chat(&context).await {
                Ok(r) => r,
                Err(e) => {
                    error!(step, error = %e, kind = e.error_kind(), "model call failed");
                    sink.emit(ProgressEvent::Completion {
                        text: FALLBACK_REPLY.to_string(),
                    })
                    .await;
                    return Err(e.into());
                }
            };

            self.history
                .push_assistant(response.content.clone(), response.tool_calls.clone());

            if response.is_final() {
                debug!(step, len = response.content.len(), "turn completed");
                sink.emit(ProgressEvent::Completion {
                    text: response.content.clone(),
                })
                .await;
                return Ok(TurnOutcome::Completed {
                    text: response.content,
                    steps: step,
                });
            }

            for call in response.tool_calls {
                sink.emit(ProgressEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                })
                .await;

                let result = self.execute_tool(&call).await;
                self.history.push_tool(call.id.clone(), result.history_text());

                sink.emit(ProgressEvent::ToolResult {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    success: result.success,
                    content: result.content,
                    error: result.error,
                })
                .await;
            }
        }

        warn!(max_steps = self.config.max_steps, "step ceiling reached without a final answer");
        Ok(TurnOutcome::Exhausted {
            steps: self.config.max_steps,
        })
    }

    /// Never fails: every problem becomes a failed [`ToolResult`].
    async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "model requested an unknown tool");
            return ToolResult::failure(format!("Tool not found: {}", call.name));
        };

        let ctx = ToolContext {
            session_id: self.session_id.clone(),
        };

        let result = tokio::time::timeout(
            self.config.tool_timeout,
            std::panic::AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(r))) => r,
            Ok(Ok(Err(e))) => {
                warn!(tool = %call.name, error = %e, "tool execution failed");
                ToolResult::failure(e.to_string())
            }
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                ToolResult::failure("Internal error: tool crashed")
            }
            Err(_) => {
                warn!(
                    tool = %call.name,
                    timeout_secs = self.config.tool_timeout.as_secs(),
                    "tool timed out"
                );
                ToolResult::failure(format!(
                    "Tool timed out after {}s",
                    self.config.tool_timeout.as_secs()
                ))
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
