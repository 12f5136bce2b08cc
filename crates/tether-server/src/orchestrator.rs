//! Binds agent turns to sessions.
//!
//! Each session owns one [`Agent`] (and so one conversation history) for
//! its lifetime. At most one turn runs per session: a `user_input` that
//! arrives while a turn is active is rejected with an error status that
//! names the rejected envelope in `reply_to`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use tether_core::events::{ProgressEvent, ProgressSink};
use tether_core::ids::{EnvelopeId, SessionId};
use tether_core::protocol::{Envelope, StatusKind};
use tether_core::provider::LlmProvider;
use tether_engine::{Agent, AgentConfig, EngineError, ToolRegistry, TurnOutcome};
use tether_telemetry::MetricsRecorder;

use crate::registry::SessionHandle;

pub const BUSY_MESSAGE: &str =
    "A request is already being processed for this connection. Please wait for it to finish.";

/// The per-session agent, locked for the duration of a turn.
pub type SessionAgent = Arc<Mutex<Agent>>;

/// Result of offering a `user_input` to a session.
#[derive(Debug)]
pub enum TurnStart {
    Started(tokio::task::JoinHandle<()>),
    Rejected,
}

/// Forwards progress events to a session, tagged with the turn's input id.
struct EnvelopeSink {
    session: Arc<SessionHandle>,
    reply_to: EnvelopeId,
}

#[async_trait]
impl ProgressSink for EnvelopeSink {
    async fn emit(&self, event: ProgressEvent) {
        self.session
            .send(event.into_envelope(self.reply_to.clone()))
            .await;
    }
}

/// Creates session agents and runs their turns.
pub struct TurnOrchestrator {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    config: AgentConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl TurnOrchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        system_prompt: impl Into<String>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            system_prompt: system_prompt.into(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn session_agent(&self, session_id: SessionId) -> SessionAgent {
        Arc::new(Mutex::new(Agent::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.tools),
            self.system_prompt.clone(),
            session_id,
            self.config.clone(),
        )))
    }

    /// Start a turn for `input_id` unless one is already running.
    pub async fn start_turn(
        &self,
        agent: &SessionAgent,
        session: Arc<SessionHandle>,
        input_id: EnvelopeId,
        text: String,
        cancel: CancellationToken,
    ) -> TurnStart {
        let guard = match Arc::clone(agent).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(session_id = %session.id(), input_id = %input_id, "turn already active, rejecting input");
                self.count("turns_rejected");
                session
                    .send(Envelope::system_status(StatusKind::Error, BUSY_MESSAGE).reply_to(input_id))
                    .await;
                return TurnStart::Rejected;
            }
        };

        let span = tracing::info_span!("turn", session_id = %session.id(), input_id = %input_id);
        let metrics = self.metrics.clone();
        let handle = tokio::spawn(
            run_turn(guard, session, input_id, text, cancel, metrics).instrument(span),
        );
        TurnStart::Started(handle)
    }

    fn count(&self, name: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc(name, &[], 1);
        }
    }
}

async fn run_turn(
    mut agent: OwnedMutexGuard<Agent>,
    session: Arc<SessionHandle>,
    input_id: EnvelopeId,
    text: String,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
) {
    let sink = EnvelopeSink {
        session: Arc::clone(&session),
        reply_to: input_id.clone(),
    };
    let started = Instant::now();
    let result = agent.run_turn(&text, &sink, &cancel).await;

    let outcome = match &result {
        Ok(TurnOutcome::Completed { steps, .. }) => {
            info!(steps, "turn completed");
            "completed"
        }
        Ok(TurnOutcome::Exhausted { steps }) => {
            warn!(steps, "turn exhausted its step budget");
            let message = format!("No final answer: the step limit ({steps}) was reached.");
            session
                .send(Envelope::system_status(StatusKind::Error, message).reply_to(input_id))
                .await;
            "exhausted"
        }
        Err(EngineError::Gateway(e)) => {
            // The fallback answer has already been sent.
            warn!(error = %e, "turn ended on model failure");
            "model_error"
        }
        Err(EngineError::Aborted) => {
            debug!("turn cancelled with its session");
            "cancelled"
        }
        Err(e) => {
            error!(error = %e, "turn failed");
            session
                .send(
                    Envelope::system_status(StatusKind::Error, "The request could not be processed.")
                        .reply_to(input_id),
                )
                .await;
            "failed"
        }
    };

    if let Some(m) = metrics {
        m.counter_inc("turns_total", &[("outcome", outcome)], 1);
        m.histogram_observe("turn_duration_ms", &[], started.elapsed().as_millis() as f64);
    }
}
