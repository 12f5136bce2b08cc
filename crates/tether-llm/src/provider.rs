use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use tether_core::context::{ChatResponse, LlmContext};
use tether_core::errors::GatewayError;
use tether_core::provider::LlmProvider;

use crate::converter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for an OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL up to (not including) `/chat/completions`.
    pub api_base: String,
    pub api_key: SecretString,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

/// Provider speaking the OpenAI chat-completions protocol.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    async fn post(&self, body: &Value) -> Result<Value, GatewayError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.request_timeout)
                } else {
                    GatewayError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, retry_after, body));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    /// Check the endpoint with a one-token request.
    pub async fn check_connection(&self) -> Result<(), GatewayError> {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        self.post(&body).await.map(|_| ())
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context), fields(model = %self.config.model, messages = context.messages.len()))]
    async fn chat(&self, context: &LlmContext) -> Result<ChatResponse, GatewayError> {
        let body = converter::build_request_body(context, &self.config.model, self.config.max_tokens);
        let response = self.post(&body).await?;
        let parsed = converter::parse_response(&response)?;
        debug!(
            content_len = parsed.content.len(),
            tool_calls = parsed.tool_calls.len(),
            "chat completion received"
        );
        Ok(parsed)
    }
}
