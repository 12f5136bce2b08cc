//! Settings types. Every section deserializes with per-field defaults, so a
//! settings file only needs the keys it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Placeholder some templates ship with; treated as "no key configured".
pub const PLACEHOLDER_API_KEY: &str = "your-api-key-here";

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    pub server: ServerSettings,
    pub llm: LlmSettings,
    pub agent: AgentSettings,
    pub tools: ToolSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values that would make the system misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SettingsError::InvalidValue(
                "server.port must be between 1 and 65535".into(),
            ));
        }
        if self.agent.max_steps == 0 {
            return Err(SettingsError::InvalidValue(
                "agent.maxSteps must be at least 1".into(),
            ));
        }
        if self.client.reconnect_initial_ms == 0
            || self.client.reconnect_initial_ms > self.client.reconnect_max_ms
        {
            return Err(SettingsError::InvalidValue(
                "client.reconnectInitialMs must be positive and not above reconnectMaxMs".into(),
            ));
        }
        let positive = [
            ("server.maxSendQueue", self.server.max_send_queue as u64),
            ("server.wsPingIntervalSecs", self.server.ws_ping_interval_secs),
            ("server.metricsIntervalSecs", self.server.metrics_interval_secs),
            ("agent.toolTimeoutSecs", self.agent.tool_timeout_secs),
            ("client.heartbeatIntervalMs", self.client.heartbeat_interval_ms),
            ("client.connectTimeoutMs", self.client.connect_timeout_ms),
            ("client.logFlushIntervalMs", self.client.log_flush_interval_ms),
            ("client.logBatchSize", self.client.log_batch_size as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{key} must be positive")));
        }
        Ok(())
    }
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Outbound frames buffered per session before backpressure.
    pub max_send_queue: usize,
    /// Transport-level WebSocket ping interval.
    pub ws_ping_interval_secs: u64,
    /// How often the registry metrics snapshot is taken.
    pub metrics_interval_secs: u64,
    /// Expose the listener through a cloudflared quick tunnel.
    pub enable_tunnel: bool,
    /// Directory for the log and metrics databases. `None` means `~/.tether`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_send_queue: 256,
            ws_ping_interval_secs: 30,
            metrics_interval_secs: 60,
            enable_tunnel: false,
            data_dir: None,
        }
    }
}

impl ServerSettings {
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => crate::loader::tether_home(),
        }
    }
}

/// Model backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    /// Base URL of an OpenAI-compatible API.
    pub api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
            request_timeout_secs: 120,
            retry: RetrySettings::default(),
        }
    }
}

impl LlmSettings {
    /// The configured key, if it is a real one.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != PLACEHOLDER_API_KEY)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
        }
    }
}

/// Turn loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Step ceiling for one turn.
    pub max_steps: u32,
    /// File holding the system prompt; the built-in prompt is used if missing.
    pub system_prompt_path: String,
    /// Upper bound on a single tool execution.
    pub tool_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 100,
            system_prompt_path: "system_prompt.md".to_string(),
            tool_timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    /// Root directory scanned for `SKILL.md` files.
    pub skills_dir: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            skills_dir: "./skills".to_string(),
        }
    }
}

/// Client session timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Connection log records are forwarded at least this often while connected.
    pub log_flush_interval_ms: u64,
    /// Buffered connection log records that force an early flush.
    pub log_batch_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            connect_timeout_ms: 10_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 10,
            log_flush_interval_ms: 30_000,
            log_batch_size: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist WARN+ server logs and client-forwarded logs to SQLite.
    pub persist: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = TetherSettings::default();
        assert_eq!(s.server.port, 3000);
        assert_eq!(s.llm.api_base, "https://api.openai.com/v1");
        assert_eq!(s.llm.model, "gpt-4o");
        assert_eq!(s.agent.max_steps, 100);
        assert_eq!(s.tools.skills_dir, "./skills");
        assert_eq!(s.client.heartbeat_interval_ms, 15_000);
        assert_eq!(s.client.connect_timeout_ms, 10_000);
        assert_eq!(s.client.reconnect_max_attempts, 10);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let s: TetherSettings =
            serde_json::from_str(r#"{"agent":{"maxSteps":5},"llm":{"model":"local"}}"#).unwrap();
        assert_eq!(s.agent.max_steps, 5);
        assert_eq!(s.agent.tool_timeout_secs, 60);
        assert_eq!(s.llm.model, "local");
        assert_eq!(s.llm.max_tokens, 4096);
    }

    #[test]
    fn placeholder_key_is_ignored() {
        let mut llm = LlmSettings::default();
        assert_eq!(llm.effective_api_key(), None);
        llm.api_key = Some(PLACEHOLDER_API_KEY.into());
        assert_eq!(llm.effective_api_key(), None);
        llm.api_key = Some("  sk-live ".into());
        assert_eq!(llm.effective_api_key(), Some("sk-live"));
    }

    #[test]
    fn validate_rejects_zero_steps() {
        let mut s = TetherSettings::default();
        s.agent.max_steps = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_periods() {
        let cases: [(&str, fn(&mut TetherSettings)); 5] = [
            ("server.wsPingIntervalSecs", |s| s.server.ws_ping_interval_secs = 0),
            ("server.metricsIntervalSecs", |s| s.server.metrics_interval_secs = 0),
            ("agent.toolTimeoutSecs", |s| s.agent.tool_timeout_secs = 0),
            ("client.connectTimeoutMs", |s| s.client.connect_timeout_ms = 0),
            ("client.logBatchSize", |s| s.client.log_batch_size = 0),
        ];
        for (key, zero) in cases {
            let mut s = TetherSettings::default();
            zero(&mut s);
            match s.validate() {
                Err(SettingsError::InvalidValue(msg)) => assert!(msg.contains(key), "{msg}"),
                other => panic!("{key}: expected rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut s = TetherSettings::default();
        s.client.reconnect_initial_ms = 60_000;
        assert!(s.validate().is_err());
    }
}
