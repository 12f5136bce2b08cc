use serde::Serialize;

/// Lifecycle state of a client session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every state transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    pub state: ConnectionState,
    /// Last measured round trip in milliseconds.
    pub rtt_ms: Option<i64>,
    pub error: Option<String>,
    pub url: Option<String>,
}
