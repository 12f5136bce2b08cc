use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tether_core::logs::LogSink;
use tether_telemetry::MetricsRecorder;

use crate::connection::{self, ConnectionDeps};
use crate::orchestrator::TurnOrchestrator;
use crate::registry::{self, ConnectionRegistry};

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub max_send_queue: usize,
    pub ws_ping_interval: Duration,
    pub metrics_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_send_queue: 256,
            ws_ping_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Shortest ping or metrics period; `tokio::time::interval` panics on zero.
const MIN_PERIOD: Duration = Duration::from_millis(100);

impl ServerConfig {
    /// Raise zero periods and queue sizes to their smallest working value.
    pub fn clamped(mut self) -> Self {
        self.max_send_queue = self.max_send_queue.max(1);
        self.ws_ping_interval = self.ws_ping_interval.max(MIN_PERIOD);
        self.metrics_interval = self.metrics_interval.max(MIN_PERIOD);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    deps: ConnectionDeps,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        orchestrator: Arc<TurnOrchestrator>,
        log_sink: Arc<dyn LogSink>,
        ping_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            deps: ConnectionDeps {
                registry,
                orchestrator,
                log_sink,
                ping_interval,
                shutdown,
            },
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The returned handle keeps the server alive.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<TurnOrchestrator>,
    log_sink: Arc<dyn LogSink>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, ServerError> {
    let config = config.clamped();
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let metrics_task = registry::start_metrics_task(
        Arc::clone(&registry),
        config.metrics_interval,
        metrics,
    );

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        Arc::clone(&registry),
        orchestrator,
        log_sink,
        config.ws_ping_interval,
        shutdown.clone(),
    );
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "tether server listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        registry,
        shutdown,
        server,
        metrics_task,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    metrics_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting connections, close open sessions and wait for the
    /// listener to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.metrics_task.abort();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.deps))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.deps.registry.count(),
    }))
}
