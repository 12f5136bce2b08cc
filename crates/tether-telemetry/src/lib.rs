mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink, StoredClientLog};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use tether_core::logs::{LogSink, NullLogSink};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive (e.g. `info` or `info,tether_engine=debug`).
    /// Overridden by the RUST_LOG env var.
    pub log_level: String,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether to persist warn+ logs and client logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Whether metrics recording is enabled.
    pub metrics_enabled: bool,
    /// Path to the metrics database.
    pub metrics_db_path: PathBuf,
    /// How many days of metrics snapshots to retain.
    pub metrics_retention_days: u32,
}

impl TelemetryConfig {
    /// Defaults with both databases placed under `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            log_level: "info".into(),
            json: false,
            log_to_sqlite: true,
            log_db_path: data_dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: data_dir.join("metrics.db"),
            metrics_retention_days: 7,
        }
    }
}

/// Handles to the telemetry stores opened by [`init_telemetry`].
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    /// A guard with nothing persisted; handy for tests and `connect` mode.
    pub fn disabled() -> Self {
        Self {
            log_sink: None,
            metrics_recorder: None,
        }
    }

    /// Access the metrics recorder for recording and querying.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// Access the log store for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    /// Sink for client-forwarded logs; discards when persistence is off.
    pub fn client_log_sink(&self) -> Arc<dyn LogSink> {
        match &self.log_sink {
            Some(sink) => sink.clone(),
            None => Arc::new(NullLogSink),
        }
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    // Optional SQLite sink for warn+ logs
    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("tether-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("tether-telemetry: subscriber already installed: {e}");
    }

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => {
                if let Err(e) = recorder.prune(config.metrics_retention_days) {
                    tracing::warn!(error = %e, "failed to prune old metrics snapshots");
                }
                Some(Arc::new(recorder))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        log_sink: sqlite_sink,
        metrics_recorder,
    }
}
