use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Histograms keep this many most recent observations.
const HISTOGRAM_WINDOW: usize = 1024;

/// Type of metric.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// A persisted metric value at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Summary statistics from a histogram window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

enum Metric {
    Counter(AtomicU64),
    // f64 bits
    Gauge(AtomicI64),
    Histogram(Mutex<VecDeque<f64>>),
}

impl Metric {
    fn kind(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Histogram(_) => MetricType::Histogram,
        }
    }

    /// Value persisted by a snapshot; histograms report p50.
    fn value(&self) -> f64 {
        match self {
            Self::Counter(v) => v.load(Ordering::Relaxed) as f64,
            Self::Gauge(v) => f64::from_bits(v.load(Ordering::Relaxed) as u64),
            Self::Histogram(obs) => summarize(&obs.lock()).p50,
        }
    }
}

fn summarize(obs: &VecDeque<f64>) -> HistogramSummary {
    if obs.is_empty() {
        return HistogramSummary::default();
    }
    let mut sorted: Vec<f64> = obs.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = sorted.len();
    HistogramSummary {
        count: count as u64,
        sum: sorted.iter().sum(),
        p50: sorted[count / 2],
        p95: sorted[((count as f64 * 0.95) as usize).min(count - 1)],
        max: sorted[count - 1],
    }
}

/// Metric identity: name plus labels sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: HashMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// In-memory metrics with snapshots persisted to SQLite.
pub struct MetricsRecorder {
    metrics: RwLock<HashMap<MetricKey, Metric>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            metrics: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    /// Run `f` on the metric, creating it with `init` on first use.
    fn with_metric(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        init: fn() -> Metric,
        f: impl FnOnce(&Metric),
    ) {
        let key = MetricKey::new(name, labels);
        if let Some(metric) = self.metrics.read().get(&key) {
            f(metric);
            return;
        }
        let mut metrics = self.metrics.write();
        f(metrics.entry(key).or_insert_with(init));
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_metric(name, labels, || Metric::Counter(AtomicU64::new(0)), |m| {
            if let Metric::Counter(v) = m {
                v.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_metric(name, labels, || Metric::Gauge(AtomicI64::new(0)), |m| {
            if let Metric::Gauge(v) = m {
                v.store(value.to_bits() as i64, Ordering::Relaxed);
            }
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_metric(
            name,
            labels,
            || Metric::Histogram(Mutex::new(VecDeque::new())),
            |m| {
                if let Metric::Histogram(obs) = m {
                    let mut obs = obs.lock();
                    if obs.len() == HISTOGRAM_WINDOW {
                        obs.pop_front();
                    }
                    obs.push_back(value);
                }
            },
        );
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.metrics.read().get(&MetricKey::new(name, labels)) {
            Some(Metric::Counter(v)) => v.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.metrics.read().get(&MetricKey::new(name, labels)) {
            Some(m @ Metric::Gauge(_)) => m.value(),
            _ => 0.0,
        }
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.metrics.read().get(&MetricKey::new(name, labels)) {
            Some(Metric::Histogram(obs)) => summarize(&obs.lock()),
            _ => HistogramSummary::default(),
        }
    }

    /// Persist every current metric value. Returns the number of rows written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let rows: Vec<(MetricKey, f64, MetricType)> = self
            .metrics
            .read()
            .iter()
            .map(|(key, metric)| (key.clone(), metric.value(), metric.kind()))
            .collect();

        let mut db = self.db.lock();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (key, value, kind) in &rows {
                stmt.execute(rusqlite::params![
                    now,
                    key.name,
                    value,
                    key.labels_json(),
                    kind.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots
             WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.name, q.since, q.limit.unwrap_or(100)],
            |row| {
                let metric_type = match row.get::<_, String>(5)?.as_str() {
                    "gauge" => MetricType::Gauge,
                    "histogram" => MetricType::Histogram,
                    _ => MetricType::Counter,
                };
                Ok(MetricsSnapshot {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get(3)?,
                    labels: row.get(4)?,
                    metric_type,
                })
            },
        )?;
        rows.collect()
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp <= ?1",
            rusqlite::params![cutoff],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (tempfile::TempDir, MetricsRecorder) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = MetricsRecorder::new(&dir.path().join("metrics.db")).unwrap();
        (dir, recorder)
    }

    #[test]
    fn counters_are_keyed_by_labels() {
        let (_dir, recorder) = recorder();
        recorder.counter_inc("tool.calls", &[("tool", "get_skill")], 1);
        recorder.counter_inc("tool.calls", &[("tool", "get_skill")], 1);
        recorder.counter_inc("tool.calls", &[("tool", "other")], 1);

        assert_eq!(recorder.counter_get("tool.calls", &[("tool", "get_skill")]), 2);
        assert_eq!(recorder.counter_get("tool.calls", &[("tool", "other")]), 1);
        assert_eq!(recorder.counter_get("tool.calls", &[]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let (_dir, recorder) = recorder();
        recorder.counter_inc("x", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauge_set_overwrites() {
        let (_dir, recorder) = recorder();
        recorder.gauge_set("sessions.open", &[], 3.0);
        recorder.gauge_set("sessions.open", &[], 1.0);
        assert_eq!(recorder.gauge_get("sessions.open", &[]), 1.0);
    }

    #[test]
    fn histogram_summary_percentiles() {
        let (_dir, recorder) = recorder();
        for v in 1..=100 {
            recorder.histogram_observe("turn.duration_ms", &[], v as f64);
        }
        let summary = recorder.histogram_summary("turn.duration_ms", &[]);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.max, 100.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 51.0);
        assert!(summary.p95 >= 95.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let (_dir, recorder) = recorder();
        for v in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], v as f64);
        }
        assert_eq!(
            recorder.histogram_summary("h", &[]).count,
            HISTOGRAM_WINDOW as u64
        );
    }

    #[test]
    fn snapshot_persists_and_queries() {
        let (_dir, recorder) = recorder();
        recorder.counter_inc("messages.received", &[], 42);
        recorder.gauge_set("sessions.open", &[], 5.0);
        recorder.histogram_observe("turn.duration_ms", &[], 12.0);

        assert_eq!(recorder.snapshot().unwrap(), 3);

        let results = recorder
            .query(&MetricsQuery {
                name: Some("messages.received".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, 42.0);
        assert_eq!(results[0].metric_type, MetricType::Counter);

        let future = recorder
            .query(&MetricsQuery {
                since: Some("2099-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn prune_removes_old_snapshots() {
        let (_dir, recorder) = recorder();
        recorder.counter_inc("c", &[], 1);
        recorder.snapshot().unwrap();
        assert_eq!(recorder.prune(0).unwrap(), 1);
        assert!(recorder.query(&MetricsQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;

        let (_dir, recorder) = recorder();
        let recorder = Arc::new(recorder);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("c", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("c", &[]), 8000);
    }
}
