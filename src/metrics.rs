//! # Metrics Collector - Counters, Gauges, Histograms, and Timers
//!
//! Collects metric series keyed by (name, tag map). Counters accumulate,
//! gauges keep the last value, histograms keep a bounded ring of recent
//! values from which summary statistics are computed on demand. A periodic
//! aggregation pass rolls active series into a time-series store and
//! enforces per-metric retention.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tag map attached to a series; ordered so keys hash stably
pub type Tags = BTreeMap<String, String>;

/// Collector configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Cadence of the aggregation pass
    pub aggregation_interval: Duration,
    /// Default retention for aggregated points
    pub retention: Duration,
    /// Per-metric retention overrides by metric name
    pub retention_overrides: HashMap<String, Duration>,
    /// Ring size per histogram series
    pub histogram_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            aggregation_interval: Duration::from_secs(10),
            retention: Duration::from_secs(24 * 60 * 60),
            retention_overrides: HashMap::new(),
            histogram_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    tags: Tags,
}

#[derive(Debug, Clone)]
enum SeriesData {
    Counter(f64),
    Gauge { value: f64, at: DateTime<Utc> },
    Histogram(VecDeque<f64>),
}

/// One aggregated point in the time-series store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Summary statistics computed from a histogram ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Value of one exported series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SeriesValue {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramSummary),
}

/// Read-only view of one live series, consumed by export targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub name: String,
    pub tags: Tags,
    pub value: SeriesValue,
}

struct ActiveTimer {
    name: String,
    tags: Tags,
    started: Instant,
}

/// Metric series owner; clients receive snapshots, never live maps
pub struct MetricsCollector {
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
    series: RwLock<HashMap<SeriesKey, SeriesData>>,
    store: RwLock<HashMap<SeriesKey, VecDeque<TimeSeriesPoint>>>,
    timers: RwLock<HashMap<Uuid, ActiveTimer>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            series: RwLock::new(HashMap::new()),
            store: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn the periodic aggregation loop
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.config.aggregation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                collector.aggregate_once().await;
            }
        })
    }

    /// Record a raw observation; routed to a histogram series
    pub async fn record(&self, name: &str, value: f64, tags: Tags, _timestamp: Option<DateTime<Utc>>) {
        self.record_histogram(name, value, tags).await;
    }

    /// Add `n` to a counter series
    pub async fn inc_counter(&self, name: &str, n: f64, tags: Tags) {
        let key = SeriesKey {
            name: name.to_string(),
            tags,
        };
        let mut series = self.series.write().await;
        match series
            .entry(key)
            .or_insert_with(|| SeriesData::Counter(0.0))
        {
            SeriesData::Counter(total) => *total += n,
            other => {
                warn!(name, "counter increment against non-counter series");
                *other = SeriesData::Counter(n);
            }
        }
    }

    /// Set a gauge series to `value`
    pub async fn set_gauge(&self, name: &str, value: f64, tags: Tags) {
        let key = SeriesKey {
            name: name.to_string(),
            tags,
        };
        let at = self.clock.wall();
        self.series
            .write()
            .await
            .insert(key, SeriesData::Gauge { value, at });
    }

    /// Push a value onto a histogram series ring
    pub async fn record_histogram(&self, name: &str, value: f64, tags: Tags) {
        let key = SeriesKey {
            name: name.to_string(),
            tags,
        };
        let mut series = self.series.write().await;
        let entry = series
            .entry(key)
            .or_insert_with(|| SeriesData::Histogram(VecDeque::new()));
        if let SeriesData::Histogram(ring) = entry {
            ring.push_back(value);
            while ring.len() > self.config.histogram_capacity {
                ring.pop_front();
            }
        }
    }

    /// Start a duration timer; the returned id stops it
    pub async fn start_timer(&self, name: &str, tags: Tags) -> Uuid {
        let id = Uuid::new_v4();
        self.timers.write().await.insert(
            id,
            ActiveTimer {
                name: name.to_string(),
                tags,
                started: self.clock.now(),
            },
        );
        id
    }

    /// Stop a timer and record its elapsed milliseconds as a histogram value
    pub async fn stop_timer(&self, id: Uuid) -> Option<Duration> {
        let timer = self.timers.write().await.remove(&id)?;
        let elapsed = self.clock.now().duration_since(timer.started);
        self.record_histogram(&timer.name, elapsed.as_secs_f64() * 1_000.0, timer.tags)
            .await;
        Some(elapsed)
    }

    /// Current value of a counter series
    pub async fn counter_value(&self, name: &str, tags: &Tags) -> f64 {
        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };
        match self.series.read().await.get(&key) {
            Some(SeriesData::Counter(total)) => *total,
            _ => 0.0,
        }
    }

    /// Last value of a gauge series
    pub async fn gauge_value(&self, name: &str, tags: &Tags) -> Option<f64> {
        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };
        match self.series.read().await.get(&key) {
            Some(SeriesData::Gauge { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Summary of a histogram series, computed on demand
    pub async fn histogram_summary(&self, name: &str, tags: &Tags) -> Option<HistogramSummary> {
        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };
        match self.series.read().await.get(&key) {
            Some(SeriesData::Histogram(ring)) if !ring.is_empty() => {
                let mut sorted: Vec<f64> = ring.iter().copied().collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let count = sorted.len();
                let sum: f64 = sorted.iter().sum();
                Some(HistogramSummary {
                    count,
                    min: sorted[0],
                    max: sorted[count - 1],
                    mean: sum / count as f64,
                    p50: percentile(&sorted, 50.0),
                    p95: percentile(&sorted, 95.0),
                    p99: percentile(&sorted, 99.0),
                })
            }
            _ => None,
        }
    }

    /// Roll active series into the time-series store and enforce retention
    pub async fn aggregate_once(&self) {
        let now = self.clock.wall();
        let series = self.series.read().await;
        let mut store = self.store.write().await;

        for (key, data) in series.iter() {
            let value = match data {
                SeriesData::Counter(total) => *total,
                SeriesData::Gauge { value, .. } => *value,
                SeriesData::Histogram(ring) => {
                    if ring.is_empty() {
                        continue;
                    }
                    ring.iter().sum::<f64>() / ring.len() as f64
                }
            };
            store
                .entry(key.clone())
                .or_default()
                .push_back(TimeSeriesPoint {
                    timestamp: now,
                    value,
                });
        }
        drop(series);

        // Retention pass: drop points past their metric's TTL
        for (key, points) in store.iter_mut() {
            let ttl = self
                .config
                .retention_overrides
                .get(&key.name)
                .copied()
                .unwrap_or(self.config.retention);
            let cutoff = now
                - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
            while points
                .front()
                .map(|p| p.timestamp < cutoff)
                .unwrap_or(false)
            {
                points.pop_front();
            }
        }
        store.retain(|_, points| !points.is_empty());
        debug!(series = store.len(), "metrics aggregation pass complete");
    }

    /// Aggregated points for one series
    pub async fn query(&self, name: &str, tags: &Tags) -> Vec<TimeSeriesPoint> {
        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };
        self.store
            .read()
            .await
            .get(&key)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Read-only snapshot of every live series, for export targets
    pub async fn snapshot_series(&self) -> Vec<SeriesSnapshot> {
        let series = self.series.read().await;
        let mut out = Vec::with_capacity(series.len());
        for (key, data) in series.iter() {
            let value = match data {
                SeriesData::Counter(total) => SeriesValue::Counter(*total),
                SeriesData::Gauge { value, .. } => SeriesValue::Gauge(*value),
                SeriesData::Histogram(ring) => {
                    if ring.is_empty() {
                        continue;
                    }
                    let mut sorted: Vec<f64> = ring.iter().copied().collect();
                    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    SeriesValue::Histogram(HistogramSummary {
                        count: sorted.len(),
                        min: sorted[0],
                        max: sorted[sorted.len() - 1],
                        mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
                        p50: percentile(&sorted, 50.0),
                        p95: percentile(&sorted, 95.0),
                        p99: percentile(&sorted, 99.0),
                    })
                }
            };
            out.push(SeriesSnapshot {
                name: key.name.clone(),
                tags: key.tags.clone(),
                value,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Names of all live series
    pub async fn series_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .series
            .read()
            .await
            .keys()
            .map(|k| k.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Render all live series in the Prometheus text exposition format
    ///
    /// A throwaway registry is built per call: counters and gauges export
    /// directly, histograms export their summary statistics as suffixed
    /// gauges.
    pub async fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        let registry = Registry::new();
        let series = self.series.read().await;

        for (key, data) in series.iter() {
            let labels: HashMap<String, String> =
                key.tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            match data {
                SeriesData::Counter(total) => {
                    let gauge = Gauge::with_opts(
                        Opts::new(sanitize(&key.name), "counter series").const_labels(labels),
                    )?;
                    gauge.set(*total);
                    registry.register(Box::new(gauge))?;
                }
                SeriesData::Gauge { value, .. } => {
                    let gauge = Gauge::with_opts(
                        Opts::new(sanitize(&key.name), "gauge series").const_labels(labels),
                    )?;
                    gauge.set(*value);
                    registry.register(Box::new(gauge))?;
                }
                SeriesData::Histogram(ring) => {
                    if ring.is_empty() {
                        continue;
                    }
                    let mut sorted: Vec<f64> = ring.iter().copied().collect();
                    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let stats = [
                        ("count", sorted.len() as f64),
                        ("mean", sorted.iter().sum::<f64>() / sorted.len() as f64),
                        ("p50", percentile(&sorted, 50.0)),
                        ("p95", percentile(&sorted, 95.0)),
                        ("p99", percentile(&sorted, 99.0)),
                    ];
                    for (suffix, value) in stats {
                        let gauge = Gauge::with_opts(
                            Opts::new(
                                format!("{}_{suffix}", sanitize(&key.name)),
                                "histogram summary",
                            )
                            .const_labels(labels.clone()),
                        )?;
                        gauge.set(value);
                        registry.register(Box::new(gauge))?;
                    }
                }
            }
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let _ = self.series.read().await;
        Ok(())
    }
}

/// Linear interpolation between the two nearest rank-order values
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_counter_accumulates() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        let t = tags(&[("queue", "default")]);
        collector.inc_counter("tasks_completed", 1.0, t.clone()).await;
        collector.inc_counter("tasks_completed", 2.0, t.clone()).await;
        assert_eq!(collector.counter_value("tasks_completed", &t).await, 3.0);
    }

    #[tokio::test]
    async fn test_tag_sets_are_distinct_series() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        collector
            .inc_counter("n", 1.0, tags(&[("k", "a")]))
            .await;
        collector
            .inc_counter("n", 5.0, tags(&[("k", "b")]))
            .await;
        assert_eq!(collector.counter_value("n", &tags(&[("k", "a")])).await, 1.0);
        assert_eq!(collector.counter_value("n", &tags(&[("k", "b")])).await, 5.0);
    }

    #[tokio::test]
    async fn test_gauge_keeps_last_value() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        let t = Tags::new();
        collector.set_gauge("depth", 5.0, t.clone()).await;
        collector.set_gauge("depth", 2.0, t.clone()).await;
        assert_eq!(collector.gauge_value("depth", &t).await, Some(2.0));
    }

    #[tokio::test]
    async fn test_histogram_percentile_interpolation() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        let t = Tags::new();
        for v in [10.0, 20.0, 30.0, 40.0] {
            collector.record_histogram("latency", v, t.clone()).await;
        }
        let summary = collector.histogram_summary("latency", &t).await.unwrap();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 40.0);
        assert_eq!(summary.mean, 25.0);
        // rank 1.5 between 20 and 30
        assert_eq!(summary.p50, 25.0);
        // rank 2.85 between 30 and 40
        assert!((summary.p95 - 38.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_histogram_ring_is_bounded() {
        let config = MetricsConfig {
            histogram_capacity: 10,
            ..MetricsConfig::default()
        };
        let collector = MetricsCollector::new(config);
        let t = Tags::new();
        for v in 0..100 {
            collector.record_histogram("h", v as f64, t.clone()).await;
        }
        let summary = collector.histogram_summary("h", &t).await.unwrap();
        assert_eq!(summary.count, 10);
        assert_eq!(summary.min, 90.0);
    }

    #[tokio::test]
    async fn test_timer_records_elapsed() {
        let clock = Arc::new(ManualClock::new());
        let collector =
            MetricsCollector::with_clock(MetricsConfig::default(), Arc::clone(&clock) as Arc<dyn Clock>);
        let id = collector.start_timer("work_ms", Tags::new()).await;
        clock.advance(Duration::from_millis(250));
        let elapsed = collector.stop_timer(id).await.unwrap();
        assert_eq!(elapsed, Duration::from_millis(250));

        let summary = collector.histogram_summary("work_ms", &Tags::new()).await.unwrap();
        assert_eq!(summary.max, 250.0);

        // Unknown timer ids are a no-op
        assert!(collector.stop_timer(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_aggregation_and_retention() {
        let clock = Arc::new(ManualClock::new());
        let config = MetricsConfig {
            retention: Duration::from_secs(60),
            ..MetricsConfig::default()
        };
        let collector = MetricsCollector::with_clock(config, Arc::clone(&clock) as Arc<dyn Clock>);
        let t = Tags::new();

        collector.inc_counter("n", 1.0, t.clone()).await;
        collector.aggregate_once().await;
        assert_eq!(collector.query("n", &t).await.len(), 1);

        // Second point lands inside the window; first expires after it
        clock.advance(Duration::from_secs(40));
        collector.aggregate_once().await;
        assert_eq!(collector.query("n", &t).await.len(), 2);

        clock.advance(Duration::from_secs(40));
        collector.aggregate_once().await;
        let points = collector.query("n", &t).await;
        // The first point is now past the 60 s window
        assert_eq!(points.len(), 2);
    }

    #[tokio::test]
    async fn test_prometheus_export_contains_series() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        collector
            .inc_counter("tasks_total", 7.0, tags(&[("priority", "high")]))
            .await;
        collector.set_gauge("queue_depth", 3.0, Tags::new()).await;

        let text = collector.export_prometheus().await.unwrap();
        assert!(text.contains("tasks_total"));
        assert!(text.contains("priority=\"high\""));
        assert!(text.contains("queue_depth 3"));
    }
}
