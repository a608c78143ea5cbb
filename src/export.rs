//! # Export Targets - Metrics and Trace Shipping
//!
//! Pluggable export targets for the metrics collector and the tracer. The
//! core stays transport-agnostic: each target formats snapshots into the
//! conventional representation for its backend (Prometheus text, statsd
//! lines, CloudWatch-style JSON batches, Jaeger/Zipkin span JSON) and ships
//! them. Custom targets implement the export traits directly.

use crate::metrics::{MetricsCollector, SeriesSnapshot, SeriesValue};
use crate::tracer::{Span, Trace, Tracer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A metrics export target
#[async_trait]
pub trait MetricsExportTarget: Send + Sync {
    async fn export(&self, series: &[SeriesSnapshot]) -> Result<()>;
}

/// A trace export target
#[async_trait]
pub trait TraceExportTarget: Send + Sync {
    async fn export(&self, traces: &[Trace]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Prometheus scrape endpoint

async fn metrics_handler(State(collector): State<Arc<MetricsCollector>>) -> String {
    collector
        .export_prometheus()
        .await
        .unwrap_or_else(|e| format!("# export error: {e}\n"))
}

/// Serve `GET /metrics` in the Prometheus text format
pub async fn serve_prometheus(
    collector: Arc<MetricsCollector>,
    addr: SocketAddr,
) -> Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(collector);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics endpoint on {addr}"))?;
    info!(%addr, "prometheus scrape endpoint listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "metrics endpoint terminated");
        }
    }))
}

// ---------------------------------------------------------------------------
// statsd over UDP

/// Ships series as statsd datagrams (`name:value|type|#tag:value`)
pub struct StatsdExporter {
    socket: UdpSocket,
    target: SocketAddr,
    prefix: String,
}

impl StatsdExporter {
    pub async fn new(target: SocketAddr, prefix: impl Into<String>) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding statsd source socket")?;
        Ok(Self {
            socket,
            target,
            prefix: prefix.into(),
        })
    }
}

/// Render one series as statsd lines
pub fn statsd_lines(prefix: &str, snapshot: &SeriesSnapshot) -> Vec<String> {
    let name = if prefix.is_empty() {
        snapshot.name.clone()
    } else {
        format!("{prefix}.{}", snapshot.name)
    };
    let tag_suffix = if snapshot.tags.is_empty() {
        String::new()
    } else {
        let tags: Vec<String> = snapshot
            .tags
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        format!("|#{}", tags.join(","))
    };
    match &snapshot.value {
        SeriesValue::Counter(total) => vec![format!("{name}:{total}|c{tag_suffix}")],
        SeriesValue::Gauge(value) => vec![format!("{name}:{value}|g{tag_suffix}")],
        SeriesValue::Histogram(summary) => vec![
            format!("{name}.p50:{}|g{tag_suffix}", summary.p50),
            format!("{name}.p95:{}|g{tag_suffix}", summary.p95),
            format!("{name}.p99:{}|g{tag_suffix}", summary.p99),
        ],
    }
}

#[async_trait]
impl MetricsExportTarget for StatsdExporter {
    async fn export(&self, series: &[SeriesSnapshot]) -> Result<()> {
        for snapshot in series {
            for line in statsd_lines(&self.prefix, snapshot) {
                self.socket
                    .send_to(line.as_bytes(), self.target)
                    .await
                    .context("sending statsd datagram")?;
            }
        }
        debug!(series = series.len(), "statsd export complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CloudWatch-style batched HTTP

/// Ships series as batched JSON metric data over HTTP
pub struct CloudWatchExporter {
    client: reqwest::Client,
    endpoint: String,
    namespace: String,
    batch_size: usize,
}

impl CloudWatchExporter {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            batch_size: 20,
        }
    }
}

/// One series as a metric datum object
pub fn cloudwatch_datum(namespace: &str, snapshot: &SeriesSnapshot) -> Value {
    let dimensions: Vec<Value> = snapshot
        .tags
        .iter()
        .map(|(k, v)| json!({"Name": k, "Value": v}))
        .collect();
    let value = match &snapshot.value {
        SeriesValue::Counter(total) => *total,
        SeriesValue::Gauge(value) => *value,
        SeriesValue::Histogram(summary) => summary.mean,
    };
    json!({
        "Namespace": namespace,
        "MetricName": snapshot.name,
        "Dimensions": dimensions,
        "Value": value,
    })
}

#[async_trait]
impl MetricsExportTarget for CloudWatchExporter {
    async fn export(&self, series: &[SeriesSnapshot]) -> Result<()> {
        for chunk in series.chunks(self.batch_size) {
            let data: Vec<Value> = chunk
                .iter()
                .map(|s| cloudwatch_datum(&self.namespace, s))
                .collect();
            self.client
                .post(&self.endpoint)
                .json(&json!({"MetricData": data}))
                .send()
                .await
                .context("posting metric batch")?
                .error_for_status()
                .context("metric batch rejected")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Jaeger / Zipkin trace shipping

fn span_tags_json(span: &Span) -> Vec<Value> {
    span.tags
        .iter()
        .map(|(k, v)| json!({"key": k, "value": v}))
        .collect()
}

/// One trace in the Jaeger JSON shape
pub fn jaeger_payload(trace: &Trace) -> Value {
    let spans: Vec<Value> = trace
        .spans
        .values()
        .map(|span| {
            json!({
                "traceID": span.trace_id.simple().to_string(),
                "spanID": span.span_id.simple().to_string(),
                "parentSpanID": span.parent_span_id.map(|id| id.simple().to_string()),
                "operationName": span.operation_name,
                "startTime": span.start_time.timestamp_micros(),
                "duration": span.duration_us.unwrap_or(0),
                "tags": span_tags_json(span),
                "logs": span.logs.iter().map(|log| json!({
                    "timestamp": log.timestamp.timestamp_micros(),
                    "fields": [{"key": "message", "value": log.message}],
                })).collect::<Vec<Value>>(),
            })
        })
        .collect();
    json!({
        "traceID": trace.trace_id.simple().to_string(),
        "spans": spans,
    })
}

/// One trace as a Zipkin v2 span array
pub fn zipkin_payload(trace: &Trace) -> Value {
    let spans: Vec<Value> = trace
        .spans
        .values()
        .map(|span| {
            let tags: serde_json::Map<String, Value> = span
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.to_string())))
                .collect();
            json!({
                "traceId": span.trace_id.simple().to_string(),
                "id": span.span_id.simple().to_string(),
                "parentId": span.parent_span_id.map(|id| id.simple().to_string()),
                "name": span.operation_name,
                "timestamp": span.start_time.timestamp_micros(),
                "duration": span.duration_us.unwrap_or(0),
                "tags": tags,
                "annotations": span.logs.iter().map(|log| json!({
                    "timestamp": log.timestamp.timestamp_micros(),
                    "value": log.message,
                })).collect::<Vec<Value>>(),
            })
        })
        .collect();
    Value::Array(spans)
}

/// Ships completed traces to a Jaeger collector endpoint
pub struct JaegerExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl JaegerExporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TraceExportTarget for JaegerExporter {
    async fn export(&self, traces: &[Trace]) -> Result<()> {
        for trace in traces {
            self.client
                .post(&self.endpoint)
                .json(&jaeger_payload(trace))
                .send()
                .await
                .context("posting trace")?
                .error_for_status()
                .context("trace rejected")?;
        }
        Ok(())
    }
}

/// Ships completed traces to a Zipkin v2 endpoint
pub struct ZipkinExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl ZipkinExporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TraceExportTarget for ZipkinExporter {
    async fn export(&self, traces: &[Trace]) -> Result<()> {
        for trace in traces {
            self.client
                .post(&self.endpoint)
                .json(&zipkin_payload(trace))
                .send()
                .await
                .context("posting spans")?
                .error_for_status()
                .context("spans rejected")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Periodic export driver

/// Drives registered targets from the collector and tracer on a cadence
pub struct ExportPipeline {
    collector: Arc<MetricsCollector>,
    tracer: Arc<Tracer>,
    metric_targets: Vec<Arc<dyn MetricsExportTarget>>,
    trace_targets: Vec<Arc<dyn TraceExportTarget>>,
    interval: std::time::Duration,
}

impl ExportPipeline {
    pub fn new(collector: Arc<MetricsCollector>, tracer: Arc<Tracer>) -> Self {
        Self {
            collector,
            tracer,
            metric_targets: Vec::new(),
            trace_targets: Vec::new(),
            interval: std::time::Duration::from_secs(10),
        }
    }

    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn add_metric_target(&mut self, target: Arc<dyn MetricsExportTarget>) {
        self.metric_targets.push(target);
    }

    pub fn add_trace_target(&mut self, target: Arc<dyn TraceExportTarget>) {
        self.trace_targets.push(target);
    }

    /// Run one export round against every target
    pub async fn export_once(&self) {
        let series = self.collector.snapshot_series().await;
        for target in &self.metric_targets {
            if let Err(e) = target.export(&series).await {
                warn!(error = %e, "metrics export target failed");
            }
        }
        let traces = self.tracer.completed_traces().await;
        for target in &self.trace_targets {
            if let Err(e) = target.export(&traces).await {
                warn!(error = %e, "trace export target failed");
            }
        }
    }

    /// Spawn the periodic export loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.export_once().await;
            }
        })
    }
}
