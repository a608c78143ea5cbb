//! # Tracer - Sampled Trace and Span Trees
//!
//! Builds trace trees for scheduled work: a trace owns a map of spans, each
//! span records timing, tags, and a bounded log list. Traces are sampled
//! probabilistically at `sampling_rate` from a seedable source. A trace is
//! eligible for export once every span has finished, or when its age exceeds
//! `max_trace_duration`, in which case it is exported as-is and expired.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Span lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Active,
    Ok,
    Error,
}

/// Trace lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Active,
    /// Every span finished
    Completed,
    /// Aged out with active spans still open
    Expired,
}

/// A single timed log line attached to a span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub meta: Value,
}

/// A single timed operation within a trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: Uuid,
    pub trace_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation_name: String,
    pub start_time: DateTime<Utc>,
    pub duration_us: Option<u64>,
    pub tags: HashMap<String, Value>,
    pub logs: Vec<SpanLog>,
    pub status: SpanStatus,
    #[serde(skip, default = "Instant::now")]
    started_mono: Instant,
}

/// A trace: a tree of spans under one root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: Uuid,
    pub root_span_id: Uuid,
    pub spans: HashMap<Uuid, Span>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    #[serde(skip, default = "Instant::now")]
    started_mono: Instant,
}

/// Handle returned by `start_trace`, used to open child spans
#[derive(Debug, Clone, Copy)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub root_span_id: Uuid,
}

/// Tracer configuration
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Probability in [0, 1] that `start_trace` produces an active trace
    pub sampling_rate: f64,
    /// Age at which an unfinished trace is expired and exported as-is
    pub max_trace_duration: Duration,
    /// Completed traces retained, most recent last
    pub completed_cache_size: usize,
    /// Log lines retained per span
    pub max_logs_per_span: usize,
    /// Fixed sampling seed for reproducible tests
    pub seed: Option<u64>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 1.0,
            max_trace_duration: Duration::from_secs(300),
            completed_cache_size: 1_000,
            max_logs_per_span: 100,
            seed: None,
        }
    }
}

/// Owner of active traces and the completed-trace cache
pub struct Tracer {
    config: TracerConfig,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    active: RwLock<HashMap<Uuid, Trace>>,
    /// span id -> owning trace id
    span_index: RwLock<HashMap<Uuid, Uuid>>,
    completed: RwLock<VecDeque<Trace>>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TracerConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            clock,
            rng: Mutex::new(rng),
            active: RwLock::new(HashMap::new()),
            span_index: RwLock::new(HashMap::new()),
            completed: RwLock::new(VecDeque::new()),
        }
    }

    /// Spawn the periodic age-out sweep
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracer.sweep_expired().await;
            }
        })
    }

    /// Begin a trace; `None` means the sampling decision was negative
    pub async fn start_trace(&self, operation: &str, meta: Value) -> Option<TraceContext> {
        let sampled = {
            let mut rng = self.rng.lock().unwrap();
            rng.gen::<f64>() < self.config.sampling_rate
        };
        if !sampled {
            return None;
        }

        let trace_id = Uuid::new_v4();
        let root_span_id = Uuid::new_v4();
        let now = self.clock.wall();

        let mut tags = HashMap::new();
        tags.insert("meta".to_string(), meta);

        let root = Span {
            span_id: root_span_id,
            trace_id,
            parent_span_id: None,
            operation_name: operation.to_string(),
            start_time: now,
            duration_us: None,
            tags,
            logs: Vec::new(),
            status: SpanStatus::Active,
            started_mono: self.clock.now(),
        };

        let mut spans = HashMap::new();
        spans.insert(root_span_id, root);

        self.active.write().await.insert(
            trace_id,
            Trace {
                trace_id,
                root_span_id,
                spans,
                start_time: now,
                end_time: None,
                status: TraceStatus::Active,
                started_mono: self.clock.now(),
            },
        );
        self.span_index.write().await.insert(root_span_id, trace_id);
        debug!(%trace_id, operation, "trace started");
        Some(TraceContext {
            trace_id,
            root_span_id,
        })
    }

    /// Open a child span under the context's root
    pub async fn start_span(
        &self,
        ctx: &TraceContext,
        operation: &str,
        meta: Value,
    ) -> Option<Uuid> {
        self.start_child_span(ctx.trace_id, ctx.root_span_id, operation, meta)
            .await
    }

    /// Open a span under an explicit parent span
    pub async fn start_child_span(
        &self,
        trace_id: Uuid,
        parent_span_id: Uuid,
        operation: &str,
        meta: Value,
    ) -> Option<Uuid> {
        let mut active = self.active.write().await;
        let trace = active.get_mut(&trace_id)?;
        if !trace.spans.contains_key(&parent_span_id) {
            warn!(%trace_id, %parent_span_id, "span parent not in trace");
            return None;
        }

        let span_id = Uuid::new_v4();
        let mut tags = HashMap::new();
        tags.insert("meta".to_string(), meta);
        trace.spans.insert(
            span_id,
            Span {
                span_id,
                trace_id,
                parent_span_id: Some(parent_span_id),
                operation_name: operation.to_string(),
                start_time: self.clock.wall(),
                duration_us: None,
                tags,
                logs: Vec::new(),
                status: SpanStatus::Active,
                started_mono: self.clock.now(),
            },
        );
        drop(active);
        self.span_index.write().await.insert(span_id, trace_id);
        Some(span_id)
    }

    /// Finish a span; when it is the last active span the trace completes
    pub async fn finish_span(&self, span_id: Uuid, status: SpanStatus, meta: Value) {
        let trace_id = match self.span_index.read().await.get(&span_id) {
            Some(id) => *id,
            None => return,
        };

        let mut active = self.active.write().await;
        let Some(trace) = active.get_mut(&trace_id) else {
            return;
        };
        if let Some(span) = trace.spans.get_mut(&span_id) {
            if span.status != SpanStatus::Active {
                return; // finish is terminal
            }
            span.status = if status == SpanStatus::Active {
                SpanStatus::Ok
            } else {
                status
            };
            span.duration_us =
                Some(self.clock.now().duration_since(span.started_mono).as_micros() as u64);
            if !meta.is_null() {
                span.tags.insert("finish_meta".to_string(), meta);
            }
        }

        let all_finished = trace.spans.values().all(|s| s.status != SpanStatus::Active);
        if all_finished {
            if let Some(mut done) = active.remove(&trace_id) {
                done.status = TraceStatus::Completed;
                done.end_time = Some(self.clock.wall());
                drop(active);
                self.retire(done).await;
            }
        }
    }

    /// Attach a tag to an active span
    pub async fn add_tag(&self, span_id: Uuid, key: &str, value: Value) {
        let trace_id = match self.span_index.read().await.get(&span_id) {
            Some(id) => *id,
            None => return,
        };
        let mut active = self.active.write().await;
        if let Some(span) = active
            .get_mut(&trace_id)
            .and_then(|t| t.spans.get_mut(&span_id))
        {
            if span.status == SpanStatus::Active {
                span.tags.insert(key.to_string(), value);
            }
        }
    }

    /// Append a log line to an active span; logs are bounded per span
    pub async fn add_log(&self, span_id: Uuid, message: &str, meta: Value) {
        let trace_id = match self.span_index.read().await.get(&span_id) {
            Some(id) => *id,
            None => return,
        };
        let mut active = self.active.write().await;
        if let Some(span) = active
            .get_mut(&trace_id)
            .and_then(|t| t.spans.get_mut(&span_id))
        {
            if span.status != SpanStatus::Active {
                return;
            }
            span.logs.push(SpanLog {
                timestamp: self.clock.wall(),
                message: message.to_string(),
                meta,
            });
            let limit = self.config.max_logs_per_span;
            if span.logs.len() > limit {
                span.logs.remove(0);
            }
        }
    }

    /// Expire traces older than `max_trace_duration`, exporting them as-is
    pub async fn sweep_expired(&self) {
        let now = self.clock.now();
        let mut active = self.active.write().await;
        let expired_ids: Vec<Uuid> = active
            .iter()
            .filter(|(_, trace)| {
                now.duration_since(trace.started_mono) > self.config.max_trace_duration
            })
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(mut trace) = active.remove(&id) {
                trace.status = TraceStatus::Expired;
                trace.end_time = Some(self.clock.wall());
                warn!(trace_id = %id, "trace expired with active spans");
                expired.push(trace);
            }
        }
        drop(active);
        for trace in expired {
            self.retire(trace).await;
        }
    }

    async fn retire(&self, trace: Trace) {
        let mut span_index = self.span_index.write().await;
        for span_id in trace.spans.keys() {
            span_index.remove(span_id);
        }
        drop(span_index);

        let mut completed = self.completed.write().await;
        completed.push_back(trace);
        while completed.len() > self.config.completed_cache_size {
            completed.pop_front();
        }
    }

    /// Snapshot of a completed or expired trace
    pub async fn completed_trace(&self, trace_id: Uuid) -> Option<Trace> {
        self.completed
            .read()
            .await
            .iter()
            .find(|t| t.trace_id == trace_id)
            .cloned()
    }

    /// All cached completed traces, oldest first
    pub async fn completed_traces(&self) -> Vec<Trace> {
        self.completed.read().await.iter().cloned().collect()
    }

    /// Count of traces still active
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let _ = self.active.read().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sampled_tracer() -> Tracer {
        Tracer::new(TracerConfig {
            sampling_rate: 1.0,
            seed: Some(7),
            ..TracerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_trace_completes_when_all_spans_finish() {
        let tracer = sampled_tracer();
        let ctx = tracer.start_trace("job", Value::Null).await.unwrap();
        let child = tracer.start_span(&ctx, "step", Value::Null).await.unwrap();

        tracer.finish_span(child, SpanStatus::Ok, Value::Null).await;
        assert_eq!(tracer.active_count().await, 1);

        tracer
            .finish_span(ctx.root_span_id, SpanStatus::Ok, Value::Null)
            .await;
        assert_eq!(tracer.active_count().await, 0);

        let trace = tracer.completed_trace(ctx.trace_id).await.unwrap();
        assert_eq!(trace.status, TraceStatus::Completed);
        assert_eq!(trace.spans.len(), 2);
        assert!(trace.end_time.is_some());
        assert!(trace.spans[&child].duration_us.is_some());
    }

    #[tokio::test]
    async fn test_sampling_rate_zero_drops_everything() {
        let tracer = Tracer::new(TracerConfig {
            sampling_rate: 0.0,
            seed: Some(7),
            ..TracerConfig::default()
        });
        assert!(tracer.start_trace("job", Value::Null).await.is_none());
    }

    #[tokio::test]
    async fn test_seeded_sampling_is_reproducible() {
        let decisions = |seed: u64| async move {
            let tracer = Tracer::new(TracerConfig {
                sampling_rate: 0.5,
                seed: Some(seed),
                ..TracerConfig::default()
            });
            let mut out = Vec::new();
            for _ in 0..16 {
                out.push(tracer.start_trace("job", Value::Null).await.is_some());
            }
            out
        };
        assert_eq!(decisions(11).await, decisions(11).await);
    }

    #[tokio::test]
    async fn test_tags_and_logs_frozen_after_finish() {
        let tracer = sampled_tracer();
        let ctx = tracer.start_trace("job", Value::Null).await.unwrap();
        let span = ctx.root_span_id;

        tracer.add_tag(span, "phase", Value::String("one".into())).await;
        tracer.add_log(span, "started", Value::Null).await;
        tracer.finish_span(span, SpanStatus::Error, Value::Null).await;

        // Mutations after finish are dropped
        tracer.add_tag(span, "late", Value::Bool(true)).await;
        tracer.add_log(span, "late", Value::Null).await;

        let trace = tracer.completed_trace(ctx.trace_id).await.unwrap();
        let span = &trace.spans[&span];
        assert_eq!(span.status, SpanStatus::Error);
        assert!(span.tags.contains_key("phase"));
        assert!(!span.tags.contains_key("late"));
        assert_eq!(span.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_exports_partial_trace() {
        let clock = Arc::new(ManualClock::new());
        let tracer = Tracer::with_clock(
            TracerConfig {
                sampling_rate: 1.0,
                max_trace_duration: Duration::from_secs(60),
                seed: Some(7),
                ..TracerConfig::default()
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        let ctx = tracer.start_trace("job", Value::Null).await.unwrap();
        let child = tracer.start_span(&ctx, "step", Value::Null).await.unwrap();
        tracer.finish_span(child, SpanStatus::Ok, Value::Null).await;

        clock.advance(Duration::from_secs(61));
        tracer.sweep_expired().await;

        let trace = tracer.completed_trace(ctx.trace_id).await.unwrap();
        assert_eq!(trace.status, TraceStatus::Expired);
        // Root span was never finished; exported as-is
        assert_eq!(trace.spans[&ctx.root_span_id].status, SpanStatus::Active);
    }

    #[tokio::test]
    async fn test_completed_cache_is_bounded() {
        let tracer = Tracer::new(TracerConfig {
            sampling_rate: 1.0,
            completed_cache_size: 3,
            seed: Some(7),
            ..TracerConfig::default()
        });
        for _ in 0..5 {
            let ctx = tracer.start_trace("job", Value::Null).await.unwrap();
            tracer
                .finish_span(ctx.root_span_id, SpanStatus::Ok, Value::Null)
                .await;
        }
        assert_eq!(tracer.completed_traces().await.len(), 3);
    }

    #[tokio::test]
    async fn test_span_under_unknown_parent_rejected() {
        let tracer = sampled_tracer();
        let ctx = tracer.start_trace("job", Value::Null).await.unwrap();
        let bogus = tracer
            .start_child_span(ctx.trace_id, Uuid::new_v4(), "step", Value::Null)
            .await;
        assert!(bogus.is_none());
    }
}
