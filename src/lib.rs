//! # Taskfabric - In-Process Task Execution Substrate
//!
//! Taskfabric is a general-purpose, in-process engine that accepts
//! unit-of-work descriptors and drives them through queueing, dependency
//! resolution, resource allocation, concurrent execution, retry, circuit
//! breaking, and failure recovery, collecting metrics, traces, and alerts
//! along the way.
//!
//! ## Core Subsystems
//!
//! - **Scheduler**: priority/deadline/resource-aware intake and dispatch
//!   under a concurrency cap
//! - **Dependency Resolver**: prerequisite DAG with cycle rejection and
//!   ready-set release
//! - **Resource Manager**: multi-dimensional pool with pluggable allocation
//!   strategies
//! - **Resilience Layer**: error classification, jittered retry, circuit
//!   breaking, and recovery strategies
//!
//! ## Architecture
//!
//! ```text
//! submit ──▶ Scheduler ──▶ Dependency Resolver ──▶ Task Queue
//!                │                                     │
//!                ▼                                     ▼
//!          Event Stream ◀── Task Executors ◀── Resource Manager
//!                │                │
//!                ▼                ▼
//!       Metrics / Tracer   Resilience Layer (classify, retry, recover)
//! ```
//!
//! Each subsystem owns its state and serializes mutation; executors are
//! independent workers reporting back over channels, so task execution never
//! blocks scheduler progress.

pub mod alerts;
pub mod circuit_breaker;
pub mod clock;
pub mod dependency_resolver;
pub mod error_classifier;
pub mod executor;
pub mod export;
pub mod metrics;
pub mod recovery;
pub mod resource_manager;
pub mod retry;
pub mod scheduler;
pub mod task_queue;
pub mod tracer;
pub mod types;

pub use alerts::{AlertManager, AlertManagerConfig, AlertRule};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dependency_resolver::DependencyResolver;
pub use error_classifier::{ErrorClassification, ErrorClassifier};
pub use executor::{HandlerRegistry, TaskHandler};
pub use metrics::{MetricsCollector, MetricsConfig};
pub use recovery::RecoveryManager;
pub use resource_manager::{AllocationStrategy, ResourceManager, ResourceManagerConfig};
pub use retry::RetryDelayCalculator;
pub use scheduler::{SchedulerConfig, TaskScheduler};
pub use task_queue::QueueStrategy;
pub use tracer::{Tracer, TracerConfig};
pub use types::{
    EventType, Priority, RetryPolicy, SchedulerEvent, SubmitOptions, Task, TaskError, TaskId,
    TaskResult, TaskStatus,
};

use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use types::HealthStatus;

/// Top-level configuration bundling every subsystem
#[derive(Debug, Clone, Default)]
pub struct FabricConfig {
    pub scheduler: SchedulerConfig,
    pub resources: ResourceManagerConfig,
    pub breakers: CircuitBreakerConfig,
    pub metrics: MetricsConfig,
    pub tracer: TracerConfig,
    pub alerts: AlertManagerConfig,
}

/// The assembled substrate: one scheduler wired to its collaborators
///
/// Construction wires the subsystems together; `start` spawns the background
/// loops (scheduler drive loop, metrics aggregation, trace age-out, alert
/// evaluation).
pub struct TaskFabric {
    scheduler: Arc<TaskScheduler>,
    resolver: Arc<DependencyResolver>,
    resources: Arc<ResourceManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    handlers: Arc<HandlerRegistry>,
    recovery: Arc<RecoveryManager>,
    metrics: Arc<MetricsCollector>,
    tracer: Arc<Tracer>,
    alerts: Arc<AlertManager>,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskFabric {
    pub fn new(config: FabricConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let resolver = Arc::new(DependencyResolver::new());
        let resources = Arc::new(ResourceManager::new(config.resources));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.breakers,
            Arc::clone(&clock),
        ));
        let handlers = Arc::new(HandlerRegistry::new());
        let recovery = Arc::new(RecoveryManager::new());
        let metrics = Arc::new(MetricsCollector::with_clock(
            config.metrics,
            Arc::clone(&clock),
        ));
        let tracer = Arc::new(Tracer::with_clock(config.tracer, Arc::clone(&clock)));
        let alerts = Arc::new(AlertManager::new(config.alerts));

        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler,
            Arc::clone(&resolver),
            Arc::clone(&resources),
            Arc::clone(&breakers),
            Arc::clone(&handlers),
            Arc::clone(&recovery),
            Arc::clone(&metrics),
            Arc::new(RetryDelayCalculator::new()),
        ));

        Self {
            scheduler,
            resolver,
            resources,
            breakers,
            handlers,
            recovery,
            metrics,
            tracer,
            alerts,
            loops: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn all background loops
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }
        loops.push(self.scheduler.start());
        loops.push(self.metrics.start());
        loops.push(self.tracer.start());

        let alerts = Arc::clone(&self.alerts);
        let collector = Arc::clone(&self.metrics);
        let scheduler = Arc::clone(&self.scheduler);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(alerts.evaluation_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for transition in alerts.evaluate_once(&collector).await {
                    scheduler.publish_alert(&transition).await;
                }
            }
        }));
        info!("taskfabric background loops started");
    }

    /// Register a handler for a work reference
    pub async fn register_handler(
        &self,
        work_ref: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.handlers.register(work_ref, handler).await;
    }

    /// Submit work through the scheduler
    pub async fn submit(
        &self,
        work_ref: &str,
        args: Vec<serde_json::Value>,
        opts: SubmitOptions,
    ) -> TaskResult<TaskId> {
        self.scheduler.submit(work_ref, args, opts).await
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Aggregate health of every subsystem
    pub async fn health_check(&self) -> Result<HealthStatus> {
        let checks = vec![
            ("resource_manager", self.resources.health_check().await),
            ("dependency_resolver", self.resolver.health_check().await),
            ("circuit_breakers", self.breakers.health_check().await),
            ("metrics", self.metrics.health_check().await),
            ("tracer", self.tracer.health_check().await),
            ("alerts", self.alerts.health_check().await),
            ("recovery", self.recovery.health_check().await),
        ];
        let issues: Vec<String> = checks
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
            .collect();
        if issues.is_empty() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Degraded { issues })
        }
    }

    /// Stop intake, drain running work, and stop background loops
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let mut loops = self.loops.lock().await;
        for handle in loops.iter() {
            handle.abort();
        }
        join_all(loops.drain(..)).await;
        info!("taskfabric shut down");
    }
}
