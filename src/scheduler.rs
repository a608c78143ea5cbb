//! # Scheduler - Task Intake, Dispatch, and Lifecycle Coordination
//!
//! The scheduler accepts task submissions, coordinates the dependency
//! resolver, task queue, resource manager, and resilience layer, and
//! dispatches executors under a concurrency cap. A periodic tick drives
//! drain passes over the ready queue; executor completion reports drive the
//! rest of the lifecycle. All mutation funnels through one drive loop, so
//! lifecycle events for a task are observed in order.
//!
//! ## Task Lifecycle
//!
//! ```text
//! pending → ready → running → completed
//!               ↓       ↓
//!            waiting  failed ─(retryable)→ pending
//!               ↓       ↓
//!            cancelled  cancelled
//!          (running ↔ paused)
//! ```

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitTransition};
use crate::dependency_resolver::{DependencyResolver, ResolutionOutcome};
use crate::error_classifier::{ErrorClassification, ErrorClassifier};
use crate::executor::{
    CompletionReport, ExecutorHandle, ExecutorSignal, HandlerRegistry, TaskExecutor,
};
use crate::metrics::{MetricsCollector, Tags};
use crate::recovery::RecoveryManager;
use crate::resource_manager::ResourceManager;
use crate::retry::{should_retry, RetryDelayCalculator};
use crate::task_queue::{QueueStats, QueueStrategy, TaskQueue};
use crate::types::{
    EventType, SchedulerEvent, SubmitOptions, Task, TaskError, TaskFailure, TaskId, TaskResult,
    TaskStatus, META_RETRY_ATTEMPT, META_RETRY_DELAY,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Scheduler configuration
///
/// Operational parameters for intake, dispatch, and shutdown behavior.
/// `max_concurrent` and `queue_limit` can be adjusted at runtime through
/// `update_config`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name stamped on every published event
    pub name: String,
    /// Concurrency cap: tasks in running (including paused) at once
    pub max_concurrent: usize,
    /// Cadence of the periodic drain pass
    pub tick_interval: Duration,
    /// Initial queue ordering strategy
    pub queue_strategy: QueueStrategy,
    /// Queue-length ceiling; `None` queues without bound
    pub queue_limit: Option<usize>,
    /// Grace period between cooperative cancel and forced abort
    pub cancel_grace: Duration,
    /// Completed/failed envelopes retained per history map
    pub history_limit: usize,
    /// Event stream buffer per subscriber
    pub event_capacity: usize,
    /// Bound on the shutdown drain wait
    pub shutdown_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "taskfabric".to_string(),
            max_concurrent: 8,
            tick_interval: Duration::from_millis(100),
            queue_strategy: QueueStrategy::Priority,
            queue_limit: None,
            cancel_grace: Duration::from_secs(1),
            history_limit: 1_000,
            event_capacity: 256,
            shutdown_wait: Duration::from_secs(30),
        }
    }
}

struct RunningEntry {
    task: Task,
    allocation: crate::types::AllocationId,
    handle: ExecutorHandle,
}

/// Bounded id->envelope map evicting oldest entries
struct HistoryMap {
    entries: HashMap<TaskId, Task>,
    order: VecDeque<TaskId>,
    limit: usize,
}

impl HistoryMap {
    fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn insert(&mut self, task: Task) {
        let id = task.id;
        if self.entries.insert(id, task).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.limit {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &TaskId) -> Option<&Task> {
        self.entries.get(id)
    }

    fn values(&self) -> impl Iterator<Item = &Task> {
        self.entries.values()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Read-only scheduler state summary
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerSnapshot {
    pub name: String,
    pub running: usize,
    pub paused: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    pub queue: QueueStats,
}

/// The scheduler: owner of task envelopes from intake to terminal state
pub struct TaskScheduler {
    config: RwLock<SchedulerConfig>,
    queue: RwLock<TaskQueue>,
    resolver: Arc<DependencyResolver>,
    resources: Arc<ResourceManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    handlers: Arc<HandlerRegistry>,
    recovery: Arc<RecoveryManager>,
    metrics: Arc<MetricsCollector>,
    classifier: ErrorClassifier,
    retry_delays: Arc<RetryDelayCalculator>,
    running: RwLock<HashMap<TaskId, RunningEntry>>,
    completed: RwLock<HistoryMap>,
    failed: RwLock<HistoryMap>,
    report_tx: async_channel::Sender<CompletionReport>,
    report_rx: async_channel::Receiver<CompletionReport>,
    requeue_tx: async_channel::Sender<Task>,
    requeue_rx: async_channel::Receiver<Task>,
    /// Wakes the drive loop for an early drain pass after submission
    pass_tx: async_channel::Sender<()>,
    pass_rx: async_channel::Receiver<()>,
    events: broadcast::Sender<SchedulerEvent>,
    shutdown: RwLock<bool>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        resolver: Arc<DependencyResolver>,
        resources: Arc<ResourceManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        handlers: Arc<HandlerRegistry>,
        recovery: Arc<RecoveryManager>,
        metrics: Arc<MetricsCollector>,
        retry_delays: Arc<RetryDelayCalculator>,
    ) -> Self {
        let (report_tx, report_rx) = async_channel::unbounded();
        let (requeue_tx, requeue_rx) = async_channel::unbounded();
        let (pass_tx, pass_rx) = async_channel::bounded(1);
        let (events, _) = broadcast::channel(config.event_capacity);
        let queue = TaskQueue::new(config.queue_strategy);
        let history_limit = config.history_limit;

        Self {
            config: RwLock::new(config),
            queue: RwLock::new(queue),
            resolver,
            resources,
            breakers,
            handlers,
            recovery,
            metrics,
            classifier: ErrorClassifier::new(),
            retry_delays,
            running: RwLock::new(HashMap::new()),
            completed: RwLock::new(HistoryMap::new(history_limit)),
            failed: RwLock::new(HistoryMap::new(history_limit)),
            report_tx,
            report_rx,
            requeue_tx,
            requeue_rx,
            pass_tx,
            pass_rx,
            events,
            shutdown: RwLock::new(false),
        }
    }

    /// Spawn the drive loop: completion reports, delayed re-enqueues, and
    /// the periodic drain tick
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let scheduler_name = scheduler.config.read().await.name.clone();
            info!(name = %scheduler_name, "scheduler drive loop started");
            loop {
                let tick = scheduler.config.read().await.tick_interval;
                tokio::select! {
                    report = scheduler.report_rx.recv() => {
                        match report {
                            Ok(report) => scheduler.handle_report(report).await,
                            Err(_) => break,
                        }
                    }
                    task = scheduler.requeue_rx.recv() => {
                        if let Ok(task) = task {
                            scheduler.enqueue_ready(task).await;
                            scheduler.schedule_pass().await;
                        }
                    }
                    _ = scheduler.pass_rx.recv() => {
                        scheduler.schedule_pass().await;
                    }
                    _ = tokio::time::sleep(tick) => {
                        scheduler.schedule_pass().await;
                    }
                }
                if *scheduler.shutdown.read().await {
                    let running = scheduler.running.read().await.len();
                    if running == 0 {
                        break;
                    }
                }
            }
            info!("scheduler drive loop stopped");
        })
    }

    /// Subscribe to the lifecycle event stream
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Submission

    /// Submit a unit of work; returns its task id
    pub async fn submit(
        &self,
        work_ref: &str,
        args: Vec<Value>,
        opts: SubmitOptions,
    ) -> TaskResult<TaskId> {
        if *self.shutdown.read().await {
            return Err(TaskError::ShuttingDown);
        }
        if work_ref.trim().is_empty() {
            return Err(TaskError::InvalidTask("empty work reference".to_string()));
        }
        if opts.timeout_ms == 0 {
            return Err(TaskError::InvalidTimeout(
                "timeout must be positive".to_string(),
            ));
        }
        opts.validate()
            .map_err(|e| TaskError::InvalidArguments(e.to_string()))?;

        if let Some(limit) = self.config.read().await.queue_limit {
            if self.queue.read().await.len() >= limit {
                return Err(TaskError::QueueFull(limit));
            }
        }

        // A tripped breaker for this operation rejects submissions until its
        // recovery timeout permits a probe
        if self.breakers.try_acquire(work_ref).await.is_err() {
            return Err(TaskError::CircuitBreakerOpen {
                operation: work_ref.to_string(),
            });
        }

        let task = Task::from_options(work_ref.to_string(), args, opts);
        let task_id = task.id;

        match self.resolver.submit(&task).await? {
            ResolutionOutcome::Satisfied => {
                self.emit(
                    EventType::TaskScheduled,
                    json!({"task_id": task_id, "work_ref": work_ref, "priority": task.priority}),
                )
                .await;
                self.enqueue_ready(task).await;
                self.maybe_pass().await;
            }
            ResolutionOutcome::Waiting => {
                self.emit(
                    EventType::TaskScheduled,
                    json!({"task_id": task_id, "work_ref": work_ref, "priority": task.priority}),
                )
                .await;
                self.emit(
                    EventType::TaskWaitingDependencies,
                    json!({"task_id": task_id, "dependencies": task.dependencies}),
                )
                .await;
            }
        }

        self.metrics
            .inc_counter("tasks_scheduled", 1.0, Tags::new())
            .await;
        Ok(task_id)
    }

    async fn enqueue_ready(&self, mut task: Task) {
        task.status = TaskStatus::Ready;
        self.queue.write().await.enqueue(task);
    }

    /// Nudge the drive loop for an early pass; dispatch itself stays in the
    /// loop so submissions never race each other into execution slots
    async fn maybe_pass(&self) {
        let max = self.config.read().await.max_concurrent;
        if self.running.read().await.len() < max {
            let _ = self.pass_tx.try_send(());
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch

    /// Drain the ready queue into available execution slots
    pub async fn schedule_pass(&self) {
        if *self.shutdown.read().await {
            return;
        }
        loop {
            let max = self.config.read().await.max_concurrent;
            let running = self.running.read().await.len();
            if running >= max {
                return;
            }
            let Some(task) = self.queue.write().await.dequeue() else {
                return;
            };
            if !self.dispatch(task).await {
                // Resource pressure: the task went back to the queue and
                // this pass is done
                return;
            }
        }
    }

    /// Start one task; returns false when the pass should stop
    async fn dispatch(&self, mut task: Task) -> bool {
        let allocation = match self.resources.allocate(task.id, &task.resources).await {
            Ok(allocation) => allocation,
            Err(TaskError::InsufficientResources { kind, requested, available }) => {
                debug!(task = %task.id, kind, requested, available, "allocation deferred");
                self.queue.write().await.enqueue(task);
                return false;
            }
            Err(e) => {
                self.emit(
                    EventType::TaskStartFailed,
                    json!({"task_id": task.id, "error": e.to_string()}),
                )
                .await;
                let classification = self.classifier.classify_task_error(&e);
                self.finalize_failed(task, e.to_string(), classification).await;
                return true;
            }
        };

        let Some(handler) = self.handlers.resolve(&task.work_ref).await else {
            self.resources.release(allocation).await;
            let e = TaskError::HandlerNotFound(task.work_ref.clone());
            self.emit(
                EventType::TaskStartFailed,
                json!({"task_id": task.id, "error": e.to_string()}),
            )
            .await;
            let classification = self.classifier.classify_task_error(&e);
            self.finalize_failed(task, e.to_string(), classification).await;
            return true;
        };

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.attempts += 1;

        let grace = self.config.read().await.cancel_grace;
        let handle = TaskExecutor::spawn(
            task.clone(),
            handler,
            self.report_tx.clone(),
            grace,
        );

        self.emit(
            EventType::TaskStarted,
            json!({"task_id": task.id, "attempt": task.attempts}),
        )
        .await;
        self.metrics
            .inc_counter("tasks_started", 1.0, Tags::new())
            .await;

        self.running.write().await.insert(
            task.id,
            RunningEntry {
                task,
                allocation,
                handle,
            },
        );
        true
    }

    // -----------------------------------------------------------------------
    // Completion handling

    async fn handle_report(&self, report: CompletionReport) {
        let Some(entry) = self.running.write().await.remove(&report.task_id) else {
            warn!(task = %report.task_id, "report for unknown running task");
            return;
        };
        self.resources.release(entry.allocation).await;
        let mut task = entry.task;

        match report.outcome.clone() {
            Ok(result) => self.finalize_completed(task, result, &report).await,
            Err(TaskError::Cancelled) => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                self.failed.write().await.insert(task.clone());
                self.emit(EventType::TaskCancelled, json!({"task_id": task.id}))
                    .await;
                self.metrics
                    .inc_counter("tasks_cancelled", 1.0, Tags::new())
                    .await;
                self.schedule_pass().await;
            }
            Err(e) => self.handle_failure(task, e).await,
        }
    }

    async fn finalize_completed(&self, mut task: Task, result: Value, report: &CompletionReport) {
        if let Some(transition) = self.breakers.record_success(&task.work_ref).await {
            self.emit_circuit(&task.work_ref, transition).await;
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(report.finished_at);
        task.result = Some(result);

        let duration_ms = (report.finished_at - report.started_at)
            .num_milliseconds()
            .max(0) as f64;
        self.metrics
            .inc_counter("tasks_completed", 1.0, Tags::new())
            .await;
        self.metrics
            .record_histogram("task_duration_ms", duration_ms, Tags::new())
            .await;

        let task_id = task.id;
        self.completed.write().await.insert(task);
        self.emit(EventType::TaskCompleted, json!({"task_id": task_id}))
            .await;

        // Release dependents in the order completions are observed
        let released = self.resolver.task_completed(task_id).await;
        for ready in released {
            self.emit(
                EventType::DependenciesSatisfied,
                json!({"task_id": ready.id, "completed_dependency": task_id}),
            )
            .await;
            self.enqueue_ready(ready).await;
        }
        self.schedule_pass().await;
    }

    async fn handle_failure(&self, mut task: Task, error: TaskError) {
        if let Some(transition) = self.breakers.record_failure(&task.work_ref).await {
            self.emit_circuit(&task.work_ref, transition).await;
        }

        let message = error.to_string();
        let classification = self.classifier.classify_task_error(&error);
        task.record_error(&message);

        let retry_permitted = should_retry(
            &task.retry,
            task.attempts,
            classification.retryable,
            classification.category,
        );

        if retry_permitted {
            if let Some(mut recovered) = self.recovery.recover(&task, &classification).await {
                let delay = self
                    .retry_delays
                    .delay_for_category(&task.retry, task.attempts, classification.category);
                let recovery_hint = recovered
                    .metadata
                    .get(META_RETRY_DELAY)
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::ZERO);
                let delay = delay.max(recovery_hint);

                recovered.status = TaskStatus::Pending;
                recovered.metadata.insert(
                    META_RETRY_ATTEMPT.to_string(),
                    json!(recovered.attempts),
                );
                recovered.metadata.insert(
                    META_RETRY_DELAY.to_string(),
                    json!(delay.as_millis() as u64),
                );

                self.emit(
                    EventType::TaskRetried,
                    json!({
                        "task_id": recovered.id,
                        "attempt": recovered.attempts,
                        "delay_ms": delay.as_millis() as u64,
                        "category": classification.category,
                    }),
                )
                .await;
                self.metrics
                    .inc_counter("tasks_retried", 1.0, Tags::new())
                    .await;
                debug!(task = %recovered.id, ?delay, "retry scheduled");

                let requeue_tx = self.requeue_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue_tx.send(recovered).await;
                });
                self.schedule_pass().await;
                return;
            }
            // Retry was permitted but no strategy produced a runnable
            // descriptor: terminal, tagged as a recovery failure
            let message = TaskError::RecoveryFailed {
                original: message,
                recovery: format!("{:?}", classification.strategy),
                classification: classification.category,
            }
            .to_string();
            self.finalize_failed(task, message, classification).await;
            self.schedule_pass().await;
            return;
        }

        self.finalize_failed(task, message, classification).await;
        self.schedule_pass().await;
    }

    async fn finalize_failed(
        &self,
        mut task: Task,
        message: String,
        classification: ErrorClassification,
    ) {
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        let history = task.error_history();
        task.error = Some(TaskFailure {
            message: message.clone(),
            category: classification.category,
            severity: classification.severity,
            attempts: task.attempts,
            history,
        });

        if classification.escalate {
            error!(task = %task.id, category = ?classification.category, message, "task failed, escalating");
        } else {
            warn!(task = %task.id, message, "task failed terminally");
        }

        let task_id = task.id;
        self.failed.write().await.insert(task);
        self.emit(
            EventType::TaskFailed,
            json!({
                "task_id": task_id,
                "error": message,
                "category": classification.category,
                "escalate": classification.escalate,
            }),
        )
        .await;
        self.metrics
            .inc_counter("tasks_failed", 1.0, Tags::new())
            .await;
    }

    async fn emit_circuit(&self, operation: &str, transition: CircuitTransition) {
        match transition {
            CircuitTransition::Opened => {
                self.emit(EventType::CircuitOpened, json!({"operation": operation}))
                    .await
            }
            CircuitTransition::Closed => {
                self.emit(EventType::CircuitClosed, json!({"operation": operation}))
                    .await
            }
            CircuitTransition::HalfOpened => {}
        }
    }

    // -----------------------------------------------------------------------
    // Client operations

    /// Cancel a task wherever it currently lives
    pub async fn cancel(&self, id: TaskId) -> TaskResult<()> {
        // Running (or paused): signal the executor; the completion report
        // finalizes state and releases resources
        if let Some(entry) = self.running.read().await.get(&id) {
            entry.handle.signal(ExecutorSignal::Cancel);
            return Ok(());
        }

        // Queued: remove directly
        if let Some(mut task) = self.queue.write().await.remove(id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            self.failed.write().await.insert(task);
            self.emit(EventType::TaskCancelled, json!({"task_id": id}))
                .await;
            self.metrics
                .inc_counter("tasks_cancelled", 1.0, Tags::new())
                .await;
            return Ok(());
        }

        // Waiting on dependencies: remove from the resolver
        if let Some(mut task) = self.resolver.remove_waiting(id).await {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            self.failed.write().await.insert(task);
            self.emit(EventType::TaskCancelled, json!({"task_id": id}))
                .await;
            self.metrics
                .inc_counter("tasks_cancelled", 1.0, Tags::new())
                .await;
            return Ok(());
        }

        Err(TaskError::TaskNotFound(id))
    }

    /// Pause a running task; it stays counted against the concurrency cap
    pub async fn pause(&self, id: TaskId) -> TaskResult<()> {
        let mut running = self.running.write().await;
        let entry = running.get_mut(&id).ok_or(TaskError::TaskNotFound(id))?;
        if entry.task.status == TaskStatus::Paused {
            return Ok(());
        }
        entry.handle.signal(ExecutorSignal::Pause);
        entry.task.status = TaskStatus::Paused;
        drop(running);
        self.emit(EventType::TaskPaused, json!({"task_id": id})).await;
        Ok(())
    }

    /// Resume a paused task
    pub async fn resume(&self, id: TaskId) -> TaskResult<()> {
        let mut running = self.running.write().await;
        let entry = running.get_mut(&id).ok_or(TaskError::TaskNotFound(id))?;
        if entry.task.status != TaskStatus::Paused {
            return Ok(());
        }
        entry.handle.signal(ExecutorSignal::Resume);
        entry.task.status = TaskStatus::Running;
        drop(running);
        self.emit(EventType::TaskResumed, json!({"task_id": id})).await;
        Ok(())
    }

    /// Current envelope for a task, wherever it lives
    pub async fn status(&self, id: TaskId) -> TaskResult<Task> {
        if let Some(entry) = self.running.read().await.get(&id) {
            return Ok(entry.task.clone());
        }
        if let Some(task) = self.queue.read().await.list().into_iter().find(|t| t.id == id) {
            return Ok(task);
        }
        if let Some(task) = self.resolver.waiting_task(id).await {
            return Ok(task);
        }
        if let Some(task) = self.completed.read().await.get(&id) {
            return Ok(task.clone());
        }
        if let Some(task) = self.failed.read().await.get(&id) {
            return Ok(task.clone());
        }
        Err(TaskError::TaskNotFound(id))
    }

    /// Envelopes matching `filter`, or every known envelope
    pub async fn list(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        tasks.extend(self.running.read().await.values().map(|e| e.task.clone()));
        tasks.extend(self.queue.read().await.list());
        for id in self.resolver.waiting_ids().await {
            if let Some(task) = self.resolver.waiting_task(id).await {
                tasks.push(task);
            }
        }
        tasks.extend(self.completed.read().await.values().cloned());
        tasks.extend(self.failed.read().await.values().cloned());
        match filter {
            Some(status) => tasks.into_iter().filter(|t| t.status == status).collect(),
            None => tasks,
        }
    }

    /// Scheduler state summary
    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let running = self.running.read().await;
        let paused = running
            .values()
            .filter(|e| e.task.status == TaskStatus::Paused)
            .count();
        SchedulerSnapshot {
            name: self.config.read().await.name.clone(),
            running: running.len(),
            paused,
            waiting: self.resolver.waiting_ids().await.len(),
            completed: self.completed.read().await.len(),
            failed: self.failed.read().await.len(),
            max_concurrent: self.config.read().await.max_concurrent,
            queue: self.queue.read().await.stats(),
        }
    }

    /// Apply runtime configuration changes from a key/value map
    ///
    /// Recognized keys: `max_concurrent`, `queue_limit` (null clears the
    /// ceiling), `tick_interval_ms`. Unknown keys are ignored with a warning.
    pub async fn update_config(&self, changes: &serde_json::Map<String, Value>) -> TaskResult<()> {
        let mut config = self.config.write().await;
        for (key, value) in changes {
            match key.as_str() {
                "max_concurrent" => {
                    let n = value
                        .as_u64()
                        .ok_or_else(|| TaskError::InvalidArguments(key.clone()))?;
                    config.max_concurrent = n.max(1) as usize;
                }
                "queue_limit" => {
                    config.queue_limit = if value.is_null() {
                        None
                    } else {
                        Some(
                            value
                                .as_u64()
                                .ok_or_else(|| TaskError::InvalidArguments(key.clone()))?
                                as usize,
                        )
                    };
                }
                "tick_interval_ms" => {
                    let ms = value
                        .as_u64()
                        .ok_or_else(|| TaskError::InvalidArguments(key.clone()))?;
                    config.tick_interval = Duration::from_millis(ms.max(1));
                }
                other => warn!(key = other, "ignoring unknown config key"),
            }
        }
        info!(max_concurrent = config.max_concurrent, "scheduler config updated");
        Ok(())
    }

    /// Switch the ready queue to a different ordering strategy
    pub async fn set_strategy(&self, strategy: QueueStrategy) {
        self.queue.write().await.change_strategy(strategy);
        self.config.write().await.queue_strategy = strategy;
    }

    /// Stop intake and drain running tasks within the shutdown budget
    pub async fn shutdown(&self) {
        info!("scheduler shutdown requested");
        *self.shutdown.write().await = true;

        let wait = self.config.read().await.shutdown_wait;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.running.read().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown wait elapsed, cancelling stragglers");
                for entry in self.running.read().await.values() {
                    entry.handle.signal(ExecutorSignal::Cancel);
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("scheduler shutdown complete");
    }

    /// Publish an alert transition on the event stream
    pub async fn publish_alert(&self, transition: &crate::alerts::AlertTransition) {
        let event_type = if transition.fired {
            EventType::AlertTriggered
        } else {
            EventType::AlertResolved
        };
        self.emit(
            event_type,
            json!({
                "rule": transition.rule,
                "severity": transition.severity,
                "value": transition.value,
                "threshold": transition.threshold,
            }),
        )
        .await;
    }

    async fn emit(&self, event_type: EventType, data: Value) {
        let name = self.config.read().await.name.clone();
        // Send errors mean no subscribers; events are best-effort
        let _ = self.events.send(SchedulerEvent::new(&name, event_type, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::SystemClock;
    use crate::executor::TaskHandler;
    use crate::metrics::MetricsConfig;
    use crate::resource_manager::ResourceManagerConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn invoke(&self, _args: &[Value]) -> TaskResult<Value> {
            Ok(json!("ok"))
        }
    }

    async fn scheduler() -> Arc<TaskScheduler> {
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("noop", Arc::new(NoopHandler)).await;
        Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            Arc::new(DependencyResolver::new()),
            Arc::new(ResourceManager::new(ResourceManagerConfig::default())),
            Arc::new(CircuitBreakerRegistry::new(
                CircuitBreakerConfig::default(),
                Arc::new(SystemClock),
            )),
            handlers,
            Arc::new(RecoveryManager::new()),
            Arc::new(MetricsCollector::new(MetricsConfig::default())),
            Arc::new(RetryDelayCalculator::with_seed(7)),
        ))
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_work_ref() {
        let scheduler = scheduler().await;
        let result = scheduler.submit("  ", vec![], SubmitOptions::default()).await;
        assert!(matches!(result, Err(TaskError::InvalidTask(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_zero_timeout() {
        let scheduler = scheduler().await;
        let opts = SubmitOptions {
            timeout_ms: 0,
            ..SubmitOptions::default()
        };
        let result = scheduler.submit("noop", vec![], opts).await;
        assert!(matches!(result, Err(TaskError::InvalidTimeout(_))));
    }

    #[tokio::test]
    async fn test_queue_limit_backpressure() {
        let scheduler = scheduler().await;
        scheduler
            .update_config(
                json!({"queue_limit": 2})
                    .as_object()
                    .unwrap(),
            )
            .await
            .unwrap();

        // Without the drive loop running, submissions pile up in the queue
        scheduler
            .submit("noop", vec![], SubmitOptions::default())
            .await
            .unwrap();
        scheduler
            .submit("noop", vec![], SubmitOptions::default())
            .await
            .unwrap();
        let third = scheduler.submit("noop", vec![], SubmitOptions::default()).await;
        assert!(matches!(third, Err(TaskError::QueueFull(2))));
    }

    #[tokio::test]
    async fn test_status_unknown_id() {
        let scheduler = scheduler().await;
        let result = scheduler.status(Uuid::new_v4()).await;
        assert!(matches!(result, Err(TaskError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_unknown_id() {
        let scheduler = scheduler().await;
        let result = scheduler.cancel(Uuid::new_v4()).await;
        assert!(matches!(result, Err(TaskError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_waiting_task() {
        let scheduler = scheduler().await;
        let gate = Uuid::new_v4();
        let opts = SubmitOptions {
            dependencies: vec![gate],
            ..SubmitOptions::default()
        };
        let id = scheduler.submit("noop", vec![], opts).await.unwrap();
        assert_eq!(scheduler.status(id).await.unwrap().status, TaskStatus::Pending);

        scheduler.cancel(id).await.unwrap();
        assert_eq!(
            scheduler.status(id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_update_config_changes_cap() {
        let scheduler = scheduler().await;
        scheduler
            .update_config(json!({"max_concurrent": 2}).as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(scheduler.snapshot().await.max_concurrent, 2);

        let bad = scheduler
            .update_config(json!({"max_concurrent": "lots"}).as_object().unwrap())
            .await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_set_strategy_preserves_queue() {
        let scheduler = scheduler().await;
        for _ in 0..20 {
            scheduler
                .submit("noop", vec![], SubmitOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(scheduler.snapshot().await.queue.depth, 20);
        scheduler.set_strategy(QueueStrategy::Deadline).await;
        assert_eq!(scheduler.snapshot().await.queue.depth, 20);
    }

    #[tokio::test]
    async fn test_event_subscription_sees_submission() {
        let scheduler = scheduler().await;
        let mut events = scheduler.subscribe();
        scheduler
            .submit("noop", vec![], SubmitOptions::default())
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::TaskScheduled);
        assert_eq!(event.scheduler_name, "taskfabric");
    }
}
