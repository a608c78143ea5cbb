//! # Task Executor - Single-Task Invocation with Timeout and Signals
//!
//! One executor runs per dispatched task. It resolves the task's opaque work
//! reference against the handler registry, enforces the wall-clock timeout,
//! catches handler panics, and honors pause/resume/cancel signals. Every
//! executor reports its outcome to the scheduler exactly once, over an
//! asynchronous channel, so task execution never blocks scheduler progress.

use crate::types::{Task, TaskError, TaskId, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capability surface implemented by concrete work handlers
///
/// The scheduler sees only an opaque work reference plus an argument tuple;
/// registered handlers give those references meaning.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the work; errors are classified by the resilience layer
    async fn invoke(&self, args: &[Value]) -> TaskResult<Value>;

    /// Feature probe for optional handler capabilities
    fn supports(&self, _feature: &str) -> bool {
        false
    }
}

/// Named registry resolving work references to handlers
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, work_ref: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().await.insert(work_ref.into(), handler);
    }

    pub async fn resolve(&self, work_ref: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(work_ref).cloned()
    }

    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Control signals accepted by a running executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorSignal {
    Pause,
    Resume,
    Cancel,
}

/// Outcome reported back to the scheduler, exactly once per executor
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub outcome: TaskResult<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 1-based attempt index this execution represents
    pub attempt: u32,
}

/// Handle kept by the scheduler for one running executor
pub struct ExecutorHandle {
    pub task_id: TaskId,
    signal_tx: async_channel::Sender<ExecutorSignal>,
    join: JoinHandle<()>,
}

impl ExecutorHandle {
    pub fn signal(&self, signal: ExecutorSignal) {
        // A full or closed signal channel means the executor already finished
        let _ = self.signal_tx.try_send(signal);
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawns and drives one task execution
pub struct TaskExecutor;

impl TaskExecutor {
    /// Spawn an executor for `task`
    ///
    /// The handler runs in its own spawned task so panics surface as join
    /// errors instead of tearing down the executor. Cancellation is
    /// cooperative first: the handler gets `cancel_grace` to finish before
    /// it is aborted.
    pub fn spawn(
        task: Task,
        handler: Arc<dyn TaskHandler>,
        report_tx: async_channel::Sender<CompletionReport>,
        cancel_grace: Duration,
    ) -> ExecutorHandle {
        let (signal_tx, signal_rx) = async_channel::bounded(8);
        let task_id = task.id;
        let attempt = task.attempts;

        let join = tokio::spawn(async move {
            let started_at = Utc::now();
            let outcome = Self::run(&task, handler, signal_rx, cancel_grace).await;
            let report = CompletionReport {
                task_id,
                outcome,
                started_at,
                finished_at: Utc::now(),
                attempt,
            };
            if report_tx.send(report).await.is_err() {
                warn!(task = %task_id, "scheduler gone before completion report");
            }
        });

        ExecutorHandle {
            task_id,
            signal_tx,
            join,
        }
    }

    async fn run(
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        signal_rx: async_channel::Receiver<ExecutorSignal>,
        cancel_grace: Duration,
    ) -> TaskResult<Value> {
        let args = task.args.clone();
        let mut work = tokio::spawn(async move { handler.invoke(&args).await });

        // Absolute deadline: pausing does not stop the wall clock
        let deadline = tokio::time::Instant::now() + task.timeout;
        let mut finished: Option<TaskResult<Value>> = None;
        let mut paused = false;

        loop {
            tokio::select! {
                result = &mut work, if finished.is_none() => {
                    let outcome = Self::unwrap_join(result);
                    if paused {
                        // Hold the report until the client resumes
                        finished = Some(outcome);
                    } else {
                        return outcome;
                    }
                }
                signal = signal_rx.recv() => {
                    match signal {
                        Ok(ExecutorSignal::Pause) => {
                            debug!(task = %task.id, "executor paused");
                            paused = true;
                        }
                        Ok(ExecutorSignal::Resume) => {
                            debug!(task = %task.id, "executor resumed");
                            paused = false;
                            if let Some(outcome) = finished.take() {
                                return outcome;
                            }
                        }
                        Ok(ExecutorSignal::Cancel) => {
                            return Self::cancel(task.id, &mut work, finished.is_some(), cancel_grace)
                                .await;
                        }
                        Err(_) => {
                            // Scheduler dropped the handle; finish the work
                            return match finished.take() {
                                Some(outcome) => outcome,
                                None => Self::unwrap_join((&mut work).await),
                            };
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if finished.is_none() => {
                    work.abort();
                    return Err(TaskError::ExecutionTimeout(task.timeout));
                }
            }
        }
    }

    /// Cooperative cancel with a forced abort after the grace period
    async fn cancel(
        task_id: TaskId,
        work: &mut JoinHandle<TaskResult<Value>>,
        already_finished: bool,
        grace: Duration,
    ) -> TaskResult<Value> {
        if already_finished {
            // Work already done while paused; cancellation wins
            return Err(TaskError::Cancelled);
        }
        match tokio::time::timeout(grace, &mut *work).await {
            Ok(_) => Err(TaskError::Cancelled),
            Err(_) => {
                warn!(task = %task_id, "cancel grace elapsed, aborting");
                work.abort();
                Err(TaskError::Cancelled)
            }
        }
    }

    fn unwrap_join(result: Result<TaskResult<Value>, tokio::task::JoinError>) -> TaskResult<Value> {
        match result {
            Ok(outcome) => outcome,
            Err(join_error) if join_error.is_panic() => {
                let message = join_error
                    .into_panic()
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(TaskError::ExecutionPanic(message))
            }
            Err(_) => Err(TaskError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubmitOptions;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn invoke(&self, args: &[Value]) -> TaskResult<Value> {
            Ok(json!({ "echo": args }))
        }

        fn supports(&self, feature: &str) -> bool {
            feature == "echo"
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn invoke(&self, _args: &[Value]) -> TaskResult<Value> {
            tokio::time::sleep(self.0).await;
            Ok(json!("done"))
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl TaskHandler for PanicHandler {
        async fn invoke(&self, _args: &[Value]) -> TaskResult<Value> {
            panic!("handler blew up");
        }
    }

    fn test_task(timeout_ms: u64) -> Task {
        Task::from_options(
            "work".to_string(),
            vec![json!(1)],
            SubmitOptions {
                timeout_ms,
                ..SubmitOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_successful_execution_reports_once() {
        let (tx, rx) = async_channel::unbounded();
        let task = test_task(5_000);
        let id = task.id;
        TaskExecutor::spawn(task, Arc::new(EchoHandler), tx, Duration::from_secs(1));

        let report = rx.recv().await.unwrap();
        assert_eq!(report.task_id, id);
        assert!(report.outcome.is_ok());
        // Channel drains exactly one report
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let (tx, rx) = async_channel::unbounded();
        let task = test_task(50);
        TaskExecutor::spawn(
            task,
            Arc::new(SlowHandler(Duration::from_secs(10))),
            tx,
            Duration::from_millis(10),
        );

        let report = rx.recv().await.unwrap();
        assert!(matches!(
            report.outcome,
            Err(TaskError::ExecutionTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let (tx, rx) = async_channel::unbounded();
        TaskExecutor::spawn(
            test_task(5_000),
            Arc::new(PanicHandler),
            tx,
            Duration::from_secs(1),
        );

        let report = rx.recv().await.unwrap();
        assert!(matches!(report.outcome, Err(TaskError::ExecutionPanic(_))));
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let (tx, rx) = async_channel::unbounded();
        let handle = TaskExecutor::spawn(
            test_task(60_000),
            Arc::new(SlowHandler(Duration::from_secs(30))),
            tx,
            Duration::from_millis(20),
        );

        handle.signal(ExecutorSignal::Cancel);
        let report = rx.recv().await.unwrap();
        assert!(matches!(report.outcome, Err(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn test_pause_defers_completion_until_resume() {
        let (tx, rx) = async_channel::unbounded();
        let handle = TaskExecutor::spawn(
            test_task(60_000),
            Arc::new(SlowHandler(Duration::from_millis(50))),
            tx,
            Duration::from_secs(1),
        );

        handle.signal(ExecutorSignal::Pause);
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Work finished while paused; no report yet
        assert!(rx.try_recv().is_err());

        handle.signal(ExecutorSignal::Resume);
        let report = rx.recv().await.unwrap();
        assert!(report.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_registry_resolution() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler)).await;

        let handler = registry.resolve("echo").await.unwrap();
        assert!(handler.supports("echo"));
        assert!(!handler.supports("other"));
        assert!(registry.resolve("missing").await.is_none());
        assert_eq!(registry.registered().await, vec!["echo".to_string()]);
    }
}
