//! # Core Types - Task Descriptors, Status Machine, and Error Taxonomy
//!
//! This module defines the data model shared by every subsystem of the
//! execution substrate: the task descriptor and its mutable status envelope,
//! priority and lifecycle enums, retry policy, resource requests, the uniform
//! boundary error taxonomy, and the event stream payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Unique identifier for resource allocations
pub type AllocationId = Uuid;

/// Metadata key recording the current retry attempt index
pub const META_RETRY_ATTEMPT: &str = "retry_attempt";
/// Metadata key accumulating error messages across attempts
pub const META_PREVIOUS_ERRORS: &str = "previous_errors";
/// Metadata key recording the recovery strategy applied to a descriptor
pub const META_RECOVERY_APPLIED: &str = "recovery_applied";
/// Metadata key recording the delay computed for the pending retry
pub const META_RETRY_DELAY: &str = "retry_delay";

/// Priority levels for tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// Weight used by resource-aware queue scoring
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Critical => 8.0,
            Priority::High => 4.0,
            Priority::Medium => 2.0,
            Priority::Low => 1.0,
        }
    }

    /// All priorities from most to least urgent
    pub fn all() -> [Priority; 4] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ]
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Task lifecycle status
///
/// Transitions follow pending → (ready → running → (completed | failed |
/// cancelled)) with the intermediate paused ↔ running loop. Terminal states
/// never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, prerequisites not yet satisfied
    Pending,
    /// Prerequisites satisfied, waiting in the queue
    Ready,
    /// Executing under a resource allocation
    Running,
    /// Execution suspended by client request
    Paused,
    /// Finished with a result
    Completed,
    /// Finished with an error after exhausting retries
    Failed,
    /// Stopped by client request, carries no error
    Cancelled,
}

impl TaskStatus {
    /// Whether this status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Broad classification buckets for observed errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Network,
    Transient,
    Resource,
    Permanent,
    Validation,
    Dependency,
    System,
    Unknown,
}

/// Severity of a classified error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recovery strategy selected by classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ExponentialBackoff,
    SimpleRetry,
    NoRetry,
    ResourceCleanupRetry,
    EscalateAndFail,
    DependencyRetry,
    CautiousRetry,
    SystemRecovery,
}

/// Retry behavior attached to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total execution attempts permitted, including the first
    pub max_attempts: u32,
    /// Base delay before the first retry
    pub base_delay_ms: u64,
    /// Cap applied to every computed delay
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt; >= 1.0
    pub backoff_factor: f64,
    /// Fraction of the exponential term used as the jitter band; in [0, 1]
    pub jitter_factor: f64,
    /// Error categories eligible for retry
    pub retry_on: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            retry_on: vec![
                ErrorCategory::Timeout,
                ErrorCategory::Transient,
                ErrorCategory::Resource,
                ErrorCategory::Dependency,
            ],
        }
    }
}

/// A single (kind, amount) resource requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub kind: String,
    pub amount: f64,
}

impl ResourceRequest {
    pub fn new(kind: impl Into<String>, amount: f64) -> Self {
        Self {
            kind: kind.into(),
            amount,
        }
    }
}

/// Terminal failure details exposed through `status()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Message of the final error
    pub message: String,
    /// Category assigned by the classifier
    pub category: ErrorCategory,
    /// Severity assigned by the classifier
    pub severity: ErrorSeverity,
    /// Execution attempts consumed
    pub attempts: u32,
    /// Messages of every observed error, oldest first
    pub history: Vec<String>,
}

/// A unit of deferred work: immutable descriptor plus mutable status envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Opaque key resolved to a registered handler by the executor
    pub work_ref: String,
    /// Opaque argument tuple; the core does not interpret these
    pub args: Vec<Value>,
    pub priority: Priority,
    /// Wall-clock execution budget per attempt
    pub timeout: Duration,
    /// Absolute deadline; when absent, `created_at + timeout` is used
    pub deadline: Option<DateTime<Utc>>,
    /// Tasks that must complete before this one becomes runnable
    pub dependencies: Vec<TaskId>,
    /// Ordered resource reservations required while running
    pub resources: Vec<ResourceRequest>,
    pub retry: RetryPolicy,
    pub metadata: HashMap<String, Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Result slot; mutually exclusive with `error`
    pub result: Option<Value>,
    /// Error slot; mutually exclusive with `result`
    pub error: Option<TaskFailure>,
    /// Execution attempts started so far
    pub attempts: u32,
}

impl Task {
    /// Build a descriptor from validated submission options
    pub fn from_options(work_ref: String, args: Vec<Value>, opts: SubmitOptions) -> Self {
        Self {
            id: opts.task_id.unwrap_or_else(Uuid::new_v4),
            work_ref,
            args,
            priority: opts.priority,
            timeout: Duration::from_millis(opts.timeout_ms),
            deadline: opts.deadline,
            dependencies: opts.dependencies,
            resources: opts.resources,
            retry: opts.retry,
            metadata: opts.metadata,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    /// Deadline used for ordering: explicit deadline or created_at + timeout
    pub fn effective_deadline(&self) -> DateTime<Utc> {
        self.deadline.unwrap_or_else(|| {
            self.created_at
                + chrono::Duration::milliseconds(self.timeout.as_millis() as i64)
        })
    }

    /// Sum of requested resource amounts across all kinds
    pub fn total_resource_demand(&self) -> f64 {
        self.resources.iter().map(|r| r.amount).sum()
    }

    /// Append an error message to the bounded per-task error history
    pub fn record_error(&mut self, message: &str) {
        let history = self
            .metadata
            .entry(META_PREVIOUS_ERRORS.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = history {
            items.push(Value::String(message.to_string()));
            if items.len() > 32 {
                items.remove(0);
            }
        }
    }

    /// Error messages accumulated across attempts, oldest first
    pub fn error_history(&self) -> Vec<String> {
        match self.metadata.get(META_PREVIOUS_ERRORS) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Options accepted by `submit`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitOptions {
    /// Client-supplied task id; generated when absent
    pub task_id: Option<TaskId>,
    pub priority: Priority,
    /// Execution budget in milliseconds; must be positive
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: Vec<TaskId>,
    pub resources: Vec<ResourceRequest>,
    pub retry: RetryPolicy,
    pub metadata: HashMap<String, Value>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            priority: Priority::Medium,
            timeout_ms: 30_000,
            deadline: None,
            dependencies: Vec::new(),
            resources: Vec::new(),
            retry: RetryPolicy::default(),
            metadata: HashMap::new(),
        }
    }
}

/// Uniform tagged error values crossing the library boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("circular dependency: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<TaskId> },

    #[error("insufficient resources: kind={kind} requested={requested} available={available}")]
    InsufficientResources {
        kind: String,
        requested: f64,
        available: f64,
    },

    #[error("allocation plan exceeds available resources")]
    PlanExceedsAvailableResources,

    #[error("circuit breaker open for operation: {operation}")]
    CircuitBreakerOpen { operation: String },

    #[error("permanent failure: {classification:?}")]
    PermanentFailure { classification: ErrorCategory },

    #[error("recovery failed for {original}: {recovery} ({classification:?})")]
    RecoveryFailed {
        original: String,
        recovery: String,
        classification: ErrorCategory,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("queue full: limit={0}")]
    QueueFull(usize),

    #[error("handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("task timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("task panicked: {0}")]
    ExecutionPanic(String),

    #[error("task execution failed: {0}")]
    ExecutionFailed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for substrate operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Event types published on the scheduler event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskScheduled,
    TaskWaitingDependencies,
    TaskStarted,
    TaskPaused,
    TaskResumed,
    TaskCancelled,
    TaskCompleted,
    TaskFailed,
    TaskRetried,
    TaskStartFailed,
    DependenciesSatisfied,
    CircuitOpened,
    CircuitClosed,
    AlertTriggered,
    AlertResolved,
}

/// Event published to subscribers of the scheduler event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub scheduler_name: String,
}

impl SchedulerEvent {
    pub fn new(scheduler_name: &str, event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
            scheduler_name: scheduler_name.to_string(),
        }
    }
}

/// Health status for service components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded { issues: Vec<String> },
    Unhealthy { issues: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_submit_options_validation() {
        let opts = SubmitOptions::default();
        assert!(opts.validate().is_ok());

        let bad = SubmitOptions {
            timeout_ms: 0,
            ..SubmitOptions::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_effective_deadline_synthesis() {
        let task = Task::from_options(
            "echo".to_string(),
            vec![],
            SubmitOptions {
                timeout_ms: 5_000,
                ..SubmitOptions::default()
            },
        );
        let expected = task.created_at + chrono::Duration::milliseconds(5_000);
        assert_eq!(task.effective_deadline(), expected);

        let explicit = Utc::now() + chrono::Duration::hours(1);
        let task = Task::from_options(
            "echo".to_string(),
            vec![],
            SubmitOptions {
                deadline: Some(explicit),
                ..SubmitOptions::default()
            },
        );
        assert_eq!(task.effective_deadline(), explicit);
    }

    #[test]
    fn test_error_history_bounded() {
        let mut task = Task::from_options("echo".to_string(), vec![], SubmitOptions::default());
        for i in 0..40 {
            task.record_error(&format!("error {i}"));
        }
        let history = task.error_history();
        assert_eq!(history.len(), 32);
        assert_eq!(history.last().unwrap(), "error 39");
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = SchedulerEvent::new(
            "test",
            EventType::TaskScheduled,
            serde_json::json!({"task_id": "abc"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_scheduled");
        assert_eq!(json["scheduler_name"], "test");
    }
}
