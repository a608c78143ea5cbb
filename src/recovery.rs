//! # Recovery Manager - Classified-Error Recovery Strategies
//!
//! Given a failed task and its classified error, selects a recovery strategy
//! and produces a modified descriptor for re-scheduling. The strategy table
//! is a registry keyed by classification, with custom strategies registrable
//! at runtime keyed by error pattern; pattern entries take precedence over
//! the category defaults.

use crate::error_classifier::ErrorClassification;
use crate::types::{ErrorCategory, Task, META_RECOVERY_APPLIED, META_RETRY_DELAY};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Hard ceiling applied when a recovery extends a task timeout
const MAX_EXTENDED_TIMEOUT: Duration = Duration::from_secs(300);

/// Factor applied to resource amounts by resource recovery
const RESOURCE_REDUCTION_FACTOR: f64 = 0.8;

/// Delay inserted by dependency recovery before the next attempt
const DEPENDENCY_RETRY_DELAY_MS: u64 = 500;

/// A recovery strategy: maps (task, classification) to a modified descriptor
///
/// Returning `None` means the strategy could not produce a runnable
/// descriptor and the failure is terminal.
pub type RecoveryFn =
    Arc<dyn Fn(&Task, &ErrorClassification) -> Option<Task> + Send + Sync>;

/// Recovery outcome counters
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RecoveryStats {
    pub total_recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub average_recovery_time_us: f64,
}

/// Owner of the recovery strategy registry
pub struct RecoveryManager {
    /// Custom strategies keyed by classification pattern
    custom: RwLock<HashMap<String, RecoveryFn>>,
    stats: RwLock<RecoveryStats>,
    /// Optional hook invoked for system-category failures
    system_hook: RwLock<Option<RecoveryFn>>,
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(HashMap::new()),
            stats: RwLock::new(RecoveryStats::default()),
            system_hook: RwLock::new(None),
        }
    }

    /// Register a custom strategy for a classification pattern
    pub async fn register_strategy(&self, pattern: impl Into<String>, strategy: RecoveryFn) {
        self.custom.write().await.insert(pattern.into(), strategy);
    }

    /// Install the system-level recovery hook
    pub async fn set_system_hook(&self, hook: RecoveryFn) {
        *self.system_hook.write().await = Some(hook);
    }

    /// Attempt recovery; returns the modified descriptor to re-schedule
    pub async fn recover(
        &self,
        task: &Task,
        classification: &ErrorClassification,
    ) -> Option<Task> {
        let started = Instant::now();
        {
            let mut stats = self.stats.write().await;
            stats.total_recovery_attempts += 1;
        }

        let recovered = self.apply(task, classification).await;

        let elapsed_us = started.elapsed().as_micros() as f64;
        let mut stats = self.stats.write().await;
        if recovered.is_some() {
            stats.successful_recoveries += 1;
        } else {
            stats.failed_recoveries += 1;
        }
        let n = stats.total_recovery_attempts as f64;
        stats.average_recovery_time_us =
            stats.average_recovery_time_us + (elapsed_us - stats.average_recovery_time_us) / n;
        drop(stats);

        match &recovered {
            Some(_) => debug!(task = %task.id, pattern = %classification.pattern, "recovery produced descriptor"),
            None => warn!(task = %task.id, pattern = %classification.pattern, "recovery declined"),
        }
        recovered
    }

    async fn apply(&self, task: &Task, classification: &ErrorClassification) -> Option<Task> {
        if let Some(strategy) = self.custom.read().await.get(&classification.pattern) {
            return strategy(task, classification);
        }

        if matches!(
            classification.strategy,
            crate::types::StrategyKind::NoRetry | crate::types::StrategyKind::EscalateAndFail
        ) {
            return None;
        }

        match classification.category {
            ErrorCategory::Timeout => Some(extend_timeout(task)),
            ErrorCategory::Resource => Some(reduce_resources(task)),
            ErrorCategory::Dependency => Some(delay_for_dependencies(task)),
            ErrorCategory::Transient | ErrorCategory::Network | ErrorCategory::Unknown => {
                // Backoff itself is computed by the retry calculator; the
                // strategy only marks the descriptor
                Some(mark_recovered(task.clone(), "exponential_backoff"))
            }
            ErrorCategory::System => {
                let hook = self.system_hook.read().await;
                match hook.as_ref() {
                    Some(hook) => hook(task, classification),
                    None => None,
                }
            }
            ErrorCategory::Permanent | ErrorCategory::Validation => None,
        }
    }

    pub async fn stats(&self) -> RecoveryStats {
        self.stats.read().await.clone()
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let _ = self.custom.read().await;
        Ok(())
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

fn mark_recovered(mut task: Task, strategy: &str) -> Task {
    task.metadata.insert(
        META_RECOVERY_APPLIED.to_string(),
        Value::String(strategy.to_string()),
    );
    task
}

/// Timeout recovery: double the budget, capped at five minutes
fn extend_timeout(task: &Task) -> Task {
    let mut task = task.clone();
    let extended = (task.timeout * 2).min(MAX_EXTENDED_TIMEOUT);
    info!(task = %task.id, from = ?task.timeout, to = ?extended, "extending timeout");
    task.timeout = extended;
    mark_recovered(task, "extend_timeout")
}

/// Resource recovery: shrink every requested amount
fn reduce_resources(task: &Task) -> Task {
    let mut task = task.clone();
    for request in &mut task.resources {
        request.amount *= RESOURCE_REDUCTION_FACTOR;
    }
    mark_recovered(task, "reduce_resources")
}

/// Dependency recovery: small delay so upstream state can settle; the
/// resolver revalidates prerequisites when the descriptor is resubmitted
fn delay_for_dependencies(task: &Task) -> Task {
    let mut task = task.clone();
    task.metadata.insert(
        META_RETRY_DELAY.to_string(),
        json!(DEPENDENCY_RETRY_DELAY_MS),
    );
    mark_recovered(task, "revalidate_dependencies")
}
