//! # Alert Manager - Threshold Rules over Collected Metrics
//!
//! Evaluates registered threshold rules against the metrics collector on a
//! cadence. Crossing a threshold raises an alert; dropping back below it
//! resolves the alert. Transitions are returned to the caller so the
//! scheduler can publish `alert_triggered` / `alert_resolved` events, and a
//! bounded history is kept for diagnostics.

use crate::metrics::{MetricsCollector, Tags};
use crate::types::ErrorSeverity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Comparison applied between the observed value and the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Comparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterThanOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessThanOrEqual => value <= threshold,
        }
    }
}

/// Source series a rule reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One threshold rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule name; also the alert name in events
    pub name: String,
    pub metric: String,
    pub tags: Tags,
    pub kind: MetricKind,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: ErrorSeverity,
}

/// An alert firing or resolving
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTransition {
    pub rule: String,
    pub severity: ErrorSeverity,
    pub fired: bool,
    pub value: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

/// Alert manager configuration
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    pub evaluation_interval: Duration,
    pub history_limit: usize,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(15),
            history_limit: 200,
        }
    }
}

/// Owner of alert rules and firing state
pub struct AlertManager {
    config: AlertManagerConfig,
    rules: RwLock<HashMap<String, AlertRule>>,
    firing: RwLock<HashMap<String, AlertTransition>>,
    history: RwLock<VecDeque<AlertTransition>>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        Self {
            config,
            rules: RwLock::new(HashMap::new()),
            firing: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn evaluation_interval(&self) -> Duration {
        self.config.evaluation_interval
    }

    /// Register or replace a rule by name
    pub async fn register_rule(&self, rule: AlertRule) {
        self.rules.write().await.insert(rule.name.clone(), rule);
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        self.rules.write().await.remove(name).is_some()
    }

    /// Evaluate every rule against `collector`, returning transitions
    pub async fn evaluate_once(&self, collector: &Arc<MetricsCollector>) -> Vec<AlertTransition> {
        let rules: Vec<AlertRule> = self.rules.read().await.values().cloned().collect();
        let mut transitions = Vec::new();

        for rule in rules {
            let value = match rule.kind {
                MetricKind::Counter => collector.counter_value(&rule.metric, &rule.tags).await,
                MetricKind::Gauge => collector
                    .gauge_value(&rule.metric, &rule.tags)
                    .await
                    .unwrap_or(0.0),
            };
            let breached = rule.comparison.holds(value, rule.threshold);
            let currently_firing = self.firing.read().await.contains_key(&rule.name);

            if breached && !currently_firing {
                let transition = AlertTransition {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    fired: true,
                    value,
                    threshold: rule.threshold,
                    at: Utc::now(),
                };
                warn!(rule = %rule.name, value, threshold = rule.threshold, "alert triggered");
                self.firing
                    .write()
                    .await
                    .insert(rule.name.clone(), transition.clone());
                transitions.push(transition);
            } else if !breached && currently_firing {
                let transition = AlertTransition {
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    fired: false,
                    value,
                    threshold: rule.threshold,
                    at: Utc::now(),
                };
                info!(rule = %rule.name, value, "alert resolved");
                self.firing.write().await.remove(&rule.name);
                transitions.push(transition);
            }
        }

        if !transitions.is_empty() {
            let mut history = self.history.write().await;
            for transition in &transitions {
                history.push_back(transition.clone());
            }
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        transitions
    }

    /// Currently firing alerts
    pub async fn firing(&self) -> Vec<AlertTransition> {
        self.firing.read().await.values().cloned().collect()
    }

    /// Bounded transition history, oldest first
    pub async fn history(&self) -> Vec<AlertTransition> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let _ = self.rules.read().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsConfig;

    fn rule(name: &str, metric: &str, comparison: Comparison, threshold: f64) -> AlertRule {
        AlertRule {
            name: name.to_string(),
            metric: metric.to_string(),
            tags: Tags::new(),
            kind: MetricKind::Gauge,
            comparison,
            threshold,
            severity: ErrorSeverity::High,
        }
    }

    #[tokio::test]
    async fn test_alert_fires_and_resolves() {
        let collector = Arc::new(MetricsCollector::new(MetricsConfig::default()));
        let alerts = AlertManager::new(AlertManagerConfig::default());
        alerts
            .register_rule(rule("deep_queue", "queue_depth", Comparison::GreaterThan, 10.0))
            .await;

        collector.set_gauge("queue_depth", 5.0, Tags::new()).await;
        assert!(alerts.evaluate_once(&collector).await.is_empty());

        collector.set_gauge("queue_depth", 15.0, Tags::new()).await;
        let transitions = alerts.evaluate_once(&collector).await;
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].fired);
        assert_eq!(alerts.firing().await.len(), 1);

        // Still breached: no duplicate trigger
        assert!(alerts.evaluate_once(&collector).await.is_empty());

        collector.set_gauge("queue_depth", 3.0, Tags::new()).await;
        let transitions = alerts.evaluate_once(&collector).await;
        assert_eq!(transitions.len(), 1);
        assert!(!transitions[0].fired);
        assert!(alerts.firing().await.is_empty());
    }

    #[tokio::test]
    async fn test_counter_rules() {
        let collector = Arc::new(MetricsCollector::new(MetricsConfig::default()));
        let alerts = AlertManager::new(AlertManagerConfig::default());
        let mut failures = rule("failures", "tasks_failed", Comparison::GreaterThanOrEqual, 3.0);
        failures.kind = MetricKind::Counter;
        alerts.register_rule(failures).await;

        for _ in 0..3 {
            collector.inc_counter("tasks_failed", 1.0, Tags::new()).await;
        }
        let transitions = alerts.evaluate_once(&collector).await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].value, 3.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let collector = Arc::new(MetricsCollector::new(MetricsConfig::default()));
        let alerts = AlertManager::new(AlertManagerConfig {
            history_limit: 4,
            ..AlertManagerConfig::default()
        });
        alerts
            .register_rule(rule("flap", "v", Comparison::GreaterThan, 0.0))
            .await;

        for i in 0..6 {
            let value = if i % 2 == 0 { 1.0 } else { -1.0 };
            collector.set_gauge("v", value, Tags::new()).await;
            alerts.evaluate_once(&collector).await;
        }
        assert!(alerts.history().await.len() <= 4);
    }
}
