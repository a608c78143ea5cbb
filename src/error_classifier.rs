//! # Error Classifier - Failure Taxonomy for the Resilience Layer
//!
//! Maps any observed error to a classification record used by the retry,
//! recovery, and circuit breaking machinery. Classification is a total, pure
//! function over a fixed priority-ordered rule table: the first rule whose
//! pattern matches wins, and inputs matching no rule fall through to a
//! conservative `unknown` record.

use crate::types::{ErrorCategory, ErrorSeverity, StrategyKind, TaskError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Classification record produced for every observed error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Whether the resilience layer may attempt the task again
    pub retryable: bool,
    /// Whether the failure should be surfaced beyond the scheduler
    pub escalate: bool,
    /// Recovery strategy selected for this class of failure
    pub strategy: StrategyKind,
    /// The rule pattern that matched, for diagnostics
    pub pattern: String,
    /// Match confidence in [0, 1]; keyword rules score below exact rules
    pub confidence: f64,
}

struct Rule {
    /// Lowercase substrings; any match selects this rule
    needles: &'static [&'static str],
    pattern: &'static str,
    category: ErrorCategory,
    severity: ErrorSeverity,
    retryable: bool,
    strategy: StrategyKind,
    confidence: f64,
}

/// Priority-ordered rule table; earlier rules win
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule {
            needles: &["timeout", "timed out", "deadline exceeded"],
            pattern: "timeout",
            category: ErrorCategory::Timeout,
            severity: ErrorSeverity::Medium,
            retryable: true,
            strategy: StrategyKind::ExponentialBackoff,
            confidence: 0.9,
        },
        Rule {
            needles: &["connection refused", "connection reset", "broken pipe"],
            pattern: "connection_refused",
            category: ErrorCategory::Network,
            severity: ErrorSeverity::Medium,
            retryable: true,
            strategy: StrategyKind::SimpleRetry,
            confidence: 0.9,
        },
        Rule {
            needles: &["dns", "name resolution", "no such host"],
            pattern: "dns_failure",
            category: ErrorCategory::Network,
            severity: ErrorSeverity::High,
            retryable: false,
            strategy: StrategyKind::NoRetry,
            confidence: 0.85,
        },
        Rule {
            needles: &["host unreachable", "network unreachable"],
            pattern: "host_unreachable",
            category: ErrorCategory::Network,
            severity: ErrorSeverity::Medium,
            retryable: true,
            strategy: StrategyKind::SimpleRetry,
            confidence: 0.85,
        },
        Rule {
            needles: &["out of memory", "oom", "memory exhausted", "allocation failed"],
            pattern: "out_of_memory",
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::Critical,
            retryable: true,
            strategy: StrategyKind::EscalateAndFail,
            confidence: 0.9,
        },
        Rule {
            needles: &["disk full", "no space left"],
            pattern: "disk_full",
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::High,
            retryable: true,
            strategy: StrategyKind::ResourceCleanupRetry,
            confidence: 0.9,
        },
        Rule {
            needles: &["too many open files", "file descriptor", "fd exhausted"],
            pattern: "fd_exhausted",
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::High,
            retryable: true,
            strategy: StrategyKind::ResourceCleanupRetry,
            confidence: 0.85,
        },
        Rule {
            needles: &["permission denied", "forbidden", "unauthorized", "access denied"],
            pattern: "permission",
            category: ErrorCategory::Permanent,
            severity: ErrorSeverity::High,
            retryable: false,
            strategy: StrategyKind::NoRetry,
            confidence: 0.9,
        },
        Rule {
            needles: &["status 400", "status 401", "status 403", "status 404", "client error"],
            pattern: "client_error",
            category: ErrorCategory::Permanent,
            severity: ErrorSeverity::Low,
            retryable: false,
            strategy: StrategyKind::NoRetry,
            confidence: 0.8,
        },
        Rule {
            needles: &["status 500", "status 502", "status 503", "status 504", "server error"],
            pattern: "server_error",
            category: ErrorCategory::Transient,
            severity: ErrorSeverity::Medium,
            retryable: true,
            strategy: StrategyKind::SimpleRetry,
            confidence: 0.8,
        },
        Rule {
            needles: &["invalid argument", "invalid input", "type error", "parse error"],
            pattern: "invalid_argument",
            category: ErrorCategory::Validation,
            severity: ErrorSeverity::Low,
            retryable: false,
            strategy: StrategyKind::NoRetry,
            confidence: 0.85,
        },
        Rule {
            needles: &["division by zero", "overflow", "arithmetic"],
            pattern: "arithmetic",
            category: ErrorCategory::Permanent,
            severity: ErrorSeverity::Medium,
            retryable: false,
            strategy: StrategyKind::NoRetry,
            confidence: 0.85,
        },
        Rule {
            needles: &["dependency failed", "prerequisite", "upstream failure"],
            pattern: "dependency_failure",
            category: ErrorCategory::Dependency,
            severity: ErrorSeverity::Medium,
            retryable: true,
            strategy: StrategyKind::DependencyRetry,
            confidence: 0.85,
        },
        Rule {
            needles: &["panic", "unwind"],
            pattern: "panic",
            category: ErrorCategory::System,
            severity: ErrorSeverity::High,
            retryable: false,
            strategy: StrategyKind::NoRetry,
            confidence: 0.8,
        },
        Rule {
            needles: &["runtime error", "internal error"],
            pattern: "runtime_error",
            category: ErrorCategory::Transient,
            severity: ErrorSeverity::Medium,
            retryable: true,
            strategy: StrategyKind::SimpleRetry,
            confidence: 0.6,
        },
    ]
});

/// Pure, side-effect-free error classifier
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error message; total over all inputs
    pub fn classify(&self, message: &str) -> ErrorClassification {
        let haystack = message.to_lowercase();
        for rule in RULES.iter() {
            if rule.needles.iter().any(|n| haystack.contains(n)) {
                return Self::finish(
                    rule.category,
                    rule.severity,
                    rule.retryable,
                    rule.strategy,
                    rule.pattern,
                    rule.confidence,
                );
            }
        }
        // Conservative default: unknown errors are retried cautiously
        Self::finish(
            ErrorCategory::Unknown,
            ErrorSeverity::Medium,
            true,
            StrategyKind::CautiousRetry,
            "unknown",
            0.3,
        )
    }

    /// Classify a structured boundary error without going through its text
    pub fn classify_task_error(&self, error: &TaskError) -> ErrorClassification {
        match error {
            TaskError::ExecutionTimeout(_) => Self::finish(
                ErrorCategory::Timeout,
                ErrorSeverity::Medium,
                true,
                StrategyKind::ExponentialBackoff,
                "timeout",
                1.0,
            ),
            TaskError::InsufficientResources { .. } | TaskError::PlanExceedsAvailableResources => {
                Self::finish(
                    ErrorCategory::Resource,
                    ErrorSeverity::High,
                    true,
                    StrategyKind::ResourceCleanupRetry,
                    "insufficient_resources",
                    1.0,
                )
            }
            TaskError::CircularDependency { .. } => Self::finish(
                ErrorCategory::Dependency,
                ErrorSeverity::Medium,
                false,
                StrategyKind::NoRetry,
                "circular_dependency",
                1.0,
            ),
            TaskError::ExecutionPanic(_) => Self::finish(
                ErrorCategory::System,
                ErrorSeverity::High,
                false,
                StrategyKind::NoRetry,
                "panic",
                1.0,
            ),
            TaskError::InvalidTask(_)
            | TaskError::InvalidArguments(_)
            | TaskError::InvalidTimeout(_)
            | TaskError::HandlerNotFound(_) => Self::finish(
                ErrorCategory::Validation,
                ErrorSeverity::Low,
                false,
                StrategyKind::NoRetry,
                "invalid_argument",
                1.0,
            ),
            TaskError::CircuitBreakerOpen { .. } => Self::finish(
                ErrorCategory::Transient,
                ErrorSeverity::Medium,
                true,
                StrategyKind::SimpleRetry,
                "circuit_breaker_open",
                1.0,
            ),
            other => self.classify(&other.to_string()),
        }
    }

    fn finish(
        category: ErrorCategory,
        severity: ErrorSeverity,
        retryable: bool,
        strategy: StrategyKind,
        pattern: &str,
        confidence: f64,
    ) -> ErrorClassification {
        ErrorClassification {
            category,
            severity,
            retryable,
            escalate: escalates(category, severity),
            strategy,
            pattern: pattern.to_string(),
            confidence,
        }
    }
}

/// Escalation rule: critical always, high only for system/permanent/resource
fn escalates(category: ErrorCategory, severity: ErrorSeverity) -> bool {
    severity == ErrorSeverity::Critical
        || (severity == ErrorSeverity::High
            && matches!(
                category,
                ErrorCategory::System | ErrorCategory::Permanent | ErrorCategory::Resource
            ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let c = ErrorClassifier::new().classify("operation timed out after 30s");
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert!(c.retryable);
        assert_eq!(c.strategy, StrategyKind::ExponentialBackoff);
        assert!(!c.escalate);
    }

    #[test]
    fn test_oom_escalates() {
        let c = ErrorClassifier::new().classify("worker killed: out of memory");
        assert_eq!(c.category, ErrorCategory::Resource);
        assert_eq!(c.severity, ErrorSeverity::Critical);
        assert!(c.escalate);
        assert_eq!(c.strategy, StrategyKind::EscalateAndFail);
    }

    #[test]
    fn test_permission_not_retryable() {
        let c = ErrorClassifier::new().classify("permission denied: /etc/shadow");
        assert_eq!(c.category, ErrorCategory::Permanent);
        assert!(!c.retryable);
        assert!(c.escalate); // high + permanent
    }

    #[test]
    fn test_priority_order_timeout_beats_network() {
        // Contains both a timeout and a connection needle; timeout rule is first
        let c = ErrorClassifier::new().classify("connection refused: handshake timed out");
        assert_eq!(c.category, ErrorCategory::Timeout);
    }

    #[test]
    fn test_unknown_is_conservatively_retryable() {
        let c = ErrorClassifier::new().classify("zorp gleeble");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.retryable);
        assert_eq!(c.strategy, StrategyKind::CautiousRetry);
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn test_totality_over_odd_inputs() {
        let classifier = ErrorClassifier::new();
        for input in ["", " ", "\0", "日本語のエラー", &"x".repeat(10_000)] {
            let c = classifier.classify(input);
            assert!((0.0..=1.0).contains(&c.confidence));
        }
    }

    #[test]
    fn test_structured_error_classification() {
        let classifier = ErrorClassifier::new();
        let c = classifier
            .classify_task_error(&TaskError::ExecutionTimeout(std::time::Duration::from_secs(1)));
        assert_eq!(c.category, ErrorCategory::Timeout);
        assert_eq!(c.confidence, 1.0);

        let c = classifier.classify_task_error(&TaskError::ExecutionPanic("boom".into()));
        assert_eq!(c.category, ErrorCategory::System);
        assert!(!c.retryable);
    }

    #[test]
    fn test_dependency_failure() {
        let c = ErrorClassifier::new().classify("dependency failed: task abc");
        assert_eq!(c.category, ErrorCategory::Dependency);
        assert_eq!(c.strategy, StrategyKind::DependencyRetry);
    }
}
