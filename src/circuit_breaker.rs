//! # Circuit Breaker - Per-Operation Failure Isolation
//!
//! Keeps one closed/open/half-open state machine per operation name over the
//! stream of success/failure outcomes reported by the scheduler. While a
//! circuit is open, calls against that operation fail immediately instead of
//! consuming execution slots; after the recovery timeout a bounded number of
//! probe calls decides whether the circuit closes again.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls fail immediately until the recovery timeout elapses
    Open,
    /// A limited number of probe calls decide the next state
    HalfOpen,
}

/// Configuration for every breaker in the registry
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in closed state that open the circuit
    pub failure_threshold: u32,
    /// Probe successes in half-open state that close the circuit
    pub success_threshold: u32,
    /// Time the circuit stays open before permitting a probe
    pub recovery_timeout: Duration,
    /// Concurrent probe calls permitted while half-open
    pub half_open_max_calls: u32,
    /// State-change records retained per operation
    pub history_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            history_limit: 50,
        }
    }
}

/// One recorded state transition, most recent first in history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    /// Failure count at the moment of transition
    pub failure_count: u32,
}

/// Transition surfaced to the caller so the scheduler can emit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
    HalfOpened,
}

/// Read-only view of one operation's breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub history: Vec<StateChange>,
}

struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    history: VecDeque<StateChange>,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure: None,
            last_failure_wall: None,
            history: VecDeque::new(),
        }
    }

    fn transition_to(&mut self, to: CircuitState, wall: DateTime<Utc>, history_limit: usize) {
        let change = StateChange {
            from: self.state,
            to,
            at: wall,
            failure_count: self.failure_count,
        };
        self.history.push_front(change);
        self.history.truncate(history_limit);

        self.state = to;
        self.success_count = 0;
        self.half_open_calls = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

/// Registry of per-operation circuit breakers
///
/// All mutation happens under a single writer lock so state transitions are
/// atomic with respect to the operation name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, BreakerRecord>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Ask permission to execute `operation`
    ///
    /// Returns `Ok(transition)` when the call may proceed (`transition` is
    /// `Some(HalfOpened)` when this call is the probe that moved the circuit
    /// out of open), or `Err(())` when the circuit rejects the call.
    pub async fn try_acquire(&self, operation: &str) -> Result<Option<CircuitTransition>, ()> {
        let mut breakers = self.breakers.write().await;
        let record = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerRecord::new);

        match record.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let elapsed = record
                    .last_failure
                    .map(|at| self.clock.now().duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    record.transition_to(
                        CircuitState::HalfOpen,
                        self.clock.wall(),
                        self.config.history_limit,
                    );
                    record.half_open_calls = 1;
                    info!(operation, "circuit half-open, permitting probe");
                    Ok(Some(CircuitTransition::HalfOpened))
                } else {
                    debug!(operation, "circuit open, rejecting call");
                    Err(())
                }
            }
            CircuitState::HalfOpen => {
                if record.half_open_calls < self.config.half_open_max_calls {
                    record.half_open_calls += 1;
                    Ok(None)
                } else {
                    Err(())
                }
            }
        }
    }

    /// Record a successful call against `operation`
    pub async fn record_success(&self, operation: &str) -> Option<CircuitTransition> {
        let mut breakers = self.breakers.write().await;
        let record = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerRecord::new);

        match record.state {
            CircuitState::Closed => {
                record.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.success_threshold {
                    record.transition_to(
                        CircuitState::Closed,
                        self.clock.wall(),
                        self.config.history_limit,
                    );
                    info!(operation, "circuit closed after probe successes");
                    Some(CircuitTransition::Closed)
                } else {
                    None
                }
            }
            // Success while open carries no information; the breaker waits
            // for its probe
            CircuitState::Open => None,
        }
    }

    /// Record a failed call against `operation`
    pub async fn record_failure(&self, operation: &str) -> Option<CircuitTransition> {
        let mut breakers = self.breakers.write().await;
        let record = breakers
            .entry(operation.to_string())
            .or_insert_with(BreakerRecord::new);

        record.last_failure = Some(self.clock.now());
        record.last_failure_wall = Some(self.clock.wall());

        match record.state {
            CircuitState::Closed => {
                record.failure_count += 1;
                if record.failure_count >= self.config.failure_threshold {
                    record.transition_to(
                        CircuitState::Open,
                        self.clock.wall(),
                        self.config.history_limit,
                    );
                    warn!(operation, failures = record.history.front().map(|c| c.failure_count).unwrap_or(0), "circuit opened");
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                record.transition_to(
                    CircuitState::Open,
                    self.clock.wall(),
                    self.config.history_limit,
                );
                warn!(operation, "probe failed, circuit re-opened");
                Some(CircuitTransition::Opened)
            }
            CircuitState::Open => None,
        }
    }

    /// Current state of `operation`, defaulting to closed for unseen names
    pub async fn state(&self, operation: &str) -> CircuitState {
        self.breakers
            .read()
            .await
            .get(operation)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of one operation's breaker
    pub async fn snapshot(&self, operation: &str) -> Option<BreakerSnapshot> {
        self.breakers.read().await.get(operation).map(|r| BreakerSnapshot {
            operation: operation.to_string(),
            state: r.state,
            failure_count: r.failure_count,
            success_count: r.success_count,
            last_failure_at: r.last_failure_wall,
            history: r.history.iter().cloned().collect(),
        })
    }

    /// Snapshots of every tracked operation
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        breakers
            .iter()
            .map(|(operation, r)| BreakerSnapshot {
                operation: operation.clone(),
                state: r.state,
                failure_count: r.failure_count,
                success_count: r.success_count,
                last_failure_at: r.last_failure_wall,
                history: r.history.iter().cloned().collect(),
            })
            .collect()
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let _ = self.breakers.read().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(clock: Arc<ManualClock>) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock)
    }

    #[tokio::test]
    async fn test_opens_after_failure_threshold() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);

        for i in 0..4 {
            assert!(registry.record_failure("op").await.is_none(), "failure {i}");
        }
        assert_eq!(
            registry.record_failure("op").await,
            Some(CircuitTransition::Opened)
        );
        assert_eq!(registry.state("op").await, CircuitState::Open);
        assert!(registry.try_acquire("op").await.is_err());
    }

    #[tokio::test]
    async fn test_success_resets_closed_failure_count() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);

        for _ in 0..4 {
            registry.record_failure("op").await;
        }
        registry.record_success("op").await;
        for _ in 0..4 {
            assert!(registry.record_failure("op").await.is_none());
        }
        assert_eq!(registry.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_after_recovery_timeout() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(Arc::clone(&clock));

        for _ in 0..5 {
            registry.record_failure("op").await;
        }
        assert!(registry.try_acquire("op").await.is_err());

        clock.advance(Duration::from_secs(61));
        assert_eq!(
            registry.try_acquire("op").await,
            Ok(Some(CircuitTransition::HalfOpened))
        );
        assert_eq!(registry.state("op").await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_probe_successes_close_circuit() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(Arc::clone(&clock));

        for _ in 0..5 {
            registry.record_failure("op").await;
        }
        clock.advance(Duration::from_secs(61));
        registry.try_acquire("op").await.unwrap();

        assert!(registry.record_success("op").await.is_none());
        assert!(registry.record_success("op").await.is_none());
        assert_eq!(
            registry.record_success("op").await,
            Some(CircuitTransition::Closed)
        );
        assert_eq!(registry.state("op").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(Arc::clone(&clock));

        for _ in 0..5 {
            registry.record_failure("op").await;
        }
        clock.advance(Duration::from_secs(61));
        registry.try_acquire("op").await.unwrap();

        assert_eq!(
            registry.record_failure("op").await,
            Some(CircuitTransition::Opened)
        );
        assert_eq!(registry.state("op").await, CircuitState::Open);

        // The re-open refreshed last_failure_time: still rejecting before
        // another full recovery timeout
        clock.advance(Duration::from_secs(30));
        assert!(registry.try_acquire("op").await.is_err());
    }

    #[tokio::test]
    async fn test_half_open_call_limit() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(Arc::clone(&clock));

        for _ in 0..5 {
            registry.record_failure("op").await;
        }
        clock.advance(Duration::from_secs(61));

        assert!(registry.try_acquire("op").await.is_ok()); // probe 1
        assert!(registry.try_acquire("op").await.is_ok()); // probe 2
        assert!(registry.try_acquire("op").await.is_ok()); // probe 3
        assert!(registry.try_acquire("op").await.is_err()); // over the limit
    }

    #[tokio::test]
    async fn test_history_is_most_recent_first_and_bounded() {
        let clock = Arc::new(ManualClock::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            history_limit: 3,
            ..CircuitBreakerConfig::default()
        };
        let registry = CircuitBreakerRegistry::new(config, clock.clone());

        for _ in 0..5 {
            registry.record_failure("op").await;
            clock.advance(Duration::from_secs(61));
            registry.try_acquire("op").await.unwrap();
            registry.record_success("op").await;
            registry.record_success("op").await;
            registry.record_success("op").await;
        }

        let snapshot = registry.snapshot("op").await.unwrap();
        assert_eq!(snapshot.history.len(), 3);
        // Most recent transition first
        assert_eq!(snapshot.history[0].to, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_operations_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);

        for _ in 0..5 {
            registry.record_failure("a").await;
        }
        assert_eq!(registry.state("a").await, CircuitState::Open);
        assert_eq!(registry.state("b").await, CircuitState::Closed);
        assert!(registry.try_acquire("b").await.is_ok());
    }
}
