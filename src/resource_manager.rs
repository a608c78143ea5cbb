//! # Resource Manager - Multi-Dimensional Pool with Pluggable Strategies
//!
//! Owns the resource pool consulted by the scheduler before dispatching a
//! task. Allocation is transactional: either every requested (kind, amount)
//! pair is reserved together or nothing is. The pool invariant
//! `0 <= allocated <= total` holds for every kind at all times.

use crate::types::{AllocationId, ResourceRequest, TaskError, TaskId, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Node-selection mode for the load-balanced strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMode {
    RoundRobin,
    Weighted,
    LeastLoaded,
}

/// Allocation strategy selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Reserve requests in submission order, failing on the first unmet kind
    FirstFit,
    /// Minimize cost-weighted waste across candidate plans; with a single
    /// candidate plan this falls back to first-fit
    BestFit,
    /// Placeholder with first-fit semantics; a fragmentation-minimizing
    /// variant is left to a future implementation
    WorstFit,
    /// Distributes across notional nodes; in single-node deployments this
    /// degenerates to first-fit but remains the extension point
    LoadBalanced(LoadBalanceMode),
    /// Greedy: order requests ascending by amount * (1 + utilization(kind)),
    /// then apply first-fit
    Optimized,
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        AllocationStrategy::FirstFit
    }
}

/// Pool construction parameters
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// Total capacity per resource kind
    pub capacities: HashMap<String, f64>,
    /// Relative cost per kind used by best-fit waste scoring; unlisted kinds
    /// cost 1.0
    pub kind_costs: HashMap<String, f64>,
    pub strategy: AllocationStrategy,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        let mut capacities = HashMap::new();
        capacities.insert("cpu".to_string(), 8.0);
        capacities.insert("memory_mb".to_string(), 16_384.0);
        Self {
            capacities,
            kind_costs: HashMap::new(),
            strategy: AllocationStrategy::FirstFit,
        }
    }
}

/// A granted reservation held by a running task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: AllocationId,
    pub task_id: TaskId,
    pub reservations: Vec<ResourceRequest>,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct PoolEntry {
    total: f64,
    allocated: f64,
}

impl PoolEntry {
    fn available(&self) -> f64 {
        (self.total - self.allocated).max(0.0)
    }
}

/// Read-only view of one resource kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSnapshot {
    pub kind: String,
    pub total: f64,
    pub allocated: f64,
    pub available: f64,
}

/// Read-only view of the whole pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub kinds: Vec<KindSnapshot>,
    pub active_allocations: usize,
    /// Count of release calls naming an unknown allocation id
    pub unknown_release_count: u64,
}

/// Multi-dimensional resource pool
pub struct ResourceManager {
    strategy: AllocationStrategy,
    kind_costs: HashMap<String, f64>,
    pool: RwLock<HashMap<String, PoolEntry>>,
    allocations: RwLock<HashMap<AllocationId, AllocationRecord>>,
    /// Extension point for multi-node load balancing; unused in single-node
    /// mode beyond cursor bookkeeping
    node_cursor: AtomicUsize,
    unknown_releases: AtomicU64,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        let pool = config
            .capacities
            .into_iter()
            .map(|(kind, total)| {
                (
                    kind,
                    PoolEntry {
                        total,
                        allocated: 0.0,
                    },
                )
            })
            .collect();
        Self {
            strategy: config.strategy,
            kind_costs: config.kind_costs,
            pool: RwLock::new(pool),
            allocations: RwLock::new(HashMap::new()),
            node_cursor: AtomicUsize::new(0),
            unknown_releases: AtomicU64::new(0),
        }
    }

    /// Reserve resources for `task_id`, all-or-nothing
    pub async fn allocate(
        &self,
        task_id: TaskId,
        requests: &[ResourceRequest],
    ) -> TaskResult<AllocationId> {
        if requests.is_empty() {
            // Tasks without resource needs still receive an allocation record
            // so release is uniform
            return self.commit(task_id, Vec::new()).await;
        }

        let plan = self.plan_for(requests).await?;

        let mut pool = self.pool.write().await;

        // Verify against a scratch view first so duplicate kinds in one plan
        // are accounted for, then commit; the write lock makes this atomic
        let mut scratch: HashMap<&str, f64> = HashMap::new();
        for request in &plan {
            let entry = pool.get(request.kind.as_str()).ok_or_else(|| {
                TaskError::InsufficientResources {
                    kind: request.kind.clone(),
                    requested: request.amount,
                    available: 0.0,
                }
            })?;
            let pending = scratch.entry(request.kind.as_str()).or_insert(0.0);
            if entry.available() - *pending < request.amount {
                return Err(TaskError::InsufficientResources {
                    kind: request.kind.clone(),
                    requested: request.amount,
                    available: entry.available() - *pending,
                });
            }
            *pending += request.amount;
        }

        for request in &plan {
            if let Some(entry) = pool.get_mut(request.kind.as_str()) {
                entry.allocated += request.amount;
            }
        }
        drop(pool);

        self.node_cursor.fetch_add(1, Ordering::Relaxed);
        self.commit(task_id, plan).await
    }

    async fn commit(
        &self,
        task_id: TaskId,
        reservations: Vec<ResourceRequest>,
    ) -> TaskResult<AllocationId> {
        let record = AllocationRecord {
            id: Uuid::new_v4(),
            task_id,
            reservations,
            allocated_at: Utc::now(),
        };
        let id = record.id;
        self.allocations.write().await.insert(id, record);
        debug!(%task_id, allocation = %id, "resources allocated");
        Ok(id)
    }

    /// Order the request list according to the active strategy
    async fn plan_for(&self, requests: &[ResourceRequest]) -> TaskResult<Vec<ResourceRequest>> {
        match self.strategy {
            // Worst-fit keeps placeholder first-fit semantics; load-balanced
            // degenerates to first-fit on a single node
            AllocationStrategy::FirstFit
            | AllocationStrategy::WorstFit
            | AllocationStrategy::LoadBalanced(_) => Ok(requests.to_vec()),
            AllocationStrategy::BestFit => {
                let candidates = vec![requests.to_vec()];
                if candidates.len() == 1 {
                    return Ok(candidates.into_iter().next().unwrap());
                }
                let pool = self.pool.read().await;
                let feasible: Vec<Vec<ResourceRequest>> = candidates
                    .into_iter()
                    .filter(|plan| Self::is_feasible(plan, &pool))
                    .collect();
                if feasible.is_empty() {
                    return Err(TaskError::PlanExceedsAvailableResources);
                }
                Ok(feasible
                    .into_iter()
                    .min_by(|a, b| {
                        self.waste(a)
                            .partial_cmp(&self.waste(b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap())
            }
            AllocationStrategy::Optimized => {
                let pool = self.pool.read().await;
                let mut plan = requests.to_vec();
                plan.sort_by(|a, b| {
                    let cost_a = a.amount * (1.0 + Self::utilization_of(&pool, &a.kind));
                    let cost_b = b.amount * (1.0 + Self::utilization_of(&pool, &b.kind));
                    cost_a
                        .partial_cmp(&cost_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                Ok(plan)
            }
        }
    }

    fn is_feasible(plan: &[ResourceRequest], pool: &HashMap<String, PoolEntry>) -> bool {
        let mut demand: HashMap<&str, f64> = HashMap::new();
        for request in plan {
            *demand.entry(request.kind.as_str()).or_insert(0.0) += request.amount;
        }
        demand.iter().all(|(kind, amount)| {
            pool.get(*kind)
                .map(|entry| entry.available() >= *amount)
                .unwrap_or(false)
        })
    }

    /// Cost-weighted sum of reserved amounts, used by best-fit
    fn waste(&self, plan: &[ResourceRequest]) -> f64 {
        plan.iter()
            .map(|r| r.amount * self.kind_costs.get(&r.kind).copied().unwrap_or(1.0))
            .sum()
    }

    /// Release a previously granted allocation
    ///
    /// Idempotent: releasing an unknown id is a no-op that bumps the warning
    /// counter surfaced through the pool snapshot.
    pub async fn release(&self, allocation_id: AllocationId) -> bool {
        let record = self.allocations.write().await.remove(&allocation_id);
        match record {
            Some(record) => {
                let mut pool = self.pool.write().await;
                for request in &record.reservations {
                    if let Some(entry) = pool.get_mut(&request.kind) {
                        entry.allocated = (entry.allocated - request.amount).max(0.0);
                    }
                }
                debug!(allocation = %allocation_id, "resources released");
                true
            }
            None => {
                warn!(allocation = %allocation_id, "release of unknown allocation");
                self.unknown_releases.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Whether `requests` could be satisfied right now
    pub async fn can_satisfy(&self, requests: &[ResourceRequest]) -> bool {
        let pool = self.pool.read().await;
        Self::is_feasible(requests, &pool)
    }

    /// Fraction of `kind`'s capacity currently allocated, in [0, 1]
    pub async fn utilization(&self, kind: &str) -> f64 {
        let pool = self.pool.read().await;
        Self::utilization_of(&pool, kind)
    }

    fn utilization_of(pool: &HashMap<String, PoolEntry>, kind: &str) -> f64 {
        pool.get(kind)
            .map(|entry| {
                if entry.total > 0.0 {
                    (entry.allocated / entry.total).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0)
    }

    /// Adjust capacity for a kind; totals never shrink below what is
    /// currently allocated
    pub async fn set_capacity(&self, kind: &str, total: f64) {
        let mut pool = self.pool.write().await;
        let entry = pool.entry(kind.to_string()).or_default();
        entry.total = total.max(entry.allocated);
    }

    /// Read-only view of the pool and allocation counts
    pub async fn snapshot(&self) -> PoolSnapshot {
        let pool = self.pool.read().await;
        let mut kinds: Vec<KindSnapshot> = pool
            .iter()
            .map(|(kind, entry)| KindSnapshot {
                kind: kind.clone(),
                total: entry.total,
                allocated: entry.allocated,
                available: entry.available(),
            })
            .collect();
        kinds.sort_by(|a, b| a.kind.cmp(&b.kind));
        PoolSnapshot {
            kinds,
            active_allocations: self.allocations.read().await.len(),
            unknown_release_count: self.unknown_releases.load(Ordering::Relaxed),
        }
    }

    /// Allocation record lookup for diagnostics
    pub async fn allocation(&self, id: AllocationId) -> Option<AllocationRecord> {
        self.allocations.read().await.get(&id).cloned()
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let pool = self.pool.read().await;
        for (kind, entry) in pool.iter() {
            if entry.allocated < 0.0 || entry.allocated > entry.total {
                return Err(format!(
                    "pool invariant violated for {kind}: allocated={} total={}",
                    entry.allocated, entry.total
                ));
            }
        }
        Ok(())
    }
}
