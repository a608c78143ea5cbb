//! # Task Queue - Multi-Strategy Priority Container
//!
//! Holds ready tasks between dependency resolution and dispatch. One uniform
//! surface (enqueue, dequeue, dequeue_n, peek, remove, len, list, contains)
//! over six ordering strategies. The queue does no locking of its own; the
//! scheduler owns it and serializes access.

use crate::types::{Priority, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Ordering strategy for the ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Single FIFO
    Fifo,
    /// Four strict priority buckets, FIFO within each
    Priority,
    /// Ascending by effective deadline
    Deadline,
    /// Descending by priority_weight / (1 + total resource demand)
    ResourceAware,
    /// Insertion position chosen by the predictor hook
    MlOptimized,
    /// Weighted routing across the other strategies
    Hybrid,
}

/// Insertion-position hook for the ml_optimized strategy
///
/// No real model ships with the core; the default derives a stable slot from
/// a hash of the task id, so ordering is deterministic across runs.
pub trait QueuePredictor: Send + Sync {
    /// Index in [0, queue_len] at which to insert `task`
    fn insertion_index(&self, task: &Task, queue_len: usize) -> usize;
}

/// Default predictor: FNV-1a over the task id, modulo the queue length
#[derive(Debug, Default, Clone, Copy)]
pub struct StableHashPredictor;

impl QueuePredictor for StableHashPredictor {
    fn insertion_index(&self, task: &Task, queue_len: usize) -> usize {
        if queue_len == 0 {
            return 0;
        }
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in task.id.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % (queue_len as u64 + 1)) as usize
    }
}

/// Relative weights steering hybrid enqueue routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridWeights {
    pub deadline: f64,
    pub priority: f64,
    pub resource: f64,
    pub ml: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            deadline: 1.0,
            priority: 1.0,
            resource: 0.5,
            ml: 0.1,
        }
    }
}

/// Per-queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    /// Current depth per priority level
    pub priority_distribution: HashMap<Priority, usize>,
    /// Mean queue residency of dequeued tasks, milliseconds
    pub avg_wait_ms: f64,
    pub strategy: QueueStrategy,
}

enum Backing {
    Fifo(VecDeque<Task>),
    Priority([VecDeque<Task>; 4]),
    /// Sorted ascending by effective deadline
    Deadline(Vec<Task>),
    /// Sorted descending by resource-aware score
    ResourceAware(Vec<Task>),
    MlOptimized(Vec<Task>),
    Hybrid {
        deadline: Vec<Task>,
        priority: [VecDeque<Task>; 4],
        resource: Vec<Task>,
        ml: Vec<Task>,
    },
}

impl Backing {
    fn for_strategy(strategy: QueueStrategy) -> Self {
        match strategy {
            QueueStrategy::Fifo => Backing::Fifo(VecDeque::new()),
            QueueStrategy::Priority => Backing::Priority(Default::default()),
            QueueStrategy::Deadline => Backing::Deadline(Vec::new()),
            QueueStrategy::ResourceAware => Backing::ResourceAware(Vec::new()),
            QueueStrategy::MlOptimized => Backing::MlOptimized(Vec::new()),
            QueueStrategy::Hybrid => Backing::Hybrid {
                deadline: Vec::new(),
                priority: Default::default(),
                resource: Vec::new(),
                ml: Vec::new(),
            },
        }
    }
}

fn resource_score(task: &Task) -> f64 {
    task.priority.weight() * (1.0 / (1.0 + task.total_resource_demand()))
}

fn bucket_index(priority: Priority) -> usize {
    priority as usize
}

/// Multi-strategy ready queue
pub struct TaskQueue {
    strategy: QueueStrategy,
    backing: Backing,
    predictor: Arc<dyn QueuePredictor>,
    hybrid_weights: HybridWeights,
    enqueued_at: HashMap<TaskId, Instant>,
    enqueued_total: u64,
    dequeued_total: u64,
    total_wait_ms: f64,
}

impl TaskQueue {
    pub fn new(strategy: QueueStrategy) -> Self {
        Self::with_predictor(strategy, Arc::new(StableHashPredictor))
    }

    pub fn with_predictor(strategy: QueueStrategy, predictor: Arc<dyn QueuePredictor>) -> Self {
        Self {
            strategy,
            backing: Backing::for_strategy(strategy),
            predictor,
            hybrid_weights: HybridWeights::default(),
            enqueued_at: HashMap::new(),
            enqueued_total: 0,
            dequeued_total: 0,
            total_wait_ms: 0.0,
        }
    }

    pub fn set_hybrid_weights(&mut self, weights: HybridWeights) {
        self.hybrid_weights = weights;
    }

    pub fn strategy(&self) -> QueueStrategy {
        self.strategy
    }

    pub fn enqueue(&mut self, task: Task) {
        self.enqueued_at.insert(task.id, Instant::now());
        self.enqueued_total += 1;
        self.insert(task);
    }

    fn insert(&mut self, task: Task) {
        // Route before borrowing the backing store mutably
        let route = match self.strategy {
            QueueStrategy::Hybrid => Some(self.hybrid_route(&task)),
            _ => None,
        };
        let predictor = Arc::clone(&self.predictor);

        match &mut self.backing {
            Backing::Fifo(queue) => queue.push_back(task),
            Backing::Priority(buckets) => {
                buckets[bucket_index(task.priority)].push_back(task);
            }
            Backing::Deadline(list) => {
                let deadline = task.effective_deadline();
                let idx = list.partition_point(|t| t.effective_deadline() <= deadline);
                list.insert(idx, task);
            }
            Backing::ResourceAware(list) => {
                let score = resource_score(&task);
                let idx = list.partition_point(|t| resource_score(t) >= score);
                list.insert(idx, task);
            }
            Backing::MlOptimized(list) => {
                let idx = predictor.insertion_index(&task, list.len());
                list.insert(idx.min(list.len()), task);
            }
            Backing::Hybrid {
                deadline,
                priority,
                resource,
                ml,
            } => match route.unwrap_or(QueueStrategy::Priority) {
                QueueStrategy::Deadline => {
                    let d = task.effective_deadline();
                    let idx = deadline.partition_point(|t| t.effective_deadline() <= d);
                    deadline.insert(idx, task);
                }
                QueueStrategy::ResourceAware => {
                    let score = resource_score(&task);
                    let idx = resource.partition_point(|t| resource_score(t) >= score);
                    resource.insert(idx, task);
                }
                QueueStrategy::MlOptimized => {
                    let idx = predictor.insertion_index(&task, ml.len());
                    ml.insert(idx.min(ml.len()), task);
                }
                _ => priority[bucket_index(task.priority)].push_back(task),
            },
        }
    }

    /// Sub-queue a task routes to under the hybrid strategy
    fn hybrid_route(&self, task: &Task) -> QueueStrategy {
        let w = &self.hybrid_weights;
        let until_deadline = (task.effective_deadline() - chrono::Utc::now())
            .num_milliseconds()
            .max(0) as f64;
        let deadline_score = w.deadline * (1.0 / (1.0 + until_deadline / 1_000.0));
        let priority_score = w.priority * (task.priority.weight() / 8.0);
        let resource_sc = w.resource * (1.0 / (1.0 + task.total_resource_demand()));
        let ml_score = w.ml * 0.5;

        let mut best = (QueueStrategy::Deadline, deadline_score);
        for candidate in [
            (QueueStrategy::Priority, priority_score),
            (QueueStrategy::ResourceAware, resource_sc),
            (QueueStrategy::MlOptimized, ml_score),
        ] {
            if candidate.1 > best.1 {
                best = candidate;
            }
        }
        best.0
    }

    pub fn dequeue(&mut self) -> Option<Task> {
        let task = match &mut self.backing {
            Backing::Fifo(queue) => queue.pop_front(),
            Backing::Priority(buckets) => buckets.iter_mut().find_map(|b| b.pop_front()),
            Backing::Deadline(list) | Backing::ResourceAware(list) | Backing::MlOptimized(list) => {
                if list.is_empty() {
                    None
                } else {
                    Some(list.remove(0))
                }
            }
            Backing::Hybrid {
                deadline,
                priority,
                resource,
                ml,
            } => {
                // Drain order: deadline, priority, resource-aware, ml
                if !deadline.is_empty() {
                    Some(deadline.remove(0))
                } else if let Some(task) = priority.iter_mut().find_map(|b| b.pop_front()) {
                    Some(task)
                } else if !resource.is_empty() {
                    Some(resource.remove(0))
                } else if ml.is_empty() {
                    None
                } else {
                    Some(ml.remove(0))
                }
            }
        };

        if let Some(task) = &task {
            self.dequeued_total += 1;
            if let Some(at) = self.enqueued_at.remove(&task.id) {
                self.total_wait_ms += at.elapsed().as_secs_f64() * 1_000.0;
            }
        }
        task
    }

    /// Pop up to `n` tasks in dequeue order
    pub fn dequeue_n(&mut self, n: usize) -> Vec<Task> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.dequeue() {
                Some(task) => out.push(task),
                None => break,
            }
        }
        out
    }

    /// Next task without removing it
    pub fn peek(&self) -> Option<&Task> {
        match &self.backing {
            Backing::Fifo(queue) => queue.front(),
            Backing::Priority(buckets) => buckets.iter().find_map(|b| b.front()),
            Backing::Deadline(list) | Backing::ResourceAware(list) | Backing::MlOptimized(list) => {
                list.first()
            }
            Backing::Hybrid {
                deadline,
                priority,
                resource,
                ml,
            } => deadline
                .first()
                .or_else(|| priority.iter().find_map(|b| b.front()))
                .or_else(|| resource.first())
                .or_else(|| ml.first()),
        }
    }

    /// Remove a specific task by id
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let removed = match &mut self.backing {
            Backing::Fifo(queue) => {
                let idx = queue.iter().position(|t| t.id == id)?;
                queue.remove(idx)
            }
            Backing::Priority(buckets) => buckets.iter_mut().find_map(|b| {
                let idx = b.iter().position(|t| t.id == id)?;
                b.remove(idx)
            }),
            Backing::Deadline(list) | Backing::ResourceAware(list) | Backing::MlOptimized(list) => {
                let idx = list.iter().position(|t| t.id == id)?;
                Some(list.remove(idx))
            }
            Backing::Hybrid {
                deadline,
                priority,
                resource,
                ml,
            } => {
                let from_list = |list: &mut Vec<Task>| {
                    let idx = list.iter().position(|t| t.id == id)?;
                    Some(list.remove(idx))
                };
                from_list(deadline)
                    .or_else(|| {
                        priority.iter_mut().find_map(|b| {
                            let idx = b.iter().position(|t| t.id == id)?;
                            b.remove(idx)
                        })
                    })
                    .or_else(|| from_list(resource))
                    .or_else(|| from_list(ml))
            }
        };
        if removed.is_some() {
            self.enqueued_at.remove(&id);
        }
        removed
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.iter().any(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.peek().is_none()
    }

    /// All queued tasks, in approximate dequeue order
    pub fn list(&self) -> Vec<Task> {
        self.iter().cloned().collect()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Task> + '_> {
        match &self.backing {
            Backing::Fifo(queue) => Box::new(queue.iter()),
            Backing::Priority(buckets) => Box::new(buckets.iter().flat_map(|b| b.iter())),
            Backing::Deadline(list) | Backing::ResourceAware(list) | Backing::MlOptimized(list) => {
                Box::new(list.iter())
            }
            Backing::Hybrid {
                deadline,
                priority,
                resource,
                ml,
            } => Box::new(
                deadline
                    .iter()
                    .chain(priority.iter().flat_map(|b| b.iter()))
                    .chain(resource.iter())
                    .chain(ml.iter()),
            ),
        }
    }

    /// Drain every queued task and re-enqueue under `strategy`
    pub fn change_strategy(&mut self, strategy: QueueStrategy) {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(task) = self.dequeue() {
            drained.push(task);
        }
        debug!(?strategy, drained = drained.len(), "queue strategy changed");
        self.strategy = strategy;
        self.backing = Backing::for_strategy(strategy);
        for task in drained {
            self.enqueue(task);
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut priority_distribution: HashMap<Priority, usize> = HashMap::new();
        for task in self.iter() {
            *priority_distribution.entry(task.priority).or_insert(0) += 1;
        }
        QueueStats {
            depth: self.len(),
            enqueued_total: self.enqueued_total,
            dequeued_total: self.dequeued_total,
            priority_distribution,
            avg_wait_ms: if self.dequeued_total > 0 {
                self.total_wait_ms / self.dequeued_total as f64
            } else {
                0.0
            },
            strategy: self.strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceRequest, SubmitOptions};

    fn task(priority: Priority) -> Task {
        Task::from_options(
            "noop".to_string(),
            vec![],
            SubmitOptions {
                priority,
                ..SubmitOptions::default()
            },
        )
    }

    fn task_with(opts: SubmitOptions) -> Task {
        Task::from_options("noop".to_string(), vec![], opts)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = TaskQueue::new(QueueStrategy::Fifo);
        let a = task(Priority::Low);
        let b = task(Priority::Critical);
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());

        assert_eq!(queue.dequeue().unwrap().id, a.id);
        assert_eq!(queue.dequeue().unwrap().id, b.id);
    }

    #[test]
    fn test_strict_priority_order() {
        let mut queue = TaskQueue::new(QueueStrategy::Priority);
        let low = task(Priority::Low);
        let medium = task(Priority::Medium);
        let critical = task(Priority::Critical);
        queue.enqueue(low.clone());
        queue.enqueue(medium.clone());
        queue.enqueue(critical.clone());

        assert_eq!(queue.dequeue().unwrap().id, critical.id);
        assert_eq!(queue.dequeue().unwrap().id, medium.id);
        assert_eq!(queue.dequeue().unwrap().id, low.id);
    }

    #[test]
    fn test_priority_fifo_within_level() {
        let mut queue = TaskQueue::new(QueueStrategy::Priority);
        let first = task(Priority::High);
        let second = task(Priority::High);
        queue.enqueue(first.clone());
        queue.enqueue(second.clone());

        assert_eq!(queue.dequeue().unwrap().id, first.id);
        assert_eq!(queue.dequeue().unwrap().id, second.id);
    }

    #[test]
    fn test_deadline_order() {
        let mut queue = TaskQueue::new(QueueStrategy::Deadline);
        let loose = task_with(SubmitOptions {
            timeout_ms: 60_000,
            ..SubmitOptions::default()
        });
        let tight = task_with(SubmitOptions {
            timeout_ms: 1_000,
            ..SubmitOptions::default()
        });
        queue.enqueue(loose.clone());
        queue.enqueue(tight.clone());

        assert_eq!(queue.dequeue().unwrap().id, tight.id);
        assert_eq!(queue.dequeue().unwrap().id, loose.id);
    }

    #[test]
    fn test_resource_aware_prefers_light_high_priority() {
        let mut queue = TaskQueue::new(QueueStrategy::ResourceAware);
        let heavy_low = task_with(SubmitOptions {
            priority: Priority::Low,
            resources: vec![ResourceRequest::new("cpu", 8.0)],
            ..SubmitOptions::default()
        });
        let light_critical = task_with(SubmitOptions {
            priority: Priority::Critical,
            resources: vec![ResourceRequest::new("cpu", 1.0)],
            ..SubmitOptions::default()
        });
        queue.enqueue(heavy_low.clone());
        queue.enqueue(light_critical.clone());

        assert_eq!(queue.dequeue().unwrap().id, light_critical.id);
    }

    #[test]
    fn test_ml_optimized_is_stable() {
        let tasks: Vec<Task> = (0..8).map(|_| task(Priority::Medium)).collect();

        let order = |tasks: &[Task]| {
            let mut queue = TaskQueue::new(QueueStrategy::MlOptimized);
            for t in tasks {
                queue.enqueue(t.clone());
            }
            queue.list().iter().map(|t| t.id).collect::<Vec<_>>()
        };

        assert_eq!(order(&tasks), order(&tasks));
    }

    #[test]
    fn test_remove_and_contains() {
        let mut queue = TaskQueue::new(QueueStrategy::Priority);
        let a = task(Priority::High);
        let b = task(Priority::Low);
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());

        assert!(queue.contains(a.id));
        let removed = queue.remove(a.id).unwrap();
        assert_eq!(removed.id, a.id);
        assert!(!queue.contains(a.id));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue_n() {
        let mut queue = TaskQueue::new(QueueStrategy::Fifo);
        for _ in 0..5 {
            queue.enqueue(task(Priority::Medium));
        }
        assert_eq!(queue.dequeue_n(3).len(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue_n(10).len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_change_strategy_preserves_tasks() {
        let mut queue = TaskQueue::new(QueueStrategy::Fifo);
        let mut ids: Vec<TaskId> = Vec::new();
        for priority in [Priority::Low, Priority::Critical, Priority::Medium] {
            let t = task(priority);
            ids.push(t.id);
            queue.enqueue(t);
        }

        queue.change_strategy(QueueStrategy::Priority);
        assert_eq!(queue.len(), 3);
        let mut listed: Vec<TaskId> = queue.list().iter().map(|t| t.id).collect();
        listed.sort();
        ids.sort();
        assert_eq!(listed, ids);

        // Re-applying the same strategy is idempotent on the set
        queue.change_strategy(QueueStrategy::Priority);
        let mut listed: Vec<TaskId> = queue.list().iter().map(|t| t.id).collect();
        listed.sort();
        assert_eq!(listed, ids);

        // And ordering now honors priority
        assert_eq!(queue.dequeue().unwrap().priority, Priority::Critical);
    }

    #[test]
    fn test_hybrid_drains_all_subqueues() {
        let mut queue = TaskQueue::new(QueueStrategy::Hybrid);
        for _ in 0..10 {
            queue.enqueue(task(Priority::Medium));
        }
        for priority in [Priority::Critical, Priority::Low] {
            queue.enqueue(task(priority));
        }
        assert_eq!(queue.len(), 12);

        let mut drained = 0;
        while queue.dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 12);
    }

    #[test]
    fn test_stats_track_distribution_and_counts() {
        let mut queue = TaskQueue::new(QueueStrategy::Priority);
        queue.enqueue(task(Priority::High));
        queue.enqueue(task(Priority::High));
        queue.enqueue(task(Priority::Low));

        let stats = queue.stats();
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.enqueued_total, 3);
        assert_eq!(stats.priority_distribution[&Priority::High], 2);

        queue.dequeue();
        let stats = queue.stats();
        assert_eq!(stats.dequeued_total, 1);
        assert_eq!(stats.depth, 2);
    }
}
