//! # Dependency Resolver - Prerequisite DAG and Ready-Set Computation
//!
//! Maintains the directed acyclic graph of task prerequisites as adjacency
//! lists keyed by task id. Submission is atomic: the cycle check runs against
//! a snapshot with the new edges applied, and the live graph is only mutated
//! once the graph is known to stay acyclic. Completion notifications are
//! processed in the order received, so a dependent can never become ready
//! before its last prerequisite's completion has been observed.

use crate::types::{Task, TaskError, TaskId, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Outcome of a dependency check at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Every prerequisite is satisfied; the task may be queued
    Satisfied,
    /// The task was parked until its prerequisites complete
    Waiting,
}

#[derive(Debug, Default)]
struct ResolverState {
    /// prerequisite -> dependents
    dependents: HashMap<TaskId, HashSet<TaskId>>,
    /// task -> prerequisites, as declared at submission
    prerequisites: HashMap<TaskId, HashSet<TaskId>>,
    /// Completed (or externally declared) prerequisite ids
    satisfied: HashSet<TaskId>,
    /// Parked envelopes keyed by task id
    waiting: HashMap<TaskId, Task>,
}

/// Read-only counts for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSnapshot {
    pub known_tasks: usize,
    pub waiting_tasks: usize,
    pub satisfied_tasks: usize,
}

/// Owner of the dependency DAG and the satisfied set
pub struct DependencyResolver {
    state: RwLock<ResolverState>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ResolverState::default()),
        }
    }

    /// Declare an id satisfied without a corresponding task (an external
    /// prerequisite completed outside this scheduler)
    pub async fn declare_external(&self, id: TaskId) {
        let mut state = self.state.write().await;
        state.satisfied.insert(id);
    }

    /// Register `task` and its dependency edges
    ///
    /// Fails with `circular_dependency` (and leaves the graph untouched) when
    /// the added edges would close a cycle. Otherwise returns whether the
    /// task is immediately runnable or was parked.
    pub async fn submit(&self, task: &Task) -> TaskResult<ResolutionOutcome> {
        let mut state = self.state.write().await;

        // Cycle check on a snapshot with the new edges applied; the live
        // graph is committed only on success
        let mut snapshot = state.dependents.clone();
        for dep in &task.dependencies {
            snapshot.entry(*dep).or_default().insert(task.id);
        }
        snapshot.entry(task.id).or_default();

        if let Some(cycle) = find_cycle_through(&snapshot, task.id) {
            debug!(task = %task.id, "submission rejected: would create cycle");
            return Err(TaskError::CircularDependency { cycle });
        }

        for dep in &task.dependencies {
            state.dependents.entry(*dep).or_default().insert(task.id);
        }
        state.dependents.entry(task.id).or_default();
        state
            .prerequisites
            .insert(task.id, task.dependencies.iter().copied().collect());

        let unsatisfied: Vec<TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| !state.satisfied.contains(dep))
            .copied()
            .collect();

        if unsatisfied.is_empty() {
            Ok(ResolutionOutcome::Satisfied)
        } else {
            debug!(task = %task.id, pending = unsatisfied.len(), "task parked on dependencies");
            state.waiting.insert(task.id, task.clone());
            Ok(ResolutionOutcome::Waiting)
        }
    }

    /// Record a completion and return the tasks it released
    ///
    /// The ready set is every waiting task whose prerequisites are now all
    /// satisfied; returned tasks are removed from the waiting map.
    pub async fn task_completed(&self, id: TaskId) -> Vec<Task> {
        let mut state = self.state.write().await;
        state.satisfied.insert(id);

        let ready_ids: Vec<TaskId> = state
            .waiting
            .keys()
            .filter(|waiting_id| {
                state
                    .prerequisites
                    .get(waiting_id)
                    .map(|deps| deps.iter().all(|d| state.satisfied.contains(d)))
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        let mut released = Vec::with_capacity(ready_ids.len());
        for ready_id in ready_ids {
            if let Some(task) = state.waiting.remove(&ready_id) {
                released.push(task);
            }
        }
        if !released.is_empty() {
            info!(completed = %id, released = released.len(), "dependents released");
        }
        released
    }

    /// Remove a waiting task (cancellation); returns the parked envelope
    pub async fn remove_waiting(&self, id: TaskId) -> Option<Task> {
        self.state.write().await.waiting.remove(&id)
    }

    /// Whether `id` is currently parked on unsatisfied prerequisites
    pub async fn is_waiting(&self, id: TaskId) -> bool {
        self.state.read().await.waiting.contains_key(&id)
    }

    /// Parked envelope lookup for `status()`
    pub async fn waiting_task(&self, id: TaskId) -> Option<Task> {
        self.state.read().await.waiting.get(&id).cloned()
    }

    /// Ids of every parked task
    pub async fn waiting_ids(&self) -> Vec<TaskId> {
        self.state.read().await.waiting.keys().copied().collect()
    }

    /// Unsatisfied prerequisites of `id`, empty when unknown or runnable
    pub async fn unsatisfied_of(&self, id: TaskId) -> Vec<TaskId> {
        let state = self.state.read().await;
        state
            .prerequisites
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .filter(|d| !state.satisfied.contains(d))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> ResolverSnapshot {
        let state = self.state.read().await;
        ResolverSnapshot {
            known_tasks: state.dependents.len(),
            waiting_tasks: state.waiting.len(),
            satisfied_tasks: state.satisfied.len(),
        }
    }

    pub async fn health_check(&self) -> Result<(), String> {
        let _ = self.state.read().await;
        Ok(())
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth-first search for a cycle passing through `start`
///
/// Follows prerequisite -> dependent edges; a path leading back to `start`
/// is returned as the offending cycle.
fn find_cycle_through(
    graph: &HashMap<TaskId, HashSet<TaskId>>,
    start: TaskId,
) -> Option<Vec<TaskId>> {
    let mut path = vec![start];
    let mut visited = HashSet::new();
    dfs(graph, start, start, &mut path, &mut visited)
}

fn dfs(
    graph: &HashMap<TaskId, HashSet<TaskId>>,
    start: TaskId,
    current: TaskId,
    path: &mut Vec<TaskId>,
    visited: &mut HashSet<TaskId>,
) -> Option<Vec<TaskId>> {
    if let Some(next_ids) = graph.get(&current) {
        for next in next_ids {
            if *next == start {
                let mut cycle = path.clone();
                cycle.push(start);
                return Some(cycle);
            }
            if visited.insert(*next) {
                path.push(*next);
                if let Some(cycle) = dfs(graph, start, *next, path, visited) {
                    return Some(cycle);
                }
                path.pop();
            }
        }
    }
    None
}
