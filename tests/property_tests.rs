//! Property checks over the substrate's pure and near-pure components

use proptest::prelude::*;
use taskfabric::error_classifier::ErrorClassifier;
use taskfabric::resource_manager::{AllocationStrategy, ResourceManager, ResourceManagerConfig};
use taskfabric::retry::RetryDelayCalculator;
use taskfabric::task_queue::{QueueStrategy, TaskQueue};
use taskfabric::types::{ErrorCategory, Priority, ResourceRequest, RetryPolicy, SubmitOptions, Task};

fn priority_from(index: u8) -> Priority {
    match index % 4 {
        0 => Priority::Critical,
        1 => Priority::High,
        2 => Priority::Medium,
        _ => Priority::Low,
    }
}

fn task_with_priority(priority: Priority) -> Task {
    Task::from_options(
        "noop".to_string(),
        vec![],
        SubmitOptions {
            priority,
            ..SubmitOptions::default()
        },
    )
}

proptest! {
    /// Computed delays stay within [exponential * (1 - 0.5 * jitter), max_delay]
    #[test]
    fn retry_delay_within_bounds(
        base in 1u64..2_000,
        factor in 1.0f64..4.0,
        jitter in 0.0f64..1.0,
        attempt in 1u32..8,
        max_delay in 1_000u64..200_000,
    ) {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: base,
            max_delay_ms: max_delay,
            backoff_factor: factor,
            jitter_factor: jitter,
            retry_on: vec![ErrorCategory::Transient],
        };
        let calc = RetryDelayCalculator::with_seed(42);
        let delay_ms = calc.delay_for_attempt(&policy, attempt).as_millis() as u64;

        prop_assert!(delay_ms <= max_delay);

        let exponential = base as f64 * factor.powi(attempt as i32 - 1);
        let floor = (exponential * (1.0 - 0.5 * jitter)).min(max_delay as f64);
        // One millisecond of slack for integer truncation
        prop_assert!(delay_ms as f64 + 1.0 >= floor);
    }

    /// Classification is total and well-formed for arbitrary inputs
    #[test]
    fn classifier_is_total(input in ".*") {
        let classification = ErrorClassifier::new().classify(&input);
        prop_assert!((0.0..=1.0).contains(&classification.confidence));
        prop_assert!(!classification.pattern.is_empty());
    }

    /// Strict priority: dequeue order never pops a lower priority while a
    /// higher one is still queued
    #[test]
    fn priority_queue_is_strict(priorities in proptest::collection::vec(0u8..4, 1..40)) {
        let mut queue = TaskQueue::new(QueueStrategy::Priority);
        for p in &priorities {
            queue.enqueue(task_with_priority(priority_from(*p)));
        }

        let mut drained = Vec::new();
        while let Some(task) = queue.dequeue() {
            drained.push(task.priority);
        }

        prop_assert_eq!(drained.len(), priorities.len());
        for pair in drained.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }

    /// Changing strategy (twice) preserves the queued task set
    #[test]
    fn change_strategy_preserves_tasks(
        priorities in proptest::collection::vec(0u8..4, 0..30),
        strategy_index in 0usize..6,
    ) {
        let strategies = [
            QueueStrategy::Fifo,
            QueueStrategy::Priority,
            QueueStrategy::Deadline,
            QueueStrategy::ResourceAware,
            QueueStrategy::MlOptimized,
            QueueStrategy::Hybrid,
        ];
        let target = strategies[strategy_index];

        let mut queue = TaskQueue::new(QueueStrategy::Fifo);
        let mut ids: Vec<_> = Vec::new();
        for p in &priorities {
            let task = task_with_priority(priority_from(*p));
            ids.push(task.id);
            queue.enqueue(task);
        }

        queue.change_strategy(target);
        queue.change_strategy(target);

        let mut listed: Vec<_> = queue.list().iter().map(|t| t.id).collect();
        listed.sort();
        ids.sort();
        prop_assert_eq!(listed, ids);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Releasing twice leaves the same pool state as releasing once, and the
    /// pool returns to empty
    #[test]
    fn release_is_idempotent(amounts in proptest::collection::vec(0.0f64..4.0, 1..6)) {
        tokio_test::block_on(async {
            let manager = ResourceManager::new(ResourceManagerConfig {
                capacities: [("cpu".to_string(), 1_000.0)].into_iter().collect(),
                kind_costs: Default::default(),
                strategy: AllocationStrategy::FirstFit,
            });

            let requests: Vec<ResourceRequest> = amounts
                .iter()
                .map(|a| ResourceRequest::new("cpu", *a))
                .collect();
            let id = manager
                .allocate(uuid::Uuid::new_v4(), &requests)
                .await
                .unwrap();

            assert!(manager.release(id).await);
            let once = manager.snapshot().await;
            assert!(!manager.release(id).await);
            let twice = manager.snapshot().await;

            assert_eq!(once.kinds[0].allocated, twice.kinds[0].allocated);
            assert_eq!(twice.kinds[0].allocated, 0.0);
        });
    }
}
