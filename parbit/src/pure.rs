//! Decentralized task-parallel engine: no queues, no dispatcher.
//!
//! Each worker receives the entire operation slice and walks it in
//! order against its own private replica. Updates are claimed by
//! position: a worker executes the adds whose running add-count is
//! congruent to its id modulo the worker count, which is the same
//! fixed sharding the centralized schedulers produce, minus the
//! dispatch machinery. Queries are answered by every worker from its
//! replica into the shared, padded result vector.
//!
//! Workers are scoped to the batch: `run_batch` spawns them and the
//! scope join is the batch barrier.

use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

use crate::affinity::pin_worker;
use crate::tree::FenwickTree;
use crate::{OpKind, Operation};

/// Replicated-tree engine with per-batch scoped workers.
pub struct PureParallel {
    replicas: Vec<FenwickTree>,
    results: Vec<CachePadded<AtomicI64>>,
}

impl PureParallel {
    /// Creates `num_workers` replicas of a tree of size `tree_size`,
    /// accepting batches of up to `batch_size` operations.
    ///
    /// # Panics
    ///
    /// Panics if any parameter is zero.
    #[must_use]
    pub fn new(tree_size: usize, num_workers: usize, batch_size: usize) -> Self {
        assert!(tree_size > 0, "tree size must be at least 1");
        assert!(num_workers > 0, "need at least one worker");
        assert!(batch_size > 0, "batch size must be at least 1");
        Self {
            replicas: (0..num_workers)
                .map(|_| FenwickTree::new(tree_size))
                .collect(),
            results: (0..batch_size)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
        }
    }

    /// Number of worker replicas.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.replicas.len()
    }

    /// Clears the per-batch result slots.
    pub fn init(&self) {
        for slot in &self.results {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Processes one batch to completion.
    ///
    /// Returns when every worker has walked the whole slice; replica
    /// state carries over to the next batch.
    ///
    /// # Panics
    ///
    /// Panics if the batch exceeds the configured batch size.
    pub fn run_batch(&mut self, ops: &[Operation]) {
        assert!(
            ops.len() <= self.results.len(),
            "batch exceeds configured size"
        );
        let workers = self.replicas.len();
        let results = &self.results;

        std::thread::scope(|scope| {
            for (worker, replica) in self.replicas.iter_mut().enumerate() {
                scope.spawn(move || {
                    pin_worker(worker);
                    let mut add_count = 0_usize;
                    for (slot, op) in ops.iter().enumerate() {
                        match op.kind {
                            OpKind::Add => {
                                if add_count % workers == worker {
                                    replica.add(op.index, op.value);
                                }
                                add_count += 1;
                            }
                            OpKind::Query => {
                                results[slot]
                                    .fetch_add(replica.sum(op.index), Ordering::Relaxed);
                            }
                        }
                    }
                });
            }
        });
    }

    /// Total query contribution of the current batch.
    ///
    /// Meaningful once `run_batch` has returned; the scope join orders
    /// every worker's slot writes before these reads.
    #[must_use]
    pub fn validate_sum(&self) -> i64 {
        self.results
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }
}
