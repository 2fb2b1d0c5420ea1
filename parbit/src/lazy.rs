//! Lazy-sync strategy: an atomic-cell shared tree plus the batching
//! policy that makes it worthwhile.
//!
//! [`LazySyncTree`] on its own is slow: every chain write is an
//! atomic fetch-add. The win comes from the stream structure: between
//! two consecutive queries of a batch, the intervening adds commute at
//! the observation level, so [`LazyEngine`] applies each query-free
//! window with a parallel sweep and only serializes at the query
//! itself. The scope join at the end of a window is the release point
//! that makes the query's loads observe every window write.
//!
//! Reader/writer arbitration uses two counters: writers announce in
//! `writes` and spin while a reader is registered, readers announce in
//! `reads` and spin while a writer is in flight. This is deliberately
//! coarse (single reader at a time, stop-the-world on read), which is
//! exactly the discipline the window policy needs.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::affinity::pin_worker;
use crate::tree::lowbit;
use crate::{OpKind, Operation};

/// A Fenwick tree of atomic cells, safe for concurrent adds.
pub struct LazySyncTree {
    bits: Box<[AtomicI64]>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl LazySyncTree {
    /// Creates a tree of size `n`, all zeros.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    #[must_use]
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "tree size must be at least 1");
        Self {
            bits: (0..=n).map(|_| AtomicI64::new(0)).collect(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Tree size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len() - 1
    }

    /// Always false: a tree has at least one position.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Adds `value` at `index`, concurrently with other writers.
    ///
    /// Blocks (spins) while a reader is registered, then announces
    /// itself in the writer count for the duration of the chain walk.
    pub fn add(&self, index: usize, value: i64) {
        while self.reads.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        self.writes.fetch_add(1, Ordering::AcqRel);

        let mut x = index + 1;
        while x < self.bits.len() {
            self.bits[x].fetch_add(value, Ordering::Relaxed);
            x += lowbit(x);
        }

        self.writes.fetch_sub(1, Ordering::Release);
    }

    /// Prefix sum of `[0, index]`.
    ///
    /// Blocks (spins) until all in-flight writers have retired, then
    /// registers as the reader. The acquire on the `writes` transition
    /// pairs with each writer's release, so the loads below observe
    /// every retired chain write.
    #[must_use]
    pub fn sum(&self, index: usize) -> i64 {
        while self.writes.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        self.reads.fetch_add(1, Ordering::AcqRel);

        let mut total = 0;
        let mut x = index + 1;
        while x > 0 {
            total += self.bits[x].load(Ordering::Relaxed);
            x -= lowbit(x);
        }

        self.reads.fetch_sub(1, Ordering::Release);
        total
    }
}

/// Window-batching engine over a [`LazySyncTree`].
///
/// A batch is split at its queries: each query-free prefix is applied
/// by `num_workers` scoped threads striding the window, then the query
/// runs against the synced tree. Per-slot answers can differ from the
/// strict in-order evaluation only when the driver reorders inside a
/// window, which it never does for queries, so the batch total
/// matches the sequential reference exactly.
pub struct LazyEngine {
    tree: LazySyncTree,
    num_workers: usize,
}

impl LazyEngine {
    /// Creates the engine with `num_workers` window threads.
    ///
    /// # Panics
    ///
    /// Panics if any parameter is zero.
    #[must_use]
    pub fn new(tree_size: usize, num_workers: usize) -> Self {
        assert!(num_workers > 0, "need at least one worker");
        Self {
            tree: LazySyncTree::new(tree_size),
            num_workers,
        }
    }

    /// The underlying shared tree.
    #[must_use]
    pub fn tree(&self) -> &LazySyncTree {
        &self.tree
    }

    /// Processes one batch and returns its total query contribution.
    pub fn run_batch(&self, ops: &[Operation]) -> i64 {
        let mut total = 0;
        let mut window_start = 0;
        for (pos, op) in ops.iter().enumerate() {
            if op.kind == OpKind::Query {
                self.apply_window(&ops[window_start..pos]);
                total += self.tree.sum(op.index);
                window_start = pos + 1;
            }
        }
        self.apply_window(&ops[window_start..]);
        total
    }

    /// Applies a query-free window of adds in parallel.
    fn apply_window(&self, window: &[Operation]) {
        if window.is_empty() {
            return;
        }
        // Not worth spawning for tiny windows or a single worker.
        if self.num_workers == 1 || window.len() < 64 {
            for op in window {
                self.tree.add(op.index, op.value);
            }
            return;
        }

        let tree = &self.tree;
        std::thread::scope(|scope| {
            for worker in 0..self.num_workers {
                scope.spawn(move || {
                    pin_worker(worker);
                    for op in window.iter().skip(worker).step_by(self.num_workers) {
                        tree.add(op.index, op.value);
                    }
                });
            }
        });
    }
}
