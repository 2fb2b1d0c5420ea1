//! The sequential Fenwick tree primitive.
//!
//! This is the leaf every engine builds on: the task-parallel designs
//! replicate it per worker, the model-parallel designs share one
//! backing array with the same cell invariant, and the driver uses it
//! as the reference when validating batch totals.

use crate::{OpKind, Operation};

/// Lowest set bit of `x`.
#[inline]
pub(crate) fn lowbit(x: usize) -> usize {
    x & x.wrapping_neg()
}

/// A 1-indexed Fenwick tree over `n` logical positions.
///
/// Cell `bits[i]` holds the sum of input values in the index range
/// `(i - lowbit(i), i]`, so a prefix sum walks `x, x - lowbit(x), ...`
/// and an update walks `x, x + lowbit(x), ...`.
///
/// Indices passed to [`add`](Self::add) and [`sum`](Self::sum) are
/// zero-based and must lie in `[0, n)`; anything else is a programmer
/// error and panics on the array access.
#[derive(Debug, Clone)]
pub struct FenwickTree {
    bits: Vec<i64>,
}

impl FenwickTree {
    /// Creates a tree of size `n`, all zeros.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    #[must_use]
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "tree size must be at least 1");
        Self {
            bits: vec![0; n + 1],
        }
    }

    /// Number of logical positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len() - 1
    }

    /// Always false: a tree has at least one position.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Adds `value` at position `index`.
    pub fn add(&mut self, index: usize, value: i64) {
        let mut x = index + 1;
        while x < self.bits.len() {
            self.bits[x] += value;
            x += lowbit(x);
        }
    }

    /// Returns the sum of positions `[0, index]`.
    #[must_use]
    pub fn sum(&self, index: usize) -> i64 {
        let mut total = 0;
        let mut x = index + 1;
        while x > 0 {
            total += self.bits[x];
            x -= lowbit(x);
        }
        total
    }

    /// Applies every `Add` in `ops` in order; queries are skipped.
    pub fn batch_add(&mut self, ops: &[Operation]) {
        for op in ops {
            if op.kind == OpKind::Add {
                self.add(op.index, op.value);
            }
        }
    }

    /// Applies `ops` in order and returns the total query contribution.
    ///
    /// This is the sequential reference the concurrent engines are
    /// validated against: the per-batch sum of their query results
    /// must match this value exactly.
    pub fn run_batch(&mut self, ops: &[Operation]) -> i64 {
        let mut total = 0;
        for op in ops {
            match op.kind {
                OpKind::Add => self.add(op.index, op.value),
                OpKind::Query => total += self.sum(op.index),
            }
        }
        total
    }
}
