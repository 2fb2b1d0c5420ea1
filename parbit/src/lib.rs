//! Parbit: parallel execution strategies for a Fenwick tree.
//!
//! A Fenwick tree (binary indexed tree) maintains an integer array of
//! length N under two operations: `add(i, v)` adds `v` to position `i`
//! and `sum(i)` returns the prefix sum of positions `[0, i]`, both in
//! O(log N). This crate explores how far a mixed update/query stream
//! can be pushed past the sequential baseline without changing the
//! observable query totals per batch.
//!
//! # Engine families
//!
//! Two families of concurrent engines are provided:
//!
//! - **Model-parallel** ([`pipeline`]): one shared tree partitioned by
//!   index range across a pool of pinned workers. Every worker scans
//!   every operation but writes only inside its own slab, so the hot
//!   path needs no synchronization at all. Variants differ in how the
//!   partition is chosen: fixed (planned once), semi-static (adjusted
//!   from per-batch timing feedback), and aggregate (per-worker shadow
//!   slab flushed in one sweep per batch).
//! - **Task-parallel** ([`scheduler`], [`pure`]): the tree is
//!   replicated, one private copy per worker. Updates are sharded
//!   round-robin; queries fan out to every replica and the per-replica
//!   prefix sums are accumulated, which is exact because `sum` is
//!   linear in the applied updates.
//!
//! The [`lazy`] module holds the atomic-cell tree and the window
//! batching policy built on top of it, and [`locked`] the striped-lock
//! baseline. [`partition`] computes load-balanced index ranges from
//! the access frequency induced by the Fenwick update path.
//!
//! # Ordering contract
//!
//! Within a batch no particular interleaving is guaranteed. After a
//! batch drains, the total query contribution equals what the
//! sequential primitive produces for the same operation sequence, and
//! the tree state observed between batches is fully consistent.

pub mod affinity;
pub mod lazy;
pub mod locked;
pub mod partition;
pub mod pipeline;
pub mod pure;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod tree;

pub use tree::FenwickTree;

/// The kind of a stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Point update: add a value at an index.
    Add,
    /// Prefix-sum query over `[0, index]`.
    Query,
}

/// A single operation in the input stream.
///
/// Batches are ordered slices of these; batch boundaries are the only
/// ordering barriers the engines expose.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    /// Operation kind.
    pub kind: OpKind,
    /// Zero-based tree index in `[0, N)`.
    pub index: usize,
    /// Value to add. Unused for queries.
    pub value: i64,
}

impl Operation {
    /// Creates a point update.
    #[must_use]
    pub fn add(index: usize, value: i64) -> Self {
        Self {
            kind: OpKind::Add,
            index,
            value,
        }
    }

    /// Creates a prefix-sum query.
    #[must_use]
    pub fn query(index: usize) -> Self {
        Self {
            kind: OpKind::Query,
            index,
            value: 0,
        }
    }
}

/// Errors surfaced by the concurrent engines.
///
/// Invariant violations (bad tree size, partition coverage, queue
/// capacity) are programmer errors and panic immediately instead of
/// being reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// A worker thread panicked while processing a batch.
    ///
    /// The dispatcher inspects a poisoned flag during `sync()` so it
    /// fails fast instead of spinning on a counter that will never
    /// reach the worker count.
    WorkerPanicked {
        /// Index of the worker that died.
        worker: usize,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerPanicked { worker } => {
                write!(f, "worker {worker} panicked while processing a batch")
            }
        }
    }
}

impl std::error::Error for EngineError {}
