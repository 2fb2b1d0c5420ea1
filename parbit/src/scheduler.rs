//! Centralized task-parallel schedulers over replicated trees.
//!
//! The tree is replicated: every worker owns a private sequential
//! Fenwick tree and an inbound task queue. Updates are sharded
//! round-robin, so each lands in exactly one replica; queries are
//! broadcast, and every worker adds its replica's prefix sum into the
//! query's result slot. Because `sum` is linear in the applied
//! updates, the slot total equals the prefix sum of the logically
//! merged tree.
//!
//! The scheduler is generic over the queue so the central
//! (mutex+condvar) and lock-free (SPSC ring) variants share every line
//! of dispatch and worker logic; see [`CentralScheduler`] and
//! [`LockFreeScheduler`].

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;

use crate::affinity::pin_worker;
use crate::queue::{LockingQueue, SpscRing, TaskQueue};
use crate::tree::FenwickTree;
use crate::{EngineError, OpKind, Operation};

/// A task on the dispatcher-to-worker wire.
#[derive(Debug, Clone, Copy)]
pub enum Task {
    /// Apply `add(index, value)` on the receiving worker's replica.
    Update {
        /// Zero-based tree index.
        index: usize,
        /// Value to add.
        value: i64,
    },
    /// Add the replica's `sum(index)` into result slot `slot`.
    Query {
        /// Zero-based tree index.
        index: usize,
        /// Position of the query in the current batch.
        slot: usize,
    },
    /// Bump the sync counter; the dispatcher is draining the batch.
    Sync,
    /// Exit the worker loop.
    Finish,
}

/// Scheduler built on [`LockingQueue`] per-worker queues.
pub type CentralScheduler = Scheduler<LockingQueue<Task>>;

/// Scheduler built on [`SpscRing`] per-worker queues.
pub type LockFreeScheduler = Scheduler<SpscRing<Task>>;

/// State shared between the dispatcher and all workers.
struct Shared {
    /// One result slot per batch position. Only query slots are ever
    /// written, via relaxed fetch-add: accumulation is commutative and
    /// the sync barrier orders the final reads.
    results: Vec<CachePadded<AtomicI64>>,
    /// Workers that have processed the current `Sync` task.
    sync_arrivals: AtomicUsize,
    /// `worker_id + 1` of a panicked worker, or 0 if all are healthy.
    poisoned: AtomicUsize,
}

impl Shared {
    fn poison(&self, worker: usize) {
        self.poisoned.store(worker + 1, Ordering::Release);
    }

    fn poisoned_worker(&self) -> Option<usize> {
        match self.poisoned.load(Ordering::Acquire) {
            0 => None,
            id => Some(id - 1),
        }
    }
}

/// Sets the poisoned flag if the worker unwinds instead of finishing.
///
/// Armed for the whole worker loop and defused only on a clean
/// `Finish`, so any panic (replica index out of range, queue bug)
/// turns the dispatcher's sync spin into an immediate error instead of
/// a hang.
struct PoisonGuard {
    shared: Arc<Shared>,
    worker: usize,
    armed: bool,
}

impl PoisonGuard {
    fn new(shared: Arc<Shared>, worker: usize) -> Self {
        Self {
            shared,
            worker,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for PoisonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.poison(self.worker);
        }
    }
}

/// Centralized dispatcher with one pinned worker thread per replica.
///
/// Construction spawns and pins the workers; they block on their
/// queues until tasks arrive. The dispatcher is single-threaded by
/// contract, which is why the round-robin counter is a plain integer
/// rather than an atomic.
pub struct Scheduler<Q: TaskQueue<Task> + 'static> {
    queues: Vec<Arc<Q>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    round_robin: usize,
    batch_size: usize,
}

impl<Q: TaskQueue<Task> + 'static> Scheduler<Q> {
    /// Creates a scheduler with `num_workers` replicas of a tree of
    /// size `tree_size`, accepting batches of up to `batch_size`
    /// operations.
    ///
    /// Queues are sized for the worst-case backlog of one batch (an
    /// all-query batch broadcasts every operation to every worker)
    /// plus the trailing `Sync`, so enqueue never blocks under the
    /// documented batch discipline.
    ///
    /// # Panics
    ///
    /// Panics if any parameter is zero.
    #[must_use]
    pub fn new(tree_size: usize, num_workers: usize, batch_size: usize) -> Self {
        assert!(tree_size > 0, "tree size must be at least 1");
        assert!(num_workers > 0, "need at least one worker");
        assert!(batch_size > 0, "batch size must be at least 1");

        let shared = Arc::new(Shared {
            results: (0..batch_size)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
            sync_arrivals: AtomicUsize::new(0),
            poisoned: AtomicUsize::new(0),
        });

        let queues: Vec<Arc<Q>> = (0..num_workers)
            .map(|_| Arc::new(Q::with_capacity(batch_size + 2)))
            .collect();

        let workers = (0..num_workers)
            .map(|worker| {
                let queue = Arc::clone(&queues[worker]);
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("parbit-worker-{worker}"))
                    .spawn(move || worker_loop(worker, tree_size, queue.as_ref(), &shared))
                    .expect("failed to spawn scheduler worker")
            })
            .collect();

        Self {
            queues,
            workers,
            shared,
            round_robin: 0,
            batch_size,
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }

    /// Clears per-batch state: result slots and the sync counter.
    ///
    /// Must only be called with no outstanding submitted operations,
    /// i.e. after `sync()` or before the first submission.
    pub fn init(&self) {
        for slot in &self.shared.results {
            slot.store(0, Ordering::Relaxed);
        }
        self.shared.sync_arrivals.store(0, Ordering::Release);
    }

    /// Enqueues an update onto the next worker, round-robin.
    pub fn submit_update(&mut self, index: usize, value: i64) {
        let worker = self.round_robin % self.queues.len();
        self.round_robin += 1;
        self.queues[worker].push(Task::Update { index, value });
    }

    /// Broadcasts a query to every worker.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is outside the configured batch size.
    pub fn submit_query(&mut self, index: usize, slot: usize) {
        assert!(slot < self.batch_size, "query slot out of batch range");
        for queue in &self.queues {
            queue.push(Task::Query { index, slot });
        }
    }

    /// Submits a whole batch in order.
    ///
    /// `Add` operations shard round-robin, queries broadcast with
    /// their batch position as the result slot.
    pub fn submit_batch(&mut self, ops: &[Operation]) {
        assert!(ops.len() <= self.batch_size, "batch exceeds configured size");
        for (slot, op) in ops.iter().enumerate() {
            match op.kind {
                OpKind::Add => self.submit_update(op.index, op.value),
                OpKind::Query => self.submit_query(op.index, slot),
            }
        }
    }

    /// Drains the current batch: broadcasts `Sync` and waits until all
    /// workers have passed it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WorkerPanicked`] if a worker died, so
    /// the caller is not left spinning on a counter that can never
    /// complete.
    pub fn sync(&mut self) -> Result<(), EngineError> {
        for queue in &self.queues {
            queue.push(Task::Sync);
        }

        let workers = self.queues.len();
        let mut spins = 0_u32;
        while self.shared.sync_arrivals.load(Ordering::Acquire) < workers {
            if let Some(worker) = self.shared.poisoned_worker() {
                return Err(EngineError::WorkerPanicked { worker });
            }
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        self.shared.sync_arrivals.store(0, Ordering::Release);
        Ok(())
    }

    /// Total query contribution of the current batch.
    ///
    /// Only meaningful after `sync()`: the sync counter's
    /// acquire/release pairing orders every worker's slot writes
    /// before these reads.
    #[must_use]
    pub fn validate_sum(&self) -> i64 {
        self.shared
            .results
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    /// Broadcasts `Finish` and joins all workers.
    ///
    /// Idempotent; also invoked from `Drop` so workers cannot leak
    /// when the dispatcher unwinds.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for queue in &self.queues {
            queue.push(Task::Finish);
        }
        for handle in self.workers.drain(..) {
            // A panicked worker already reported through the poisoned
            // flag; surfacing the join error again adds nothing.
            let _ = handle.join();
        }
    }
}

impl<Q: TaskQueue<Task> + 'static> Drop for Scheduler<Q> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<Q: TaskQueue<Task>>(worker: usize, tree_size: usize, queue: &Q, shared: &Arc<Shared>) {
    pin_worker(worker);
    let guard = PoisonGuard::new(Arc::clone(shared), worker);
    let mut replica = FenwickTree::new(tree_size);

    loop {
        match queue.pop() {
            Task::Update { index, value } => replica.add(index, value),
            Task::Query { index, slot } => {
                shared.results[slot].fetch_add(replica.sum(index), Ordering::Relaxed);
            }
            Task::Sync => {
                shared.sync_arrivals.fetch_add(1, Ordering::AcqRel);
            }
            Task::Finish => break,
        }
    }

    guard.defuse();
}
