//! Batch-total equivalence of every engine against the sequential
//! reference.
//!
//! For each strategy: feed the same seeded random batches to the
//! engine and to a sequential Fenwick tree, and require the per-batch
//! total query contribution (or the resulting tree state, for the
//! model-parallel engines that serve queries between batches) to match
//! exactly, batch after batch, with state carried across batches.

use parbit::lazy::LazyEngine;
use parbit::pipeline::PipelineTree;
use parbit::pure::PureParallel;
use parbit::scheduler::{CentralScheduler, LockFreeScheduler};
use parbit::{FenwickTree, OpKind, Operation};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const TREE_SIZE: usize = 513;
const BATCH_SIZE: usize = 600;
const NUM_BATCHES: usize = 8;

fn random_batch(rng: &mut SmallRng, n: usize, len: usize, query_permille: u32) -> Vec<Operation> {
    (0..len)
        .map(|_| {
            let index = rng.gen_range(0..n);
            if rng.gen_range(0..1000) < query_permille {
                Operation::query(index)
            } else {
                Operation::add(index, rng.gen_range(1..=100))
            }
        })
        .collect()
}

#[test]
fn central_scheduler_equals_reference() {
    let mut rng = SmallRng::seed_from_u64(1);
    let mut scheduler = CentralScheduler::new(TREE_SIZE, 3, BATCH_SIZE);
    let mut reference = FenwickTree::new(TREE_SIZE);

    for batch in 0..NUM_BATCHES {
        let ops = random_batch(&mut rng, TREE_SIZE, BATCH_SIZE, 200);
        let expected = reference.run_batch(&ops);

        scheduler.init();
        scheduler.submit_batch(&ops);
        scheduler.sync().expect("worker panicked");
        assert_eq!(scheduler.validate_sum(), expected, "batch {batch}");
    }
    scheduler.shutdown();
}

#[test]
fn lockfree_scheduler_equals_reference() {
    let mut rng = SmallRng::seed_from_u64(2);
    let mut scheduler = LockFreeScheduler::new(TREE_SIZE, 4, BATCH_SIZE);
    let mut reference = FenwickTree::new(TREE_SIZE);

    for batch in 0..NUM_BATCHES {
        let ops = random_batch(&mut rng, TREE_SIZE, BATCH_SIZE, 300);
        let expected = reference.run_batch(&ops);

        scheduler.init();
        scheduler.submit_batch(&ops);
        scheduler.sync().expect("worker panicked");
        assert_eq!(scheduler.validate_sum(), expected, "batch {batch}");
    }
    scheduler.shutdown();
}

#[test]
fn pure_parallel_equals_reference() {
    let mut rng = SmallRng::seed_from_u64(3);
    let mut engine = PureParallel::new(TREE_SIZE, 4, BATCH_SIZE);
    let mut reference = FenwickTree::new(TREE_SIZE);

    for batch in 0..NUM_BATCHES {
        let ops = random_batch(&mut rng, TREE_SIZE, BATCH_SIZE, 200);
        let expected = reference.run_batch(&ops);

        engine.init();
        engine.run_batch(&ops);
        assert_eq!(engine.validate_sum(), expected, "batch {batch}");
    }
}

#[test]
fn lazy_engine_equals_reference() {
    let mut rng = SmallRng::seed_from_u64(4);
    let engine = LazyEngine::new(TREE_SIZE, 3);
    let mut reference = FenwickTree::new(TREE_SIZE);

    for batch in 0..NUM_BATCHES {
        let ops = random_batch(&mut rng, TREE_SIZE, BATCH_SIZE, 100);
        let expected = reference.run_batch(&ops);
        assert_eq!(engine.run_batch(&ops), expected, "batch {batch}");
    }
}

fn pipeline_equals_reference(tree: &PipelineTree, seed: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let n = tree.len();
    let mut reference = FenwickTree::new(n);

    for batch in 0..NUM_BATCHES {
        let ops = random_batch(&mut rng, n, BATCH_SIZE, 0);
        tree.batch_add(&ops);
        reference.batch_add(&ops);

        for i in (0..n).step_by(17).chain([n - 1]) {
            assert_eq!(
                tree.sum(i),
                reference.sum(i),
                "batch {batch}, prefix {i} diverged"
            );
        }
    }
}

#[test]
fn pipeline_fixed_size_equals_reference() {
    pipeline_equals_reference(&PipelineTree::fixed_size(TREE_SIZE, 4), 5);
}

#[test]
fn pipeline_access_aware_equals_reference() {
    pipeline_equals_reference(&PipelineTree::access_aware(TREE_SIZE, 4), 6);
}

#[test]
fn pipeline_semi_static_equals_reference() {
    pipeline_equals_reference(&PipelineTree::semi_static(TREE_SIZE, 4), 7);
}

#[test]
fn pipeline_aggregate_equals_reference() {
    pipeline_equals_reference(&PipelineTree::aggregate(TREE_SIZE, 4), 8);
}

#[test]
fn pipeline_handles_worker_counts_beyond_tree_size() {
    // N = 1 with several workers: everyone past the first idles.
    let tree = PipelineTree::access_aware(1, 4);
    let ops: Vec<Operation> = (0..100).map(|_| Operation::add(0, 1)).collect();
    tree.batch_add(&ops);
    assert_eq!(tree.sum(0), 100);
}

#[test]
fn schedulers_agree_with_each_other() {
    let mut rng = SmallRng::seed_from_u64(9);
    let mut central = CentralScheduler::new(128, 2, BATCH_SIZE);
    let mut lockfree = LockFreeScheduler::new(128, 3, BATCH_SIZE);

    for _ in 0..4 {
        let ops = random_batch(&mut rng, 128, BATCH_SIZE, 250);

        central.init();
        central.submit_batch(&ops);
        central.sync().unwrap();

        lockfree.init();
        lockfree.submit_batch(&ops);
        lockfree.sync().unwrap();

        assert_eq!(central.validate_sum(), lockfree.validate_sum());
    }
}

#[test]
fn single_worker_engines_reduce_to_sequential() {
    let mut rng = SmallRng::seed_from_u64(10);
    let ops = random_batch(&mut rng, 64, 500, 300);

    let mut reference = FenwickTree::new(64);
    let expected = reference.run_batch(&ops);

    let mut scheduler = CentralScheduler::new(64, 1, 500);
    scheduler.init();
    scheduler.submit_batch(&ops);
    scheduler.sync().unwrap();
    assert_eq!(scheduler.validate_sum(), expected);

    let mut pure = PureParallel::new(64, 1, 500);
    pure.init();
    pure.run_batch(&ops);
    assert_eq!(pure.validate_sum(), expected);

    let lazy = LazyEngine::new(64, 1);
    let mut lazy_reference = FenwickTree::new(64);
    let lazy_expected = lazy_reference.run_batch(&ops);
    assert_eq!(lazy.run_batch(&ops), lazy_expected);
}
