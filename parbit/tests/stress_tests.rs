//! Stress tests for timing-dependent bugs.
//!
//! High-concurrency runs intended to flush out races in the queues,
//! the scheduler sync protocol, and the lazy tree's arbitration that
//! would never show up in the small deterministic unit tests.
//!
//! Run with: cargo test --test stress_tests --release

use std::sync::{Arc, Barrier};
use std::thread;

use parbit::lazy::LazySyncTree;
use parbit::queue::{LockingQueue, SpscRing, TaskQueue};
use parbit::scheduler::LockFreeScheduler;
use parbit::{FenwickTree, Operation};

/// SPSC ring under sustained throughput: strict FIFO, nothing lost.
#[test]
fn spsc_ring_fifo_under_load() {
    const COUNT: u64 = 1_000_000;
    let ring = Arc::new(SpscRing::with_capacity(256));
    let barrier = Arc::new(Barrier::new(2));

    let producer = {
        let ring = Arc::clone(&ring);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..COUNT {
                ring.push(i);
            }
        })
    };

    let consumer = {
        let ring = Arc::clone(&ring);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for expected in 0..COUNT {
                let got = ring.pop();
                assert_eq!(got, expected, "element out of order or lost");
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
}

/// SPSC ring with a deliberately bursty producer, forcing the consumer
/// through its park/wake path repeatedly.
#[test]
fn spsc_ring_survives_bursty_producer() {
    const BURSTS: u64 = 200;
    const BURST_LEN: u64 = 64;
    let ring = Arc::new(SpscRing::with_capacity(128));

    let producer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for burst in 0..BURSTS {
                for i in 0..BURST_LEN {
                    ring.push(burst * BURST_LEN + i);
                }
                // Let the consumer drain and park.
                thread::sleep(std::time::Duration::from_micros(200));
            }
        })
    };

    let consumer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for expected in 0..BURSTS * BURST_LEN {
                assert_eq!(ring.pop(), expected);
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
}

/// Locking queue with several producers: total element count is
/// conserved even though interleaving is arbitrary.
#[test]
fn locking_queue_conserves_elements_across_producers() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 50_000;
    let queue = Arc::new(LockingQueue::with_capacity(1024));
    let barrier = Arc::new(Barrier::new(PRODUCERS as usize + 1));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    let consumer = {
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut sum = 0_u64;
            for _ in 0..PRODUCERS * PER_PRODUCER {
                sum += queue.pop();
            }
            sum
        })
    };

    for handle in producers {
        handle.join().unwrap();
    }
    let total = PRODUCERS * PER_PRODUCER;
    let expected: u64 = (0..total).sum();
    assert_eq!(consumer.join().unwrap(), expected, "elements lost or duplicated");
}

/// Scheduler totals stay exact over many update-heavy batches.
#[test]
fn scheduler_totals_exact_over_many_batches() {
    const BATCHES: usize = 50;
    const BATCH_SIZE: usize = 2048;
    let n = 1024;

    let mut scheduler = LockFreeScheduler::new(n, 4, BATCH_SIZE);
    let mut reference = FenwickTree::new(n);

    for batch in 0..BATCHES {
        let ops: Vec<Operation> = (0..BATCH_SIZE)
            .map(|i| {
                let index = (i * 37 + batch * 101) % n;
                if i % 16 == 7 {
                    Operation::query(index)
                } else {
                    Operation::add(index, ((i + batch) % 9) as i64 + 1)
                }
            })
            .collect();

        let expected = reference.run_batch(&ops);
        scheduler.init();
        scheduler.submit_batch(&ops);
        scheduler.sync().expect("worker panicked");
        assert_eq!(scheduler.validate_sum(), expected, "batch {batch}");
    }
    scheduler.shutdown();
}

/// Lazy tree under maximum writer contention on overlapping chains.
#[test]
fn lazy_tree_conserves_mass_under_contention() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 100_000;
    let n = 255;
    let tree = Arc::new(LazySyncTree::new(n));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    tree.add((t * 13 + i * 7) % n, 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tree.sum(n - 1), (THREADS * PER_THREAD) as i64);
}

/// Rapid construct/submit/drop cycles looking for shutdown leaks.
#[test]
fn scheduler_shutdown_cycles_do_not_hang() {
    for round in 0..20 {
        let mut scheduler = LockFreeScheduler::new(64, 3, 64);
        scheduler.init();
        for i in 0..32 {
            scheduler.submit_update((i + round) % 64, 1);
        }
        scheduler.sync().unwrap();
        // Implicit shutdown via drop.
    }
}
