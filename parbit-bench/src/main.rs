//! Benchmark driver for the parbit Fenwick tree engines.
//!
//! Feeds a generated operation stream to the selected strategy in
//! fixed-size batches, times the run, and (where the strategy supports
//! it) validates every batch total against the sequential reference.
//! Exit code is nonzero on a validation mismatch.
//!
//! # Usage
//!
//! ```bash
//! parbit-bench -t central_scheduler -p 8 -b 8192 -n 512 -s 2097151
//! parbit-bench -t pipeline-access-aware -p 4 --stats
//! ```

// CLI tools need to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod generator;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};

use generator::{Generator, DEFAULT_SEED};
use parbit::lazy::LazyEngine;
use parbit::locked::LockedTree;
use parbit::pipeline::PipelineTree;
use parbit::pure::PureParallel;
use parbit::queue::TaskQueue;
use parbit::report::RunReport;
use parbit::scheduler::{Scheduler, Task};
use parbit::{FenwickTree, OpKind, Operation};

/// Query permille values swept by the query-percentage strategies.
const QUERY_SWEEP: [u32; 8] = [0, 1, 5, 10, 50, 100, 500, 1000];

/// Execution strategies selectable via `-t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    /// Single-threaded baseline.
    Sequential,
    /// Striped-lock shared tree, batch parallelized across threads.
    Lock,
    /// Shared tree, fixed uniform partition.
    PipelineFixedSize,
    /// Shared tree, fixed access-weighted partition.
    PipelineAccessAware,
    /// Shared tree, partition rebalanced from timing feedback.
    PipelineSemiStatic,
    /// Shared tree, per-worker shadow slabs flushed once per batch.
    PipelineAggregate,
    /// Atomic tree with query-window batching.
    Lazy,
    /// Replicated trees behind mutex+condvar queues.
    #[value(name = "central_scheduler")]
    CentralScheduler,
    /// Replicated trees behind SPSC rings.
    #[value(name = "lockfree_scheduler")]
    LockfreeScheduler,
    /// Replicated trees, no dispatcher: workers walk the batch.
    #[value(name = "pure_parallel")]
    PureParallel,
    /// Sweep query rates through the lazy engine.
    #[value(name = "query_percentage_lazy")]
    QueryPercentageLazy,
    /// Sweep query rates through the decentralized engine.
    #[value(name = "query_percentage_pure")]
    QueryPercentagePure,
}

/// Parallel Fenwick tree benchmark driver.
#[derive(Parser, Debug)]
#[command(name = "parbit-bench", version, about)]
struct Args {
    /// Execution strategy.
    #[arg(short = 't', long = "strategy", default_value = "sequential")]
    strategy: Strategy,

    /// Number of threads to use.
    #[arg(short = 'p', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Operations per batch.
    #[arg(short = 'b', long = "batch-size", default_value_t = 1 << 16)]
    batch_size: usize,

    /// Number of batches.
    #[arg(short = 'n', long = "batches", default_value_t = 1024)]
    num_batches: usize,

    /// Tree size N.
    #[arg(short = 's', long = "size", default_value_t = (1 << 20) - 1)]
    size: usize,

    /// Query share of generated operations, in permille.
    #[arg(long = "query-permille", default_value_t = 200)]
    query_permille: u32,

    /// RNG seed for the operation stream.
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Dump partition statistics to stderr (pipeline strategies).
    #[arg(long)]
    stats: bool,

    /// Write a JSON measurement report to this file.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let report = match args.strategy {
        Strategy::Sequential => run_sequential(&args)?,
        Strategy::Lock => run_lock(&args)?,
        Strategy::PipelineFixedSize
        | Strategy::PipelineAccessAware
        | Strategy::PipelineSemiStatic
        | Strategy::PipelineAggregate => run_pipeline(&args)?,
        Strategy::Lazy => run_lazy(&args)?,
        Strategy::CentralScheduler => {
            run_scheduler::<parbit::queue::LockingQueue<Task>>(&args, "Central Scheduler")?
        }
        Strategy::LockfreeScheduler => {
            run_scheduler::<parbit::queue::SpscRing<Task>>(&args, "Lockfree Scheduler")?
        }
        Strategy::PureParallel => run_pure(&args)?,
        Strategy::QueryPercentageLazy => run_query_sweep_lazy(&args)?,
        Strategy::QueryPercentagePure => run_query_sweep_pure(&args)?,
    };

    if let Some(path) = &args.output {
        let json = report
            .to_json_string(true)
            .context("serializing measurement report")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        eprintln!("wrote report to {}", path.display());
    }

    Ok(())
}

fn strategy_name(strategy: Strategy) -> String {
    strategy
        .to_possible_value()
        .expect("no skipped variants")
        .get_name()
        .to_string()
}

fn new_report(args: &Args) -> RunReport {
    RunReport::new(
        strategy_name(args.strategy),
        args.threads,
        args.size,
        args.batch_size,
        args.num_batches,
    )
}

/// Prints the throughput block shared by the sequential and lock runs.
fn print_throughput(total_ops: usize, total_micros: u128, generating_micros: u128, batches: usize) {
    let computation = total_micros.saturating_sub(generating_micros);
    println!("Performance:");
    println!("Total operations: {total_ops}");
    println!("Total execution time: {total_micros} microseconds");
    println!("Total data generating time: {generating_micros} microseconds");
    println!("Total computation time: {computation} microseconds");
    println!(
        "Batch computation time: {} microseconds",
        computation / (batches.max(1) as u128)
    );
    println!(
        "Average time per operation: {} microseconds",
        total_micros / (total_ops.max(1) as u128)
    );
    println!();
}

fn run_sequential(args: &Args) -> Result<RunReport> {
    let mut tree = FenwickTree::new(args.size);
    let mut generator = Generator::new(args.size, args.query_permille, args.seed);
    let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

    let mut generating_micros = 0_u128;
    let run_start = Instant::now();
    for _ in 0..args.num_batches {
        let gen_start = Instant::now();
        generator.fill(&mut ops, args.batch_size);
        generating_micros += gen_start.elapsed().as_micros();

        let _ = tree.run_batch(&ops);
    }
    let total_micros = run_start.elapsed().as_micros();

    let total_ops = args.batch_size * args.num_batches;
    print_throughput(total_ops, total_micros, generating_micros, args.num_batches);

    let mut report = new_report(args);
    #[allow(clippy::cast_precision_loss)]
    report.push("sequential", total_micros as f64 / 1e6, None);
    Ok(report)
}

fn run_lock(args: &Args) -> Result<RunReport> {
    use std::sync::atomic::{AtomicI64, Ordering};

    let tree = LockedTree::new(args.size);
    let mut generator = Generator::new(args.size, args.query_permille, args.seed);
    let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);
    let threads = args.threads.max(1);
    // Query results are racy by this strategy's contract; they are
    // drained into a sink so the sums are not optimized away.
    let sink = AtomicI64::new(0);

    let mut generating_micros = 0_u128;
    let run_start = Instant::now();
    for _ in 0..args.num_batches {
        let gen_start = Instant::now();
        generator.fill(&mut ops, args.batch_size);
        generating_micros += gen_start.elapsed().as_micros();

        let tree = &tree;
        let ops = &ops;
        let sink = &sink;
        std::thread::scope(|scope| {
            for worker in 0..threads {
                scope.spawn(move || {
                    let mut local = 0_i64;
                    for op in ops.iter().skip(worker).step_by(threads) {
                        match op.kind {
                            OpKind::Add => tree.add(op.index, op.value),
                            OpKind::Query => local += tree.sum(op.index),
                        }
                    }
                    sink.fetch_add(local, Ordering::Relaxed);
                });
            }
        });
    }
    let total_micros = run_start.elapsed().as_micros();

    let total_ops = args.batch_size * args.num_batches;
    print_throughput(total_ops, total_micros, generating_micros, args.num_batches);

    let mut report = new_report(args);
    #[allow(clippy::cast_precision_loss)]
    report.push("lock", total_micros as f64 / 1e6, None);
    Ok(report)
}

fn run_pipeline(args: &Args) -> Result<RunReport> {
    let workers = args.threads.max(1);
    let tree = match args.strategy {
        Strategy::PipelineFixedSize => PipelineTree::fixed_size(args.size, workers),
        Strategy::PipelineAccessAware => PipelineTree::access_aware(args.size, workers),
        Strategy::PipelineSemiStatic => PipelineTree::semi_static(args.size, workers),
        Strategy::PipelineAggregate => PipelineTree::aggregate(args.size, workers),
        _ => unreachable!("non-pipeline strategy routed to run_pipeline"),
    };
    let mut reference = FenwickTree::new(args.size);

    // batch_add consumes updates only; queries are served between
    // batches, so the stream is generated update-only and the driver
    // probes prefix sums against the reference after every batch.
    let mut generator = Generator::new(args.size, 0, args.seed);
    let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

    let mut generating_micros = 0_u128;
    let run_start = Instant::now();
    for batch in 0..args.num_batches {
        let gen_start = Instant::now();
        generator.fill(&mut ops, args.batch_size);
        generating_micros += gen_start.elapsed().as_micros();

        tree.batch_add(&ops);
        reference.batch_add(&ops);

        let probe = (batch * 4097) % args.size;
        let expected = (reference.sum(args.size - 1), reference.sum(probe));
        let actual = (tree.sum(args.size - 1), tree.sum(probe));
        ensure!(
            actual == expected,
            "validation mismatch at batch {batch}: engine {actual:?} != sequential {expected:?}"
        );
    }
    let total_micros = run_start.elapsed().as_micros();

    if args.stats {
        tree.statistics();
    }

    let total_ops = args.batch_size * args.num_batches;
    print_throughput(total_ops, total_micros, generating_micros, args.num_batches);

    let mut report = new_report(args);
    #[allow(clippy::cast_precision_loss)]
    report.push("pipeline", total_micros as f64 / 1e6, None);
    Ok(report)
}

fn run_lazy(args: &Args) -> Result<RunReport> {
    let workers = args.threads.max(1);
    let engine = LazyEngine::new(args.size, workers);
    let mut reference = FenwickTree::new(args.size);
    let mut generator = Generator::new(args.size, args.query_permille, args.seed);
    let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

    let mut sequential_secs = 0_f64;
    let mut engine_secs = 0_f64;
    for batch in 0..args.num_batches {
        generator.fill(&mut ops, args.batch_size);

        let start = Instant::now();
        let expected = reference.run_batch(&ops);
        sequential_secs += start.elapsed().as_secs_f64();

        let start = Instant::now();
        let actual = engine.run_batch(&ops);
        engine_secs += start.elapsed().as_secs_f64();

        ensure!(
            actual == expected,
            "validation mismatch at batch {batch}: engine {actual} != sequential {expected}"
        );
    }

    println!("Performance:");
    println!("Total operations: {}", args.batch_size * args.num_batches);
    println!("Seq time: {sequential_secs} seconds");
    println!("Lazy time: {engine_secs} seconds");
    println!("Speedup: {}x", sequential_secs / engine_secs);
    println!();

    let mut report = new_report(args);
    report.push("sequential", sequential_secs, None);
    report.push("engine", engine_secs, Some(sequential_secs / engine_secs));
    Ok(report)
}

fn run_scheduler<Q: TaskQueue<Task> + 'static>(args: &Args, label: &str) -> Result<RunReport> {
    let workers = args.threads.saturating_sub(1).max(1);
    let mut scheduler: Scheduler<Q> = Scheduler::new(args.size, workers, args.batch_size);
    let mut reference = FenwickTree::new(args.size);
    let mut generator = Generator::new(args.size, args.query_permille, args.seed);
    let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

    let mut sequential_secs = 0_f64;
    let mut engine_secs = 0_f64;
    for batch in 0..args.num_batches {
        generator.fill(&mut ops, args.batch_size);

        let start = Instant::now();
        let expected = reference.run_batch(&ops);
        sequential_secs += start.elapsed().as_secs_f64();

        scheduler.init();
        let start = Instant::now();
        for (slot, op) in ops.iter().enumerate() {
            match op.kind {
                OpKind::Add => scheduler.submit_update(op.index, op.value),
                OpKind::Query => scheduler.submit_query(op.index, slot),
            }
        }
        scheduler
            .sync()
            .with_context(|| format!("draining batch {batch}"))?;
        engine_secs += start.elapsed().as_secs_f64();

        let actual = scheduler.validate_sum();
        ensure!(
            actual == expected,
            "validation mismatch at batch {batch}: engine {actual} != sequential {expected}"
        );
    }
    scheduler.shutdown();

    println!("Performance:");
    println!("Worker threads: {workers}");
    println!("Seq time: {sequential_secs} seconds");
    println!("{label} time: {engine_secs} seconds");
    println!("Speedup: {}x", sequential_secs / engine_secs);
    println!();

    let mut report = new_report(args);
    report.push("sequential", sequential_secs, None);
    report.push("engine", engine_secs, Some(sequential_secs / engine_secs));
    Ok(report)
}

fn run_pure(args: &Args) -> Result<RunReport> {
    let workers = args.threads.saturating_sub(1).max(1);
    let mut engine = PureParallel::new(args.size, workers, args.batch_size);
    let mut reference = FenwickTree::new(args.size);
    let mut generator = Generator::new(args.size, args.query_permille, args.seed);
    let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

    let mut sequential_secs = 0_f64;
    let mut engine_secs = 0_f64;
    for batch in 0..args.num_batches {
        generator.fill(&mut ops, args.batch_size);

        let start = Instant::now();
        let expected = reference.run_batch(&ops);
        sequential_secs += start.elapsed().as_secs_f64();

        engine.init();
        let start = Instant::now();
        engine.run_batch(&ops);
        engine_secs += start.elapsed().as_secs_f64();

        let actual = engine.validate_sum();
        ensure!(
            actual == expected,
            "validation mismatch at batch {batch}: engine {actual} != sequential {expected}"
        );
    }

    println!("Performance:");
    println!("Num threads: {workers}");
    println!("Seq time: {sequential_secs} seconds");
    println!("Pure Parallel time: {engine_secs} seconds");
    println!("Speedup: {}x", sequential_secs / engine_secs);
    println!();

    let mut report = new_report(args);
    report.push("sequential", sequential_secs, None);
    report.push("engine", engine_secs, Some(sequential_secs / engine_secs));
    Ok(report)
}

fn run_query_sweep_lazy(args: &Args) -> Result<RunReport> {
    let workers = args.threads.max(1);
    let mut report = new_report(args);

    for permille in QUERY_SWEEP {
        let engine = LazyEngine::new(args.size, workers);
        let mut reference = FenwickTree::new(args.size);
        let mut generator = Generator::new(args.size, permille, args.seed);
        let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

        let mut sequential_secs = 0_f64;
        let mut engine_secs = 0_f64;
        for _ in 0..args.num_batches {
            generator.fill(&mut ops, args.batch_size);

            let start = Instant::now();
            let _ = reference.run_batch(&ops);
            sequential_secs += start.elapsed().as_secs_f64();

            let start = Instant::now();
            let _ = engine.run_batch(&ops);
            engine_secs += start.elapsed().as_secs_f64();
        }

        #[allow(clippy::cast_precision_loss)]
        let percent = permille as f64 / 10.0;
        println!("Performance:");
        println!("Query Percentage: {percent}%");
        println!("Seq time: {sequential_secs} seconds");
        println!("Lazy time: {engine_secs} seconds");
        println!("Lazy Speedup: {}x", sequential_secs / engine_secs);
        println!();

        report.push(format!("sequential query_permille={permille}"), sequential_secs, None);
        report.push(
            format!("engine query_permille={permille}"),
            engine_secs,
            Some(sequential_secs / engine_secs),
        );
    }
    Ok(report)
}

fn run_query_sweep_pure(args: &Args) -> Result<RunReport> {
    let workers = args.threads.saturating_sub(1).max(1);
    let mut report = new_report(args);

    for permille in QUERY_SWEEP {
        let mut engine = PureParallel::new(args.size, workers, args.batch_size);
        let mut reference = FenwickTree::new(args.size);
        let mut generator = Generator::new(args.size, permille, args.seed);
        let mut ops: Vec<Operation> = Vec::with_capacity(args.batch_size);

        let mut sequential_secs = 0_f64;
        let mut engine_secs = 0_f64;
        for _ in 0..args.num_batches {
            generator.fill(&mut ops, args.batch_size);

            let start = Instant::now();
            let _ = reference.run_batch(&ops);
            sequential_secs += start.elapsed().as_secs_f64();

            engine.init();
            let start = Instant::now();
            engine.run_batch(&ops);
            engine_secs += start.elapsed().as_secs_f64();
        }

        #[allow(clippy::cast_precision_loss)]
        let percent = permille as f64 / 10.0;
        println!("Performance:");
        println!("Query Percentage: {percent}%");
        println!("Seq time: {sequential_secs} seconds");
        println!("Para time: {engine_secs} seconds");
        println!("Parallel Speedup: {}x", sequential_secs / engine_secs);
        println!();

        report.push(format!("sequential query_permille={permille}"), sequential_secs, None);
        report.push(
            format!("engine query_permille={permille}"),
            engine_secs,
            Some(sequential_secs / engine_secs),
        );
    }
    Ok(report)
}
