//! `synchrobench` — the CLI harness (`spec.md` §6.4, §8 S3/S4).
//!
//! Preloads an engine with `initial_size` random keys, runs `threads`
//! worker threads for `duration_ms` against a `key_range`-wide key
//! domain at `update_percent` update rate, then prints a final report.
//! One binary, one `--engine` switch, rather than the original
//! benchmark's one-binary-per-engine layout — the natural port once
//! engine selection is a runtime value instead of a compile-time unit.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};

use synchrobench::error::{BenchError, Result};
use synchrobench::set::list::{CouplingList, LazyList, LockFreeList, VersionedList};
use synchrobench::set::skiplist::{FraserSkipList, LockBasedSkipList, NoHotSpotSkipList, RotatingSkipList};
use synchrobench::set::tree::{HankeTree, KungLehmanTree, ManberLadnerTree, SpeculativeAvlTree};
use synchrobench::{rng, OrderedSet, SetParams};

/// A corpus of concurrent ordered-set engines, benchmarked head to
/// head behind one harness.
#[derive(Parser, Debug)]
#[command(name = "synchrobench", version, about)]
struct Cli {
    /// Which engine to run.
    #[arg(long, value_name = "NAME")]
    engine: String,

    /// Benchmark duration in milliseconds.
    #[arg(short = 'd', long = "duration-ms", default_value_t = 1000)]
    duration_ms: u64,

    /// Number of distinct keys to preload before the timed window.
    #[arg(short = 'i', long = "initial-size", default_value_t = 1000)]
    initial_size: usize,

    /// Number of concurrent worker threads.
    #[arg(short = 't', long = "threads", default_value_t = 4)]
    threads: usize,

    /// Keys are drawn uniformly from `[0, key_range)`.
    #[arg(short = 'r', long = "key-range", default_value_t = 2000)]
    key_range: i32,

    /// Percentage of operations that are inserts or removes (vs.
    /// `contains`), `0..=100`.
    #[arg(short = 'u', long = "update-percent", default_value_t = 20)]
    update_percent: u32,

    /// PRNG seed; each thread's generator is derived from this plus
    /// its own index, so the same seed reproduces the same per-thread
    /// sequences but not identical ones across threads.
    #[arg(short = 'S', long = "seed", default_value_t = 42)]
    seed: u64,

    /// Retained for CLI-surface parity with `spec.md` §6.4; this port
    /// does not implement alternate workload phases.
    #[arg(short = 'A', long = "alternate-mode")]
    alternate_mode: bool,

    /// Retained for CLI-surface parity; effective-mode accounting
    /// (counting only successful updates toward the update ratio) is
    /// not distinguished from the plain mode in this port.
    #[arg(short = 'f', long = "effective-mode")]
    effective_mode: bool,

    /// Retained for CLI-surface parity; elasticity classing of keys is
    /// not implemented.
    #[arg(short = 'x', long = "elasticity-class", default_value_t = 0)]
    elasticity_class: u32,

    /// Speculation-friendly AVL only: biases the worker/maintainer mix
    /// (see [`SetParams::bias_range`]).
    #[arg(short = 'b', long = "bias-range", default_value_t = 10)]
    bias_range: u32,

    #[arg(short = 'B', long = "bias-offset", default_value_t = 1)]
    bias_offset: u32,

    /// Sleep interval between background maintenance passes, in
    /// milliseconds.
    #[arg(long = "bg-sleep-ms", default_value_t = 1)]
    bg_sleep_ms: u64,
}

struct ThreadStats {
    inserts: u64,
    removes: u64,
    reads: u64,
}

struct Report {
    engine: String,
    threads: usize,
    duration: Duration,
    inserts: u64,
    removes: u64,
    reads: u64,
    final_size: usize,
}

impl Report {
    fn print(&self) {
        let total = self.inserts + self.removes + self.reads;
        let ops_per_sec = total as f64 / self.duration.as_secs_f64();
        println!("engine:        {}", self.engine);
        println!("threads:       {}", self.threads);
        println!("duration_ms:   {}", self.duration.as_millis());
        println!("inserts:       {}", self.inserts);
        println!("removes:       {}", self.removes);
        println!("reads:         {}", self.reads);
        println!("total_ops:     {}", total);
        println!("ops_per_sec:   {:.0}", ops_per_sec);
        println!("final_size:    {}", self.final_size);
    }
}

fn run_benchmark<S: OrderedSet + 'static>(cli: &Cli) -> Result<Report> {
    let params = SetParams {
        start_bg: true,
        bg_sleep: Duration::from_millis(cli.bg_sleep_ms),
        bias_range: cli.bias_range,
        bias_offset: cli.bias_offset,
        ..SetParams::default()
    };
    let set = Arc::new(S::new(params));

    rng::seed_thread(cli.seed, 0);
    let mut preloaded = 0;
    let mut attempts = 0u64;
    while preloaded < cli.initial_size && attempts < cli.initial_size as u64 * 20 {
        let key = rng::next_key(0, cli.key_range);
        if set.insert(key) {
            preloaded += 1;
        }
        attempts += 1;
    }
    if preloaded < cli.initial_size {
        warn!(
            "only preloaded {preloaded}/{requested} distinct keys out of {range} possible",
            requested = cli.initial_size,
            range = cli.key_range
        );
    }

    let finished = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(cli.threads + 1));
    let update_percent = cli.update_percent.min(100);
    let key_range = cli.key_range;

    let mut handles = Vec::with_capacity(cli.threads);
    for t in 0..cli.threads {
        let set = set.clone();
        let finished = finished.clone();
        let barrier = barrier.clone();
        let seed = cli.seed;
        let handle = std::thread::Builder::new()
            .name(format!("synchrobench-worker-{t}"))
            .spawn(move || {
                rng::seed_thread(seed, t as u64 + 1);
                let mut stats = ThreadStats { inserts: 0, removes: 0, reads: 0 };
                barrier.wait();
                while !finished.load(Relaxed) {
                    let key = rng::next_key(0, key_range);
                    if rng::next_percent() < update_percent {
                        if rng::next_percent() < 50 {
                            set.insert(key);
                            stats.inserts += 1;
                        } else {
                            set.remove(key);
                            stats.removes += 1;
                        }
                    } else {
                        set.contains(key);
                        stats.reads += 1;
                    }
                }
                stats
            })
            .map_err(|source| BenchError::ThreadSpawnFailed { kind: "worker", source })?;
        handles.push(handle);
    }

    barrier.wait();
    let start = Instant::now();
    std::thread::sleep(Duration::from_millis(cli.duration_ms));
    finished.store(true, Relaxed);
    let elapsed = start.elapsed();

    let mut totals = ThreadStats { inserts: 0, removes: 0, reads: 0 };
    for h in handles {
        let stats = h.join().expect("worker thread panicked");
        totals.inserts += stats.inserts;
        totals.removes += stats.removes;
        totals.reads += stats.reads;
    }

    Ok(Report {
        engine: cli.engine.clone(),
        threads: cli.threads,
        duration: elapsed,
        inserts: totals.inserts,
        removes: totals.removes,
        reads: totals.reads,
        final_size: set.size(),
    })
}

fn validate(cli: &Cli) -> Result<()> {
    if cli.threads == 0 {
        return Err(BenchError::InvalidArgument {
            flag: "--threads",
            reason: "must be at least 1".into(),
        });
    }
    if cli.key_range <= 0 {
        return Err(BenchError::InvalidArgument {
            flag: "--key-range",
            reason: "must be positive".into(),
        });
    }
    if cli.update_percent > 100 {
        return Err(BenchError::InvalidArgument {
            flag: "--update-percent",
            reason: "must be in 0..=100".into(),
        });
    }
    if cli.initial_size as i64 > cli.key_range as i64 {
        return Err(BenchError::InvalidArgument {
            flag: "--initial-size",
            reason: "cannot exceed --key-range, or preload can never converge".into(),
        });
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<Report> {
    validate(cli)?;
    // Alternate-mode, effective-mode and elasticity-class are accepted
    // for CLI-surface parity but don't change behavior in this port;
    // log them so a user relying on them notices.
    if cli.alternate_mode || cli.effective_mode || cli.elasticity_class != 0 {
        warn!("--alternate-mode/--effective-mode/--elasticity-class are accepted but have no effect");
    }
    let report = match cli.engine.as_str() {
        "coupling-list" => run_benchmark::<CouplingList>(cli),
        "lazy-list" => run_benchmark::<LazyList>(cli),
        "lockfree-list" => run_benchmark::<LockFreeList>(cli),
        "versioned-list" => run_benchmark::<VersionedList>(cli),
        "lockbased-skiplist" => run_benchmark::<LockBasedSkipList>(cli),
        "fraser-skiplist" => run_benchmark::<FraserSkipList>(cli),
        "nohotspot-skiplist" => run_benchmark::<NoHotSpotSkipList>(cli),
        "rotating-skiplist" => run_benchmark::<RotatingSkipList>(cli),
        "kung-lehman-tree" => run_benchmark::<KungLehmanTree>(cli),
        "manber-ladner-tree" => run_benchmark::<ManberLadnerTree>(cli),
        "hanke-tree" => run_benchmark::<HankeTree>(cli),
        "avl-tree" => run_benchmark::<SpeculativeAvlTree>(cli),
        other => return Err(BenchError::UnknownEngine(other.to_string())),
    };
    report
}

fn main() -> std::process::ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    info!("starting synchrobench: engine={}, threads={}", cli.engine, cli.threads);
    match run(&cli) {
        Ok(report) => {
            report.print();
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("synchrobench: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
