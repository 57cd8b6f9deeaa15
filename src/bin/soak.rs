//! pulsestore Soak Binary
//!
//! Drives both stores under concurrent load and checks their bounds afterwards.
//! Run with: `cargo run --bin pulsestore-soak -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports throughput
//!
//! # Examples
//!
//! ```bash
//! # Default: 4 producers, 5000 events, capacity 2000
//! cargo run --release --bin pulsestore-soak
//!
//! # Small log budget to exercise trimming
//! cargo run --release --bin pulsestore-soak -- --log-lines 50000 --log-limit-kb 256
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pulsestore::{
    Event, EventType, NoBackgroundTime, StorageConfig, StorageRuntime, SystemClock, Timestamp,
    TransactionId,
};

/// Soak configuration
struct Config {
    /// Events enqueued in total
    num_events: usize,
    /// Producer threads
    producers: usize,
    /// Queue capacity
    capacity: usize,
    /// Log lines written in total
    log_lines: usize,
    /// Log store budget
    log_limit_kb: u64,
    /// Store directory (temp if None)
    dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_events: 5_000,
            producers: 4,
            capacity: 2_000,
            log_lines: 10_000,
            log_limit_kb: 1_024,
            dir: None,
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, name: &str) -> T {
    match args.get(i).and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => {
            eprintln!("Invalid {name} value");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--events" | "-e" => {
                i += 1;
                config.num_events = parse_value(&args, i, "--events");
            }
            "--producers" | "-p" => {
                i += 1;
                config.producers = parse_value::<usize>(&args, i, "--producers").max(1);
            }
            "--capacity" | "-c" => {
                i += 1;
                config.capacity = parse_value(&args, i, "--capacity");
            }
            "--log-lines" | "-l" => {
                i += 1;
                config.log_lines = parse_value(&args, i, "--log-lines");
            }
            "--log-limit-kb" => {
                i += 1;
                config.log_limit_kb = parse_value(&args, i, "--log-limit-kb");
            }
            "--dir" | "-d" => {
                i += 1;
                config.dir = Some(parse_value(&args, i, "--dir"));
            }
            "--help" | "-h" => {
                println!(
                    r#"pulsestore Soak

Usage: pulsestore-soak [OPTIONS]

Options:
  -e, --events <N>       Events enqueued in total (default: 5000)
  -p, --producers <N>    Producer threads (default: 4)
  -c, --capacity <N>     Queue capacity (default: 2000)
  -l, --log-lines <N>    Log lines written (default: 10000)
  --log-limit-kb <N>     Log store budget in KB (default: 1024)
  -d, --dir <PATH>       Store directory (default: temp dir)
  -h, --help             Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn main() -> pulsestore::Result<()> {
    let config = parse_args();

    println!("pulsestore Soak");
    println!("===============");
    println!("Events:      {}", config.num_events);
    println!("Producers:   {}", config.producers);
    println!("Capacity:    {}", config.capacity);
    println!("Log lines:   {}", config.log_lines);
    println!("Log budget:  {} KB", config.log_limit_kb);
    println!();

    let dir = config.dir.clone().map(std::path::PathBuf::from).unwrap_or_else(|| {
        std::env::temp_dir().join(format!("pulsestore-soak-{}", std::process::id()))
    });
    println!("Directory:   {}", dir.display());
    println!();

    let mut storage = StorageConfig::in_dir(&dir);
    storage.queue.capacity = config.capacity;
    storage.log_store.trim.limit_kb = config.log_limit_kb;
    storage.log_store.trim.cooldown = Duration::ZERO;

    let runtime = StorageRuntime::start(storage, Arc::new(SystemClock), Arc::new(NoBackgroundTime))?;
    println!(
        "Stores:      events {} / logs {}",
        if runtime.events().is_in_memory() { "in memory" } else { "on disk" },
        if runtime.logs().is_in_memory() { "in memory" } else { "on disk" },
    );
    println!();

    let enqueued = AtomicU64::new(0);
    let errors = AtomicU64::new(0);
    let per_producer = config.num_events / config.producers;

    println!("Starting soak...");
    let start = Instant::now();

    std::thread::scope(|scope| {
        for producer in 0..config.producers {
            let runtime = &runtime;
            let enqueued = &enqueued;
            let errors = &errors;
            scope.spawn(move || {
                for i in 0..per_producer {
                    let event = Event::new(
                        TransactionId::new(format!("soak-{producer}-{i}")),
                        EventType::CustomEvent,
                        format!("{{\"producer\":{producer},\"seq\":{i}}}").into_bytes(),
                        Timestamp::now(),
                    );
                    match runtime.events().create(event) {
                        Ok(()) => {
                            enqueued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if i % 100 == 0 {
                        let _ = runtime.events().count_events();
                    }
                }
            });
        }

        let runtime = &runtime;
        scope.spawn(move || {
            for i in 0..config.log_lines {
                let _ = runtime.logs().create(
                    format!("soak line {i}: {}", "x".repeat(200)),
                    Timestamp::now(),
                );
            }
        });
    });

    // Simulated delivery: attempt then acknowledge one page.
    let page = runtime.events().query(100, Duration::from_secs(60))?;
    for event in &page {
        runtime.events().update(event)?;
    }
    for event in &page {
        runtime.events().delete(event)?;
    }

    let elapsed = start.elapsed();

    // Reported count may still include the surplus; the second one does not.
    runtime.events().count_events()?;
    let live = runtime.events().count_events()?;
    let trim = runtime.logs().maybe_trim(None)?;
    let log_lines = runtime.logs().count()?;
    let log_kb = runtime.logs().size_kb()?;

    let written = enqueued.load(Ordering::Relaxed);
    println!();
    println!("Results");
    println!("-------");
    println!("Events enqueued: {}", written);
    println!("Errors:          {}", errors.load(Ordering::Relaxed));
    println!("Delivered:       {}", page.len());
    println!("Live events:     {}", live);
    println!("Log lines:       {}", log_lines);
    println!("Log size:        {} KB", log_kb);
    println!("Last trim:       {:?}", trim);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} events/sec",
        written as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying bounds...");
    if live > config.capacity {
        eprintln!("  Queue over capacity: {} > {}", live, config.capacity);
        std::process::exit(1);
    }
    println!("  Queue within capacity ✓");

    runtime.shutdown();
    if config.dir.is_none() {
        let _ = std::fs::remove_dir_all(&dir);
    }

    println!();
    println!("Soak PASSED ✓");
    Ok(())
}
