//! Bounded queue put/get throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin queue_bench
//!
//! Environment variables:
//!     QUEUE_CAPACITY=1048576  Capacity of the queue built for each round
//!     ITEMS_PER_WORKER=10000  Items per producer and per consumer
//!     MAX_GROUPS=<4 * cpus>   Rounds run for 0..=MAX_GROUPS workers per side
//!     PIN_WORKERS=0           Pin worker threads to cores
//!     RUST_LOG=conveyor=debug With `--features tracing`, per-round output

use conveyor::harness::{HarnessConfig, HarnessError, run_sweep};

fn main() {
    conveyor::init_tracing();

    if let Err(e) = run() {
        eprintln!("queue_bench: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), HarnessError> {
    let config = HarnessConfig::from_env()?;

    println!(
        "conveyor bounded queue (capacity={}, items/worker={}, groups=0..={}):",
        config.capacity, config.items_per_worker, config.max_groups
    );

    let report = run_sweep(&config)?;
    println!("{report}");

    Ok(())
}
