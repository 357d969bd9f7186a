//! Put/get throughput harness for [`BoundedQueue`].
//!
//! A round spawns `groups` producers, each enqueuing `items_per_worker` tagged
//! payloads with blocking [`BoundedQueue::enqueue`], and `groups` consumers,
//! each taking `items_per_worker` items by polling
//! [`BoundedQueue::try_dequeue`] with a [`thread::yield_now`] between misses.
//! The producer phase is timed as "put" and the consumer phase as "get".
//! A round fails if the queue is not empty once every consumer is done.
//!
//! When the whole round fits in the queue the phases run back to back: fill
//! first, then drain. Otherwise the producers would block forever on a full
//! queue, so consumers start together with the producers and both phases are
//! timed from the common start.
//!
//! A sweep runs one round per group size from `0` to `max_groups` on a fresh
//! queue each time and accumulates the timings.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use core_affinity::CoreId;
use thiserror::Error;

use crate::sync::{BoundedQueue, CapacityError, EnqueueError, TryDequeueError};
use crate::trace::{debug, info, warn};

/// Item type moved through the queue by the harness.
pub type Payload = String;

/// Default queue capacity for a sweep round.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Default number of items each producer enqueues and each consumer takes.
pub const DEFAULT_ITEMS_PER_WORKER: usize = 10_000;

/// Builds the payload for item `seq` of producer `group`.
///
/// `id` comes from a counter shared by all producers of a round, so every
/// payload of the round is distinct.
pub fn payload(group: usize, seq: usize, id: u64) -> Payload {
    format!("Node.{group}.{seq}.{id}")
}

/// Error from a harness run.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// An environment variable did not parse.
    #[error("invalid value {value:?} for {name}")]
    Config { name: &'static str, value: String },

    #[error("cannot create queue: {0}")]
    Capacity(#[from] CapacityError),

    #[error("producer failed: {0}")]
    Enqueue(#[from] EnqueueError<Payload>),

    #[error("consumer failed: {0}")]
    Dequeue(#[from] TryDequeueError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{role} worker panicked")]
    WorkerPanicked { role: &'static str },

    /// Items were left behind after every consumer finished.
    #[error("groups {groups}: queue not empty after drain, {remaining} item(s) left")]
    NotDrained { groups: usize, remaining: usize },

    /// The drained payloads differ from the enqueued ones.
    #[error("consumed payloads differ from produced: {missing} missing, {duplicated} duplicated")]
    Mismatch { missing: usize, duplicated: usize },
}

/// Harness settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Capacity of the queue built for each round.
    pub capacity: usize,
    /// Items per producer and per consumer.
    pub items_per_worker: usize,
    /// Largest group size in a sweep (inclusive).
    pub max_groups: usize,
    /// Pin worker `i` to core `i % cores`.
    pub pin_workers: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            capacity: DEFAULT_CAPACITY,
            items_per_worker: DEFAULT_ITEMS_PER_WORKER,
            max_groups: cpus * 4,
            pin_workers: false,
        }
    }
}

impl HarnessConfig {
    /// Reads `QUEUE_CAPACITY`, `ITEMS_PER_WORKER`, `MAX_GROUPS` and
    /// `PIN_WORKERS` from the environment, falling back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] for a value that does not parse.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] for a value that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HarnessError> {
        let defaults = Self::default();

        Ok(Self {
            capacity: parse_var(&lookup, "QUEUE_CAPACITY")?.unwrap_or(defaults.capacity),
            items_per_worker: parse_var(&lookup, "ITEMS_PER_WORKER")?
                .unwrap_or(defaults.items_per_worker),
            max_groups: parse_var(&lookup, "MAX_GROUPS")?.unwrap_or(defaults.max_groups),
            pin_workers: parse_flag(&lookup, "PIN_WORKERS")?.unwrap_or(defaults.pin_workers),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, HarnessError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| HarnessError::Config { name, value })
        })
        .transpose()
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<bool>, HarnessError> {
    lookup(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(HarnessError::Config { name, value }),
        })
        .transpose()
}

/// Timings of a single round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundReport {
    /// Producers and consumers per side.
    pub groups: usize,
    /// Items enqueued (and dequeued) in the round.
    pub operations: usize,
    /// Whether producers and consumers ran at the same time.
    pub overlapped: bool,
    pub put: Duration,
    pub get: Duration,
}

/// Runs one round on `queue`.
///
/// # Errors
///
/// - [`HarnessError::NotDrained`] if the queue is not empty afterwards.
/// - [`HarnessError::Enqueue`] / [`HarnessError::Dequeue`] if the queue is
///   closed under the workers.
/// - [`HarnessError::WorkerPanicked`] / [`HarnessError::Spawn`] for thread failures.
pub fn run_round(
    queue: &Arc<BoundedQueue<Payload>>,
    groups: usize,
    items_per_worker: usize,
    pin_workers: bool,
) -> Result<RoundReport, HarnessError> {
    drive(queue, groups, items_per_worker, pin_workers, false).map(|(report, _)| report)
}

/// Runs one round and also checks that the drained payloads are exactly the
/// enqueued ones, each seen once.
///
/// # Errors
///
/// Everything [`run_round`] reports, plus [`HarnessError::Mismatch`].
pub fn run_round_verified(
    queue: &Arc<BoundedQueue<Payload>>,
    groups: usize,
    items_per_worker: usize,
) -> Result<RoundReport, HarnessError> {
    let (report, tally) = drive(queue, groups, items_per_worker, false, true)?;
    tally.check()?;
    Ok(report)
}

/// Payloads seen on each side of a verified round.
#[derive(Default)]
struct Tally {
    produced: Vec<Payload>,
    consumed: Vec<Payload>,
}

impl Tally {
    fn check(self) -> Result<(), HarnessError> {
        let mut counts: HashMap<Payload, isize> = HashMap::with_capacity(self.produced.len());
        for item in self.produced {
            *counts.entry(item).or_default() += 1;
        }
        for item in self.consumed {
            *counts.entry(item).or_default() -= 1;
        }

        let missing = counts.values().filter(|&&n| n > 0).count();
        let duplicated = counts.values().filter(|&&n| n < 0).count();

        if missing == 0 && duplicated == 0 {
            Ok(())
        } else {
            Err(HarnessError::Mismatch {
                missing,
                duplicated,
            })
        }
    }
}

fn drive(
    queue: &Arc<BoundedQueue<Payload>>,
    groups: usize,
    items_per_worker: usize,
    pin_workers: bool,
    collect: bool,
) -> Result<(RoundReport, Tally), HarnessError> {
    let operations = groups * items_per_worker;
    let overlapped = operations > queue.capacity();
    let cores: Arc<[CoreId]> = if pin_workers {
        core_affinity::get_core_ids().unwrap_or_default().into()
    } else {
        Arc::from([])
    };
    let ids = Arc::new(AtomicU64::new(0));

    debug!(groups, items_per_worker, overlapped, "round starting");

    let mut tally = Tally::default();
    let start = Instant::now();
    // Closing releases any producer already spawned and blocked on a full queue.
    let producers = spawn_producers(queue, groups, items_per_worker, &cores, &ids, collect)
        .inspect_err(|_| {
            queue.close();
        })?;

    let (put, get) = if overlapped {
        let consumers = match spawn_consumers(queue, groups, items_per_worker, &cores, collect) {
            Ok(consumers) => consumers,
            Err(err) => {
                queue.close();
                let _ = join_all(producers, "producer");
                return Err(err);
            }
        };
        let (produced, put, consumed, get) = join_overlapped(queue, producers, consumers, start);
        tally.produced = produced?;
        tally.consumed = consumed?;
        (put, get)
    } else {
        tally.produced = join_all(producers, "producer")?;
        let put = start.elapsed();
        let drain_start = Instant::now();
        let consumers = spawn_consumers(queue, groups, items_per_worker, &cores, collect)?;
        tally.consumed = join_all(consumers, "consumer")?;
        (put, drain_start.elapsed())
    };

    let remaining = queue.len();
    if remaining != 0 {
        warn!(groups, remaining, "queue not empty after drain");
        return Err(HarnessError::NotDrained { groups, remaining });
    }

    let report = RoundReport {
        groups,
        operations,
        overlapped,
        put,
        get,
    };
    debug!(groups, put = ?report.put, get = ?report.get, "round complete");
    Ok((report, tally))
}

fn pin_worker(cores: &[CoreId], index: usize) {
    if !cores.is_empty() {
        core_affinity::set_for_current(cores[index % cores.len()]);
    }
}

type Worker = JoinHandle<Result<Vec<Payload>, HarnessError>>;

fn spawn_producers(
    queue: &Arc<BoundedQueue<Payload>>,
    groups: usize,
    items_per_worker: usize,
    cores: &Arc<[CoreId]>,
    ids: &Arc<AtomicU64>,
    collect: bool,
) -> Result<Vec<Worker>, HarnessError> {
    (0..groups)
        .map(|group| {
            let queue = Arc::clone(queue);
            let cores = Arc::clone(cores);
            let ids = Arc::clone(ids);
            thread::Builder::new()
                .name(format!("producer-{group}"))
                .spawn(move || {
                    pin_worker(&cores, group);
                    let mut produced = Vec::with_capacity(if collect { items_per_worker } else { 0 });
                    for seq in 0..items_per_worker {
                        let item = payload(group, seq, ids.fetch_add(1, Ordering::Relaxed) + 1);
                        if collect {
                            produced.push(item.clone());
                        }
                        queue.enqueue(item)?;
                    }
                    Ok(produced)
                })
                .map_err(HarnessError::from)
        })
        .collect()
}

fn spawn_consumers(
    queue: &Arc<BoundedQueue<Payload>>,
    groups: usize,
    items_per_worker: usize,
    cores: &Arc<[CoreId]>,
    collect: bool,
) -> Result<Vec<Worker>, HarnessError> {
    (0..groups)
        .map(|group| {
            let queue = Arc::clone(queue);
            let cores = Arc::clone(cores);
            thread::Builder::new()
                .name(format!("consumer-{group}"))
                .spawn(move || {
                    pin_worker(&cores, groups + group);
                    let mut consumed = Vec::with_capacity(if collect { items_per_worker } else { 0 });
                    let mut taken = 0;
                    while taken < items_per_worker {
                        match queue.try_dequeue() {
                            Ok(item) => {
                                taken += 1;
                                if collect {
                                    consumed.push(item);
                                }
                            }
                            Err(TryDequeueError::Empty) => thread::yield_now(),
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Ok(consumed)
                })
                .map_err(HarnessError::from)
        })
        .collect()
}

/// Joins both sides of an overlapped round, timing each from `start`.
///
/// A failed producer never delivers its share, so the queue is closed before
/// the consumers are joined. They drain what is left and stop on `Closed`.
fn join_overlapped(
    queue: &BoundedQueue<Payload>,
    producers: Vec<Worker>,
    consumers: Vec<Worker>,
    start: Instant,
) -> (
    Result<Vec<Payload>, HarnessError>,
    Duration,
    Result<Vec<Payload>, HarnessError>,
    Duration,
) {
    let produced = join_all(producers, "producer");
    let put = start.elapsed();
    if produced.is_err() && queue.close() {
        warn!("producer failed, queue closed to release consumers");
    }
    let consumed = join_all(consumers, "consumer");
    (produced, put, consumed, start.elapsed())
}

/// Joins every worker, then reports the first failure.
fn join_all(workers: Vec<Worker>, role: &'static str) -> Result<Vec<Payload>, HarnessError> {
    let mut items = Vec::new();
    let mut first_err = None;

    for worker in workers {
        let outcome = worker
            .join()
            .unwrap_or(Err(HarnessError::WorkerPanicked { role }));
        match outcome {
            Ok(mut part) => items.append(&mut part),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }

    first_err.map_or(Ok(items), Err)
}

/// Accumulated timings of a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub max_groups: usize,
    /// Total items moved across all rounds.
    pub operations: usize,
    /// Wall time of the whole sweep, including thread start-up.
    pub wall: Duration,
    pub put: Duration,
    pub get: Duration,
    pub rounds: Vec<RoundReport>,
}

impl SweepReport {
    pub fn wall_per_op(&self) -> Duration {
        per_op(self.wall, self.operations)
    }

    pub fn put_per_op(&self) -> Duration {
        per_op(self.put, self.operations)
    }

    pub fn get_per_op(&self) -> Duration {
        per_op(self.get, self.operations)
    }
}

/// `total / operations`, or zero when nothing ran.
pub fn per_op(total: Duration, operations: usize) -> Duration {
    if operations == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / operations as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Grp: {}, Times: {}, use: {:?}, {:?}/op",
            self.max_groups,
            self.operations,
            self.wall,
            self.wall_per_op()
        )?;
        writeln!(
            f,
            "Put: {}, use: {:?}, {:?}/op",
            self.operations,
            self.put,
            self.put_per_op()
        )?;
        write!(
            f,
            "Get: {}, use: {:?}, {:?}/op",
            self.operations,
            self.get,
            self.get_per_op()
        )
    }
}

/// Runs a round for every group size in `0..=config.max_groups`.
///
/// # Errors
///
/// Stops at the first failing round and returns its error.
pub fn run_sweep(config: &HarnessConfig) -> Result<SweepReport, HarnessError> {
    info!(?config, "sweep starting");

    let start = Instant::now();
    let mut rounds = Vec::with_capacity(config.max_groups + 1);

    for groups in 0..=config.max_groups {
        let queue = Arc::new(BoundedQueue::new(config.capacity)?);
        rounds.push(run_round(
            &queue,
            groups,
            config.items_per_worker,
            config.pin_workers,
        )?);
    }

    let report = SweepReport {
        max_groups: config.max_groups,
        operations: rounds.iter().map(|r| r.operations).sum(),
        wall: start.elapsed(),
        put: rounds.iter().map(|r| r.put).sum(),
        get: rounds.iter().map(|r| r.get).sum(),
        rounds,
    };
    info!(operations = report.operations, wall = ?report.wall, "sweep complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        }
    }

    #[test]
    fn test_payload_format() {
        assert_eq!(payload(3, 17, 42), "Node.3.17.42");
    }

    #[test]
    fn test_config_defaults_when_unset() {
        let config = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert!(config.max_groups >= 4);
    }

    #[test]
    fn test_config_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("QUEUE_CAPACITY", "64"),
            ("ITEMS_PER_WORKER", " 100 "),
            ("MAX_GROUPS", "3"),
            ("PIN_WORKERS", "true"),
        ]))
        .unwrap();

        assert_eq!(
            config,
            HarnessConfig {
                capacity: 64,
                items_per_worker: 100,
                max_groups: 3,
                pin_workers: true,
            }
        );
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = HarnessConfig::from_lookup(lookup(&[("MAX_GROUPS", "many")])).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Config { name: "MAX_GROUPS", ref value } if value == "many"
        ));

        let err = HarnessConfig::from_lookup(lookup(&[("PIN_WORKERS", "maybe")])).unwrap_err();
        assert!(matches!(err, HarnessError::Config { name: "PIN_WORKERS", .. }));
    }

    #[test]
    fn test_per_op() {
        assert_eq!(per_op(Duration::from_secs(1), 0), Duration::ZERO);
        assert_eq!(per_op(Duration::from_micros(10), 10), Duration::from_micros(1));
    }

    #[test]
    fn test_round_with_zero_groups() {
        let queue = Arc::new(BoundedQueue::new(4).unwrap());
        let report = run_round(&queue, 0, 100, false).unwrap();

        assert_eq!(report.operations, 0);
        assert!(!report.overlapped);
    }

    #[test]
    fn test_sequential_round_fills_then_drains() {
        let queue = Arc::new(BoundedQueue::new(1024).unwrap());
        let report = run_round_verified(&queue, 4, 200).unwrap();

        assert_eq!(report.groups, 4);
        assert_eq!(report.operations, 800);
        assert!(!report.overlapped);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overlapped_round_when_queue_too_small() {
        let queue = Arc::new(BoundedQueue::new(16).unwrap());
        let report = run_round_verified(&queue, 3, 500).unwrap();

        assert!(report.overlapped);
        assert_eq!(report.operations, 1500);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_leftover_items_fail_the_round() {
        let queue = Arc::new(BoundedQueue::new(8).unwrap());
        queue.enqueue(String::from("stray")).unwrap();

        let err = run_round(&queue, 1, 4, false).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::NotDrained {
                groups: 1,
                remaining: 1
            }
        ));
    }

    #[test]
    fn test_closed_queue_fails_producers() {
        let queue = Arc::new(BoundedQueue::new(8).unwrap());
        queue.close();

        let err = run_round(&queue, 2, 4, false).unwrap_err();
        assert!(matches!(err, HarnessError::Enqueue(EnqueueError::Closed(_))));
    }

    #[test]
    fn test_failed_producer_releases_overlapped_consumers() {
        let queue = Arc::new(BoundedQueue::new(4).unwrap());
        let producers: Vec<Worker> = vec![
            thread::spawn(|| Err(HarnessError::WorkerPanicked { role: "producer" })),
            thread::spawn(|| panic!("producer died")),
        ];
        // Each consumer expects far more items than will ever arrive.
        let consumers = spawn_consumers(&queue, 2, 1_000, &Arc::from([]), false).unwrap();

        let (produced, _, consumed, _) =
            join_overlapped(&queue, producers, consumers, Instant::now());

        assert!(matches!(
            produced,
            Err(HarnessError::WorkerPanicked { role: "producer" })
        ));
        assert!(matches!(
            consumed,
            Err(HarnessError::Dequeue(TryDequeueError::Closed))
        ));
        assert!(queue.is_closed());
    }

    #[test]
    fn test_tally_detects_duplicates_and_losses() {
        let tally = Tally {
            produced: vec!["a".into(), "b".into(), "c".into()],
            consumed: vec!["a".into(), "a".into(), "b".into()],
        };
        assert!(matches!(
            tally.check(),
            Err(HarnessError::Mismatch {
                missing: 1,
                duplicated: 1
            })
        ));
    }

    #[test]
    fn test_small_sweep() {
        let config = HarnessConfig {
            capacity: 256,
            items_per_worker: 50,
            max_groups: 3,
            pin_workers: false,
        };
        let report = run_sweep(&config).unwrap();

        assert_eq!(report.rounds.len(), 4);
        assert_eq!(report.operations, (1 + 2 + 3) * 50);
        assert!(report.wall >= report.put);

        let text = report.to_string();
        assert!(text.starts_with("Grp: 3, Times: 300, use: "));
        assert!(text.contains("\nPut: 300, use: "));
        assert!(text.contains("\nGet: 300, use: "));
    }
}
