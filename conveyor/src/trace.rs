//! Logging for the queue and the benchmark harness.
//!
//! Events go through `tracing` when the `tracing` feature is on. Otherwise the
//! crate-internal `trace!`/`debug!`/`info!`/`warn!` swallow their arguments.
//!
//! Queue internals log at `trace` (parking) and `debug` (close); the harness
//! logs rounds at `debug` and sweeps at `info`.

/// Filter used when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "conveyor=debug";

/// Installs a global `fmt` subscriber writing to stderr.
///
/// Lines carry the uptime and the worker thread name (`producer-3`,
/// `consumer-0`). Later calls are ignored, so every integration test may call
/// it. A no-op without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .with_timer(fmt::time::uptime());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
