//! Bounded multi-producer/multi-consumer FIFO queue.
//!
//! - [`sync::BoundedQueue`]: fixed-capacity queue with blocking, non-blocking
//!   and deadline-bounded enqueue/dequeue, plus close-and-drain.
//! - [`harness`]: put/get throughput rounds over the queue.
//!
//! Enable the `tracing` feature for debug output, and call [`init_tracing`]
//! once to install a subscriber.

pub mod harness;
mod mpmc;
pub mod sync;
mod trace;

pub use sync::{BoundedQueue, Timeout};
pub use trace::init_tracing;
