//! Core MPMC (Multi-Producer Multi-Consumer) queue primitives.
//!
//! This module contains a bounded lock-free MPMC ring buffer algorithm.
//! It only offers non-blocking push/pop; waiting, close and timeouts are
//! layered on top by [`crate::sync::bounded`].

pub(crate) mod ring;
