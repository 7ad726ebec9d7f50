//! Synchronization primitives with optional loom support.
//!
//! Pointer metadata and region counters take their atomics from here so the
//! free-claim protocol can be model checked with loom while production builds
//! use std atomics.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

#[cfg(not(feature = "loom"))]
pub use std::sync::Arc;

#[cfg(feature = "loom")]
pub use loom::sync::Arc;
