//! Allocator metrics.

use metriken::{Counter, metric};

/// Successful stores and allocations.
#[metric(name = "offheap_stores")]
pub static STORES: Counter = Counter::new();

/// Stores and allocations that found no room in any region.
#[metric(name = "offheap_store_failures")]
pub static STORE_FAILURES: Counter = Counter::new();

/// Pointers freed.
#[metric(name = "offheap_frees")]
pub static FREES: Counter = Counter::new();

/// Bytes reclaimed by expiration sweeps.
#[metric(name = "offheap_expired_bytes")]
pub static EXPIRED_BYTES: Counter = Counter::new();

/// Bytes reclaimed by LFU sweeps.
#[metric(name = "offheap_lfu_bytes")]
pub static LFU_BYTES: Counter = Counter::new();

/// Sweeper iterations.
#[metric(name = "offheap_sweeps")]
pub static SWEEPS: Counter = Counter::new();
