//! Fixed-capacity region allocator with expiration and LFU eviction.
//!
//! This crate is the storage tier of a key-value cache. Payloads are copied
//! into large regions allocated once at startup, and callers get back a
//! small [`Pointer`] handle. Space comes back through explicit frees or
//! through periodic expiration and least-frequently-used sweeps.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------+
//! |                 MemoryManager                   |
//! |  AllocationPolicy (sequential | round robin)    |
//! |        |                                        |
//! |        v                                        |
//! |  +-------------------------------------------+  |
//! |  | RegionAllocator 0   (bump | coalescing |  |  |
//! |  |                      slab)                |  |
//! |  |  Region bytes  +  PointerTable            |  |
//! |  |  RegionStats (used, allocation errors)    |  |
//! |  +-------------------------------------------+  |
//! |  | RegionAllocator 1 ...                     |  |
//! |  +-------------------------------------------+  |
//! +-------------------------------------------------+
//!          ^
//!          |  collect_expired / collect_lfu
//!   Sweeper thread
//! ```
//!
//! # Pointer safety
//!
//! A [`Pointer`] is `(buffer_id, slot, generation)`. Freeing bumps the slot's
//! generation, so a handle kept past `free` is rejected with
//! [`AllocError::StalePointer`] rather than reading reused memory, and a
//! second `free` through it releases nothing.
//!
//! # Example
//!
//! ```ignore
//! use offheap_cache::{Expiry, MemoryManager};
//! use std::time::Duration;
//!
//! let manager = MemoryManager::builder()
//!     .regions(4)
//!     .region_size(64 * 1024 * 1024)
//!     .build()?;
//!
//! let ptr = manager
//!     .store(b"value", Expiry::after(Duration::from_secs(60)))?
//!     .expect("room in a fresh manager");
//! assert_eq!(manager.retrieve(&ptr)?, b"value");
//! manager.free(&ptr)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod allocator;
mod bump;
mod clock;
mod coalescing;
mod config;
mod error;
mod eviction;
mod free_set;
mod manager;
mod pointer;
mod policy;
mod region;
mod slab;
mod sweeper;
mod sync;

pub mod logging;
pub mod metrics;

pub use allocator::{Allocator, AllocatorKind, RegionAllocator};
pub use bump::BumpAllocator;
pub use clock::now_millis;
pub use coalescing::CoalescingAllocator;
pub use config::{
    Config, EvictionConfig, LogFormat, LoggingConfig, MemoryConfig, OnExhaustion, PolicyConfig,
    PolicyKind, parse_size,
};
pub use error::{AllocError, AllocResult, ConfigError};
pub use eviction::{DEFAULT_EXPIRE_BATCH, collect_expired, collect_lfu, lfu_candidates};
pub use manager::{MemoryManager, MemoryManagerBuilder};
pub use pointer::{Expiry, PayloadTag, Pointer, PointerInfo};
pub use policy::{AllocationPolicy, DEFAULT_MAX_ALLOCATIONS, RoundRobinPolicy, SequentialPolicy};
pub use region::{Region, RegionStats};
pub use slab::{SlabAllocator, SlabPool};
pub use sweeper::{SweepConfig, Sweeper};
