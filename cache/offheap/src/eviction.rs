//! Expiration and least-frequently-used sweeps.
//!
//! Both sweeps snapshot a region's live pointers, pick a bounded batch, and
//! free the batch through the allocator's normal `free` path. A pointer freed
//! by someone else between the snapshot and the free simply releases zero
//! bytes.
//!
//! Shortage state machine, per region:
//!
//! ```text
//!   Normal --(allocation errors > threshold)--> Shortage
//!   Shortage --(LFU sweep frees > 0 bytes)--> Normal
//! ```
//!
//! Expiration sweeps never change the shortage state.

use std::cmp::Ordering;

use tracing::debug;

use crate::allocator::Allocator;
use crate::error::AllocResult;
use crate::pointer::PointerInfo;

/// Pointers freed per region and per expiration kind unless configured.
pub const DEFAULT_EXPIRE_BATCH: usize = 50;

/// Free up to `batch` relative-expired and up to `batch` absolute-expired
/// pointers. Returns the bytes reclaimed.
pub fn collect_expired<A: Allocator + ?Sized>(
    allocator: &A,
    batch: usize,
    now: i64,
) -> AllocResult<u64> {
    let live = allocator.live_pointers();

    let relative = live
        .iter()
        .filter(|p| p.is_expired_relative(now))
        .take(batch);
    let absolute = live
        .iter()
        .filter(|p| !p.is_expired_relative(now) && p.is_expired_absolute(now))
        .take(batch);

    let mut freed = 0u64;
    let mut count = 0usize;
    for info in relative.chain(absolute) {
        let bytes = allocator.free(&info.pointer)?;
        if bytes > 0 {
            freed += bytes as u64;
            count += 1;
        }
    }

    if count > 0 {
        debug!(
            buffer_id = allocator.buffer_id(),
            count, freed, "collected expired pointers"
        );
    }

    Ok(freed)
}

/// Order by ascending frequency, then older first, then lower offset.
fn by_frequency(now: i64) -> impl Fn(&PointerInfo, &PointerInfo) -> Ordering {
    move |a, b| {
        a.frequency(now)
            .total_cmp(&b.frequency(now))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.start.cmp(&b.start))
    }
}

/// The `limit` least frequently used pointers of `live`.
pub fn lfu_candidates(live: &[PointerInfo], now: i64, limit: usize) -> Vec<PointerInfo> {
    let mut ranked = live.to_vec();
    ranked.sort_by(by_frequency(now));
    ranked.truncate(limit);
    ranked
}

/// Evict the least frequently used pointers if the region is in shortage.
///
/// Frees `batch` pointers, or a tenth of the live pointers (at least one)
/// when `batch` is 0. Reclaiming any bytes ends the shortage.
pub fn collect_lfu<A: Allocator + ?Sized>(
    allocator: &A,
    batch: usize,
    now: i64,
) -> AllocResult<u64> {
    if !allocator.stats().in_shortage() {
        return Ok(0);
    }

    let live = allocator.live_pointers();
    if live.is_empty() {
        return Ok(0);
    }

    let limit = if batch > 0 {
        batch
    } else {
        (live.len() / 10).max(1)
    };

    let mut freed = 0u64;
    let mut count = 0usize;
    for info in lfu_candidates(&live, now, limit) {
        let bytes = allocator.free(&info.pointer)?;
        if bytes > 0 {
            freed += bytes as u64;
            count += 1;
        }
    }

    if freed > 0 {
        allocator.stats().reset_errors();
        debug!(
            buffer_id = allocator.buffer_id(),
            count, freed, "collected least frequently used pointers"
        );
    }

    Ok(freed)
}
