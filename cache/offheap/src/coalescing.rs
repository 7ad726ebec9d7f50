//! Coalescing allocator.
//!
//! Free space is tracked in a [`FreeSet`]. `store` takes the largest free
//! range and splits off what it needs, so a single comparison decides
//! whether the request fits. `free` merges the released range with any free
//! neighbor, so freeing every live pointer always leaves one range covering
//! the whole region.
//!
//! The free set and pointer-table slot reuse are guarded by one mutex per
//! region. Reads never take it.

use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::allocator::{Allocator, AllocatorKind, check_request};
use crate::clock;
use crate::error::{AllocError, AllocResult};
use crate::free_set::FreeSet;
use crate::pointer::{Expiry, PayloadTag, Pointer, PointerInfo, PointerTable};
use crate::region::{Region, RegionStats};

/// Largest-fit allocator with neighbor merging.
pub struct CoalescingAllocator {
    region: Region,
    table: PointerTable,
    free: Mutex<FreeSet>,
    stats: RegionStats,
}

impl CoalescingAllocator {
    /// Create an allocator over a fresh region of `size` bytes.
    pub fn new(buffer_id: u32, size: usize) -> AllocResult<Self> {
        let region = Region::new(buffer_id, size)?;

        info!(buffer_id, size, "created coalescing region");

        Ok(Self {
            region,
            table: PointerTable::new(buffer_id),
            free: Mutex::new(FreeSet::spanning(size)),
            stats: RegionStats::default(),
        })
    }

    fn place(
        &self,
        size: usize,
        payload: Option<&[u8]>,
        expiry: Expiry,
        tag: PayloadTag,
    ) -> AllocResult<Pointer> {
        let mut free = self.free.lock();
        let Some((start, end)) = free.take(size) else {
            drop(free);
            if self.stats.record_failure() {
                warn!(
                    buffer_id = self.buffer_id(),
                    "coalescing region entered shortage"
                );
            }
            trace!(buffer_id = self.buffer_id(), size, "no free range");
            return Err(AllocError::OutOfSpace { requested: size });
        };

        let (slot, entry) = self.table.insert(0, start, end);
        if let Some(payload) = payload {
            self.region.write_at(start, payload);
        }
        let generation = entry.issue(size, tag, expiry, clock::now_millis());
        self.stats.add_used(size);
        drop(free);

        trace!(buffer_id = self.buffer_id(), slot, start, size, "placed");

        Ok(Pointer::new(self.buffer_id(), slot, generation))
    }

    /// Free ranges in address order as inclusive `(start, end)` pairs.
    pub fn free_ranges(&self) -> Vec<(u32, u32)> {
        self.free.lock().ranges().collect()
    }

    /// Verify the free index and the byte accounting.
    ///
    /// Fails with `InvariantViolation` if the two free views disagree, if
    /// free ranges overlap or sit unmerged next to each other, or if free and
    /// used bytes do not add up to the region size.
    pub fn check(&self) -> AllocResult<()> {
        let free = self.free.lock();
        free.check()?;
        let total = free.free_bytes() + self.stats.used();
        if total != self.region.size() as u64 {
            return Err(AllocError::InvariantViolation(format!(
                "free {} + used {} != region size {}",
                free.free_bytes(),
                self.stats.used(),
                self.region.size()
            )));
        }
        Ok(())
    }
}

impl Allocator for CoalescingAllocator {
    fn buffer_id(&self) -> u32 {
        self.region.id()
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Coalescing
    }

    fn store(&self, payload: &[u8], expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer> {
        check_request(payload.len(), self.max_request())?;
        self.place(payload.len(), Some(payload), expiry, tag)
    }

    fn allocate(&self, size: usize, expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer> {
        check_request(size, self.max_request())?;
        self.place(size, None, expiry, tag)
    }

    fn retrieve(&self, pointer: &Pointer) -> AllocResult<Vec<u8>> {
        let entry = self.table.checked(pointer)?;
        let bytes = self.region.copy_out(&entry, pointer.generation())?;
        entry.hit(clock::now_millis());
        Ok(bytes)
    }

    fn with_bytes(&self, pointer: &Pointer, f: &mut dyn FnMut(&[u8])) -> AllocResult<()> {
        let entry = self.table.checked(pointer)?;
        self.region.view(&entry, pointer.generation(), |b| f(b))?;
        entry.hit(clock::now_millis());
        Ok(())
    }

    fn with_bytes_mut(
        &self,
        pointer: &Pointer,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> AllocResult<()> {
        let entry = self.table.checked(pointer)?;
        self.region.view_mut(&entry, pointer.generation(), |b| f(b))
    }

    /// Rewrite the payload in place. The pointer stays valid.
    fn update(&self, pointer: &Pointer, payload: &[u8]) -> AllocResult<Pointer> {
        if payload.is_empty() {
            return Err(AllocError::EmptyPayload);
        }
        let entry = self.table.checked(pointer)?;
        let capacity = entry.capacity();
        if payload.len() > capacity {
            return Err(AllocError::CapacityExceeded {
                requested: payload.len(),
                capacity,
            });
        }
        self.region.rewrite(&entry, pointer.generation(), payload)?;
        Ok(*pointer)
    }

    fn free(&self, pointer: &Pointer) -> AllocResult<usize> {
        if pointer.buffer_id() != self.buffer_id() {
            return Err(AllocError::UnknownRegion(pointer.buffer_id()));
        }
        let Some(entry) = self.table.entry(pointer.slot()) else {
            return Ok(0);
        };

        let mut free = self.free.lock();
        let (start, end) = (entry.start(), entry.end());
        if !entry.claim(pointer.generation()) {
            return Ok(0);
        }
        let (merged_start, merged_end) = free.release(start, end)?;
        self.table.retire(pointer.slot());
        let capacity = (end - start) as usize + 1;
        self.stats.sub_used(capacity);
        drop(free);

        trace!(
            buffer_id = self.buffer_id(),
            start,
            end,
            merged_start,
            merged_end,
            "released"
        );

        Ok(capacity)
    }

    fn info(&self, pointer: &Pointer) -> AllocResult<PointerInfo> {
        let entry = self.table.checked(pointer)?;
        Ok(entry.snapshot(self.buffer_id(), pointer.slot()))
    }

    fn live_pointers(&self) -> Vec<PointerInfo> {
        self.table.live()
    }

    fn clear(&self) {
        let mut free = self.free.lock();
        self.table.reset();
        free.reset(self.region.size());
        self.stats.reset();
    }

    fn used(&self) -> u64 {
        self.stats.used()
    }

    fn capacity(&self) -> u64 {
        self.region.size() as u64
    }

    fn max_request(&self) -> usize {
        self.region.size()
    }

    fn stats(&self) -> &RegionStats {
        &self.stats
    }
}
