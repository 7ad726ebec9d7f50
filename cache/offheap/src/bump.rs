//! Bump-slice allocator.
//!
//! Keeps every range of the region, live or free, in creation order and
//! places a request in the first free range large enough for it, slicing
//! off the front. Freed ranges are never merged with their neighbors, so a
//! freed range is only reusable by a request of equal or smaller size.
//!
//! ```text
//!   [ A live | B free (20) | C live | residual free ]
//!   store(10) -> [ A | B' live (10) | B'' free (10) | C | residual ]
//! ```

use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::allocator::{Allocator, AllocatorKind, check_request};
use crate::clock;
use crate::error::{AllocError, AllocResult};
use crate::pointer::{Expiry, PayloadTag, Pointer, PointerInfo, PointerTable};
use crate::region::{Region, RegionStats};

/// First-fit allocator over a single region.
pub struct BumpAllocator {
    region: Region,
    table: PointerTable,
    /// Table slots in address order.
    order: Mutex<Vec<u32>>,
    stats: RegionStats,
}

impl BumpAllocator {
    /// Create an allocator over a fresh region of `size` bytes.
    pub fn new(buffer_id: u32, size: usize) -> AllocResult<Self> {
        let region = Region::new(buffer_id, size)?;
        let table = PointerTable::new(buffer_id);
        let (slot, _) = table.insert(0, 0, (size - 1) as u32);

        info!(buffer_id, size, "created bump region");

        Ok(Self {
            region,
            table,
            order: Mutex::new(vec![slot]),
            stats: RegionStats::default(),
        })
    }

    fn place(
        &self,
        order: &mut Vec<u32>,
        size: usize,
        payload: Option<&[u8]>,
        expiry: Expiry,
        tag: PayloadTag,
    ) -> AllocResult<Pointer> {
        let found = order.iter().position(|&slot| {
            self.table
                .entry(slot)
                .is_some_and(|e| e.is_free() && e.capacity() >= size)
        });

        let Some(idx) = found else {
            if self.stats.record_failure() {
                warn!(buffer_id = self.buffer_id(), "bump region entered shortage");
            }
            trace!(buffer_id = self.buffer_id(), size, "no free range");
            return Err(AllocError::OutOfSpace { requested: size });
        };

        let slot = order[idx];
        let entry = self.table.entry(slot).ok_or_else(|| {
            AllocError::InvariantViolation(format!("bump list references missing slot {slot}"))
        })?;

        let (slot, entry) = if entry.capacity() == size {
            (slot, entry)
        } else {
            let start = entry.start();
            let split = start + size as u32;
            let (fresh_slot, fresh) = self.table.insert(0, start, split - 1);
            entry.set_range(0, split, entry.end());
            order.insert(idx, fresh_slot);
            (fresh_slot, fresh)
        };

        if let Some(payload) = payload {
            self.region.write_at(entry.start(), payload);
        }
        let generation = entry.issue(size, tag, expiry, clock::now_millis());
        self.stats.add_used(size);

        trace!(
            buffer_id = self.buffer_id(),
            slot,
            start = entry.start(),
            size,
            "placed"
        );

        Ok(Pointer::new(self.buffer_id(), slot, generation))
    }

    /// Number of ranges, live or free, in the list.
    pub fn range_count(&self) -> usize {
        self.order.lock().len()
    }
}

impl Allocator for BumpAllocator {
    fn buffer_id(&self) -> u32 {
        self.region.id()
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Bump
    }

    fn stats(&self) -> &RegionStats {
        &self.stats
    }

    fn max_request(&self) -> usize {
        self.region.size()
    }

    fn store(&self, payload: &[u8], expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer> {
        check_request(payload.len(), self.max_request())?;
        let mut order = self.order.lock();
        self.place(&mut order, payload.len(), Some(payload), expiry, tag)
    }

    fn allocate(&self, size: usize, expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer> {
        check_request(size, self.max_request())?;
        let mut order = self.order.lock();
        self.place(&mut order, size, None, expiry, tag)
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

    /// Replace the payload by freeing the range and storing again.
    ///
    /// Fails with `CapacityExceeded` if `payload` is larger than the range,
    /// leaving the pointer untouched. Otherwise it cannot run out of space,
    /// since the freed range itself fits. Expiry and tag carry over; the
    /// returned pointer replaces `pointer`.
    fn update(&self, pointer: &Pointer, payload: &[u8]) -> AllocResult<Pointer> {
        if payload.is_empty() {
            return Err(AllocError::EmptyPayload);
        }
        let mut order = self.order.lock();
        let entry = self.table.checked(pointer)?;
        let capacity = entry.capacity();
        if payload.len() > capacity {
            return Err(AllocError::CapacityExceeded {
                requested: payload.len(),
                capacity,
            });
        }

        let expiry = entry.expiry();
        let tag = entry.tag();
        if !entry.claim(pointer.generation()) {
            return Err(AllocError::StalePointer);
        }
        self.stats.sub_used(capacity);
        self.place(&mut order, payload.len(), Some(payload), expiry, tag)
    }

    fn free(&self, pointer: &Pointer) -> AllocResult<usize> {
        if pointer.buffer_id() != self.buffer_id() {
            return Err(AllocError::UnknownRegion(pointer.buffer_id()));
        }
        let _order = self.order.lock();
        let Some(entry) = self.table.entry(pointer.slot()) else {
            return Ok(0);
        };
        let capacity = entry.capacity();
        if !entry.claim(pointer.generation()) {
            return Ok(0);
        }
        self.stats.sub_used(capacity);
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
        let mut order = self.order.lock();
        self.table.reset();
        order.clear();
        let (slot, _) = self.table.insert(0, 0, (self.region.size() - 1) as u32);
        order.push(slot);
        self.stats.reset();
    }

    fn used(&self) -> u64 {
        self.stats.used()
    }

    fn capacity(&self) -> u64 {
        self.region.size() as u64
    }
}
