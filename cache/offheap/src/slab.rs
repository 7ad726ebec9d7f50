//! Fixed-slot slab allocator.
//!
//! A region's byte budget is split evenly across a set of pools, one per slot
//! size. Each pool carves its share into one or more segments and slices
//! each segment into equal slots, every one of them pre-registered in the
//! pointer table. Free slots sit in a lock-free queue, so `allocate` and
//! `free` are a single pop or push.
//!
//! ```text
//!   SlabAllocator (buffer 0, 4KB, slot sizes [64, 256, 1024])
//!   +-- pool 64B   : segment 0 [slot|slot|...]   free: Injector<slot>
//!   +-- pool 256B  : segment 1 [slot|slot|...]   free: Injector<slot>
//!   +-- pool 1024B : segment 2 [slot]            free: Injector<slot>
//! ```
//!
//! Requests route to the smallest pool whose slot fits. With
//! `allow_larger_slab`, an exhausted pool falls through to the next larger
//! one.

use std::collections::BTreeMap;
use std::ops::Range;

use crossbeam_deque::{Injector, Steal};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::allocator::{Allocator, AllocatorKind, check_request};
use crate::clock;
use crate::error::{AllocError, AllocResult};
use crate::pointer::{Expiry, PayloadTag, Pointer, PointerEntry, PointerInfo, PointerTable};
use crate::region::{Region, RegionStats};

/// Pool of equally sized slots.
pub struct SlabPool {
    slot_size: usize,
    /// Indexes into the allocator's segment list.
    segments: Range<u32>,
    /// Pointer-table slots owned by this pool.
    slots: Range<u32>,
    free: Injector<u32>,
}

impl SlabPool {
    /// Size of every slot in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Total number of slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of segments backing this pool.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Slots currently available.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn pop(&self) -> Option<u32> {
        loop {
            match self.free.steal() {
                Steal::Success(slot) => return Some(slot),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    #[inline]
    fn push(&self, slot: u32) {
        self.free.push(slot);
    }

    fn refill(&self) {
        while self.pop().is_some() {}
        for slot in self.slots.clone() {
            self.push(slot);
        }
    }
}

/// Size-routing allocator over a set of slab pools.
pub struct SlabAllocator {
    buffer_id: u32,
    segments: Vec<Region>,
    /// Pool index for each segment.
    segment_pool: Vec<usize>,
    /// Pools sorted by ascending slot size.
    pools: Vec<SlabPool>,
    /// Slot size to pool index.
    by_size: BTreeMap<usize, usize>,
    table: PointerTable,
    allow_larger_slab: bool,
    capacity: u64,
    /// Held shared by placement and free, exclusively by `clear`, so a clear
    /// never races a slot being pushed back.
    epoch: RwLock<()>,
    stats: RegionStats,
}

impl SlabAllocator {
    /// Split `region_size` bytes evenly across one pool per slot size, each
    /// backed by `segments_per_pool` segments.
    pub fn new(
        buffer_id: u32,
        region_size: usize,
        slot_sizes: &[usize],
        segments_per_pool: usize,
        allow_larger_slab: bool,
    ) -> AllocResult<Self> {
        let mut sizes = slot_sizes.to_vec();
        sizes.sort_unstable();
        sizes.dedup();

        if sizes.is_empty() {
            return Err(AllocError::InvalidConfig(
                "slab allocator needs at least one slot size".into(),
            ));
        }
        if sizes[0] == 0 {
            return Err(AllocError::InvalidConfig(
                "slot size must be greater than zero".into(),
            ));
        }
        if segments_per_pool == 0 {
            return Err(AllocError::InvalidConfig(
                "segments per pool must be greater than zero".into(),
            ));
        }

        let pool_budget = region_size / sizes.len();
        let segment_budget = pool_budget / segments_per_pool;

        let table = PointerTable::new(buffer_id);
        let mut segments = Vec::new();
        let mut segment_pool = Vec::new();
        let mut pools = Vec::with_capacity(sizes.len());
        let mut by_size = BTreeMap::new();
        let mut capacity = 0u64;

        for (pool_idx, &slot_size) in sizes.iter().enumerate() {
            let slots_per_segment = segment_budget / slot_size;
            if slots_per_segment == 0 {
                return Err(AllocError::InvalidConfig(format!(
                    "slot size {slot_size} does not fit in a {segment_budget} byte segment"
                )));
            }
            let segment_size = slots_per_segment * slot_size;

            let first_segment = segments.len() as u32;
            let first_slot = table.slot_count() as u32;
            let free = Injector::new();

            for _ in 0..segments_per_pool {
                let segment_id = segments.len() as u32;
                segments.push(Region::new(segment_id, segment_size)?);
                segment_pool.push(pool_idx);

                for i in 0..slots_per_segment {
                    let start = (i * slot_size) as u32;
                    let end = start + slot_size as u32 - 1;
                    let (slot, _) = table.insert(segment_id, start, end);
                    free.push(slot);
                }
            }

            let pool = SlabPool {
                slot_size,
                segments: first_segment..segments.len() as u32,
                slots: first_slot..table.slot_count() as u32,
                free,
            };
            capacity += (pool.slot_count() * slot_size) as u64;

            info!(
                buffer_id,
                slot_size,
                segments = segments_per_pool,
                slots = pool.slot_count(),
                "created slab pool"
            );

            by_size.insert(slot_size, pool_idx);
            pools.push(pool);
        }

        Ok(Self {
            buffer_id,
            segments,
            segment_pool,
            pools,
            by_size,
            table,
            allow_larger_slab,
            capacity,
            epoch: RwLock::new(()),
            stats: RegionStats::default(),
        })
    }

    /// The pools, smallest slot size first.
    pub fn pools(&self) -> &[SlabPool] {
        &self.pools
    }

    /// Whether an exhausted pool falls through to larger ones.
    #[inline]
    pub fn allow_larger_slab(&self) -> bool {
        self.allow_larger_slab
    }

    fn segment(&self, entry: &PointerEntry) -> AllocResult<&Region> {
        let segment = entry.segment();
        self.segments.get(segment as usize).ok_or_else(|| {
            AllocError::InvariantViolation(format!("slot references missing segment {segment}"))
        })
    }

    fn pool_of(&self, entry: &PointerEntry) -> AllocResult<&SlabPool> {
        let segment = entry.segment() as usize;
        self.segment_pool
            .get(segment)
            .and_then(|&idx| self.pools.get(idx))
            .ok_or_else(|| {
                AllocError::InvariantViolation(format!("segment {segment} has no pool"))
            })
    }

    /// Pop a slot from the first pool that fits, falling through to larger
    /// pools only when allowed.
    fn pop_slot(&self, size: usize) -> Option<(usize, u32)> {
        for (&slot_size, &idx) in self.by_size.range(size..) {
            if let Some(slot) = self.pools[idx].pop() {
                return Some((idx, slot));
            }
            if !self.allow_larger_slab {
                debug!(buffer_id = self.buffer_id, slot_size, "slab pool exhausted");
                break;
            }
        }
        None
    }

    fn place(
        &self,
        size: usize,
        payload: Option<&[u8]>,
        expiry: Expiry,
        tag: PayloadTag,
    ) -> AllocResult<Pointer> {
        let _epoch = self.epoch.read();

        let Some((pool_idx, slot)) = self.pop_slot(size) else {
            if self.stats.record_failure() {
                warn!(buffer_id = self.buffer_id, "slab region entered shortage");
            }
            trace!(buffer_id = self.buffer_id, size, "no free slot");
            return Err(AllocError::OutOfSpace { requested: size });
        };

        let entry = self.table.entry(slot).ok_or_else(|| {
            AllocError::InvariantViolation(format!("free queue references missing slot {slot}"))
        })?;
        if let Some(payload) = payload {
            self.segment(&entry)?.write_at(entry.start(), payload);
        }
        let generation = entry.issue(size, tag, expiry, clock::now_millis());
        let slot_size = self.pools[pool_idx].slot_size;
        self.stats.add_used(slot_size);

        trace!(buffer_id = self.buffer_id, slot, slot_size, size, "placed");

        Ok(Pointer::new(self.buffer_id, slot, generation))
    }
}

impl Allocator for SlabAllocator {
    fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Slab
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
        let bytes = self
            .segment(&entry)?
            .copy_out(&entry, pointer.generation())?;
        entry.hit(clock::now_millis());
        Ok(bytes)
    }

    fn with_bytes(&self, pointer: &Pointer, f: &mut dyn FnMut(&[u8])) -> AllocResult<()> {
        let entry = self.table.checked(pointer)?;
        self.segment(&entry)?
            .view(&entry, pointer.generation(), |b| f(b))?;
        entry.hit(clock::now_millis());
        Ok(())
    }

    fn with_bytes_mut(
        &self,
        pointer: &Pointer,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> AllocResult<()> {
        let entry = self.table.checked(pointer)?;
        self.segment(&entry)?
            .view_mut(&entry, pointer.generation(), |b| f(b))
    }

    /// Rewrite the payload in place; the slot never changes.
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
        self.segment(&entry)?
            .rewrite(&entry, pointer.generation(), payload)?;
        Ok(*pointer)
    }

    fn free(&self, pointer: &Pointer) -> AllocResult<usize> {
        if pointer.buffer_id() != self.buffer_id {
            return Err(AllocError::UnknownRegion(pointer.buffer_id()));
        }
        let _epoch = self.epoch.read();
        let Some(entry) = self.table.entry(pointer.slot()) else {
            return Ok(0);
        };
        let pool = self.pool_of(&entry)?;
        if !entry.claim(pointer.generation()) {
            return Ok(0);
        }
        pool.push(pointer.slot());
        self.stats.sub_used(pool.slot_size);
        Ok(pool.slot_size)
    }

    fn info(&self, pointer: &Pointer) -> AllocResult<PointerInfo> {
        let entry = self.table.checked(pointer)?;
        Ok(entry.snapshot(self.buffer_id, pointer.slot()))
    }

    fn live_pointers(&self) -> Vec<PointerInfo> {
        self.table.live()
    }

    fn clear(&self) {
        let _epoch = self.epoch.write();
        self.table.invalidate_all();
        for pool in &self.pools {
            pool.refill();
        }
        self.stats.reset();
    }

    fn used(&self) -> u64 {
        self.stats.used()
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn max_request(&self) -> usize {
        self.pools.last().map(|p| p.slot_size).unwrap_or(0)
    }

    fn stats(&self) -> &RegionStats {
        &self.stats
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        // 3 pools of 1000 bytes each, 2 segments of 500 bytes per pool.
        let alloc = SlabAllocator::new(0, 3000, &[256, 64, 128], 2, false).unwrap();
        let sizes: Vec<_> = alloc.pools().iter().map(|p| p.slot_size()).collect();
        assert_eq!(sizes, vec![64, 128, 256]);

        assert_eq!(alloc.pools()[0].slot_count(), 2 * (500 / 64));
        assert_eq!(alloc.pools()[1].slot_count(), 2 * (500 / 128));
        assert_eq!(alloc.pools()[2].slot_count(), 2);
        assert_eq!(alloc.pools()[2].segment_count(), 2);
        assert_eq!(alloc.capacity(), (14 * 64 + 6 * 128 + 2 * 256) as u64);
        assert_eq!(alloc.max_request(), 256);
    }

    #[test]
    fn test_routes_to_smallest_fitting_pool() {
        let alloc = SlabAllocator::new(0, 3000, &[64, 128, 256], 1, false).unwrap();
        let p = alloc.store(&[1; 65], Expiry::never(), PayloadTag::NONE).unwrap();
        let info = alloc.info(&p).unwrap();
        assert_eq!(info.capacity(), 128);
        assert_eq!(info.len, 65);
        assert_eq!(alloc.used(), 128);
        assert_eq!(alloc.retrieve(&p).unwrap(), vec![1; 65]);

        let q = alloc.store(&[2; 64], Expiry::never(), PayloadTag::NONE).unwrap();
        assert_eq!(alloc.info(&q).unwrap().capacity(), 64);
    }

    #[test]
    fn test_oversized() {
        let alloc = SlabAllocator::new(0, 1024, &[64, 128], 1, true).unwrap();
        assert_eq!(
            alloc.store(&[0; 129], Expiry::never(), PayloadTag::NONE),
            Err(AllocError::OversizedRequest {
                requested: 129,
                limit: 128
            })
        );
    }

    #[test]
    fn test_exhausted_pool_without_fallthrough() {
        // Pools of 128 bytes: 2 slots of 64, 1 slot of 128.
        let alloc = SlabAllocator::new(0, 256, &[64, 128], 1, false).unwrap();
        alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE).unwrap();
        alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE).unwrap();
        assert_eq!(
            alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE),
            Err(AllocError::OutOfSpace { requested: 10 })
        );
        assert_eq!(alloc.pools()[1].free_count(), 1);
    }

    #[test]
    fn test_exhausted_pool_with_fallthrough() {
        let alloc = SlabAllocator::new(0, 256, &[64, 128], 1, true).unwrap();
        alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE).unwrap();
        alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE).unwrap();
        let p = alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE).unwrap();
        assert_eq!(alloc.info(&p).unwrap().capacity(), 128);
        assert_eq!(alloc.used(), 256);
        assert!(matches!(
            alloc.store(&[1; 10], Expiry::never(), PayloadTag::NONE),
            Err(AllocError::OutOfSpace { .. })
        ));
    }

    #[test]
    fn test_free_returns_slot() {
        let alloc = SlabAllocator::new(0, 128, &[64], 1, false).unwrap();
        let a = alloc.store(&[1; 8], Expiry::never(), PayloadTag::NONE).unwrap();
        let _b = alloc.store(&[2; 8], Expiry::never(), PayloadTag::NONE).unwrap();
        assert_eq!(alloc.pools()[0].free_count(), 0);

        assert_eq!(alloc.free(&a).unwrap(), 64);
        assert_eq!(alloc.free(&a).unwrap(), 0);
        assert_eq!(alloc.pools()[0].free_count(), 1);
        assert_eq!(alloc.used(), 64);

        let c = alloc.store(&[3; 8], Expiry::never(), PayloadTag::NONE).unwrap();
        assert_eq!(c.slot(), a.slot());
        assert_ne!(c.generation(), a.generation());
        assert_eq!(alloc.retrieve(&a), Err(AllocError::StalePointer));
    }

    #[test]
    fn test_update_in_place() {
        let alloc = SlabAllocator::new(0, 128, &[16], 1, false).unwrap();
        let p = alloc.store(b"hello", Expiry::never(), PayloadTag::NONE).unwrap();
        let q = alloc.update(&p, b"a longer value!").unwrap();
        assert_eq!(p, q);
        assert_eq!(alloc.retrieve(&p).unwrap(), b"a longer value!");
        assert_eq!(
            alloc.update(&p, &[0; 17]),
            Err(AllocError::CapacityExceeded {
                requested: 17,
                capacity: 16
            })
        );
        assert_eq!(alloc.used(), 16);
    }

    #[test]
    fn test_clear_refills() {
        let alloc = SlabAllocator::new(0, 128, &[64], 1, false).unwrap();
        let a = alloc.store(&[1; 8], Expiry::never(), PayloadTag::NONE).unwrap();
        alloc.store(&[1; 8], Expiry::never(), PayloadTag::NONE).unwrap();
        alloc.clear();
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.pools()[0].free_count(), 2);
        assert_eq!(alloc.retrieve(&a), Err(AllocError::StalePointer));
        assert!(alloc.live_pointers().is_empty());
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            SlabAllocator::new(0, 128, &[], 1, false),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            SlabAllocator::new(0, 128, &[0, 8], 1, false),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            SlabAllocator::new(0, 128, &[256], 1, false),
            Err(AllocError::InvalidConfig(_))
        ));
    }
}
