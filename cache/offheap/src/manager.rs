//! Multi-region memory manager.
//!
//! The manager owns an ordered set of regions, each wrapped by one allocator,
//! and routes placements through an [`AllocationPolicy`]. Pointers carry the
//! index of the region that issued them, so every other operation goes
//! straight to that region.
//!
//! Construct one per process with [`MemoryManager::builder`] or
//! [`MemoryManager::from_config`] and share it behind an `Arc`.

use tracing::{debug, info};

use crate::allocator::{Allocator, AllocatorKind, RegionAllocator, check_request};
use crate::bump::BumpAllocator;
use crate::clock;
use crate::coalescing::CoalescingAllocator;
use crate::config::{Config, OnExhaustion, PolicyKind};
use crate::error::{AllocError, AllocResult};
use crate::eviction::{self, DEFAULT_EXPIRE_BATCH};
use crate::metrics::{EXPIRED_BYTES, FREES, LFU_BYTES, STORE_FAILURES, STORES};
use crate::pointer::{Expiry, PayloadTag, Pointer, PointerInfo};
use crate::policy::{AllocationPolicy, DEFAULT_MAX_ALLOCATIONS, RoundRobinPolicy, SequentialPolicy};
use crate::slab::SlabAllocator;

/// Owns the regions and places payloads across them.
pub struct MemoryManager {
    regions: Vec<RegionAllocator>,
    policy: Box<dyn AllocationPolicy>,
    on_exhaustion: OnExhaustion,
    expire_batch: usize,
    lfu_batch: usize,
    max_request: usize,
}

impl MemoryManager {
    /// Create a builder with default settings.
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::new()
    }

    /// Build a manager from a validated configuration.
    pub fn from_config(config: &Config) -> AllocResult<Self> {
        config.validate()?;
        let memory = &config.memory;
        MemoryManagerBuilder::new()
            .regions(memory.regions)
            .region_size(memory.region_size)
            .strategy(memory.strategy)
            .slot_sizes(memory.slot_sizes.clone())
            .slab_segments(memory.slab_segments)
            .allow_larger_slab(memory.allow_larger_slab)
            .policy(config.policy.kind)
            .max_allocations(config.policy.max_allocations)
            .on_exhaustion(config.policy.on_exhaustion)
            .expire_batch(config.eviction.expire_batch)
            .lfu_batch(config.eviction.lfu_batch)
            .shortage_threshold(config.eviction.shortage_threshold)
            .build()
    }

    /// Store a copy of `payload`.
    ///
    /// Returns `Ok(None)` when no region has room, or `Err(OutOfSpace)` if
    /// the manager was built with [`OnExhaustion::Error`].
    pub fn store(&self, payload: &[u8], expiry: Expiry) -> AllocResult<Option<Pointer>> {
        self.store_tagged(payload, expiry, PayloadTag::NONE)
    }

    /// Store a copy of `payload` with an application payload tag.
    pub fn store_tagged(
        &self,
        payload: &[u8],
        expiry: Expiry,
        tag: PayloadTag,
    ) -> AllocResult<Option<Pointer>> {
        self.place(payload.len(), |region| region.store(payload, expiry, tag))
    }

    /// Reserve `size` bytes for the caller to fill through
    /// [`with_bytes_mut`](Self::with_bytes_mut).
    pub fn allocate(
        &self,
        tag: PayloadTag,
        size: usize,
        expiry: Expiry,
    ) -> AllocResult<Option<Pointer>> {
        self.place(size, |region| region.allocate(size, expiry, tag))
    }

    fn place(
        &self,
        size: usize,
        mut op: impl FnMut(&RegionAllocator) -> AllocResult<Pointer>,
    ) -> AllocResult<Option<Pointer>> {
        check_request(size, self.max_request)?;

        let count = self.regions.len();
        let mut previous = None;
        let mut attempt = 1;

        while let Some(idx) = self.policy.next(previous, attempt, count) {
            let region = self.regions.get(idx).ok_or_else(|| {
                AllocError::InvariantViolation(format!(
                    "policy chose region {idx} of {count}"
                ))
            })?;

            match op(region) {
                Ok(pointer) => {
                    STORES.increment();
                    return Ok(Some(pointer));
                }
                // A smaller region may reject what a larger one accepts.
                Err(e) if e.is_exhaustion() || matches!(e, AllocError::OversizedRequest { .. }) => {}
                Err(e) => return Err(e),
            }

            previous = Some(idx);
            attempt += 1;
        }

        STORE_FAILURES.increment();
        debug!(size, attempts = attempt - 1, "no region could place request");

        match self.on_exhaustion {
            OnExhaustion::ReturnNone => Ok(None),
            OnExhaustion::Error => Err(AllocError::OutOfSpace { requested: size }),
        }
    }

    /// Copy a payload out.
    pub fn retrieve(&self, pointer: &Pointer) -> AllocResult<Vec<u8>> {
        self.region(pointer.buffer_id())?.retrieve(pointer)
    }

    /// Borrow a payload.
    pub fn with_bytes(&self, pointer: &Pointer, mut f: impl FnMut(&[u8])) -> AllocResult<()> {
        self.region(pointer.buffer_id())?
            .with_bytes(pointer, &mut f)
    }

    /// Borrow a payload mutably.
    pub fn with_bytes_mut(
        &self,
        pointer: &Pointer,
        mut f: impl FnMut(&mut [u8]),
    ) -> AllocResult<()> {
        self.region(pointer.buffer_id())?
            .with_bytes_mut(pointer, &mut f)
    }

    /// Replace a payload within its existing range.
    ///
    /// Fails with `CapacityExceeded` when `payload` does not fit, leaving the
    /// pointer untouched. Use the returned pointer from then on.
    pub fn update(&self, pointer: &Pointer, payload: &[u8]) -> AllocResult<Pointer> {
        self.region(pointer.buffer_id())?.update(pointer, payload)
    }

    /// Replace a payload, moving it if it no longer fits.
    ///
    /// Updates in place when possible. Otherwise stores `payload` through the
    /// policy with the same tag and deadline and then frees the old range. A
    /// relative expiry keeps its original deadline rather than restarting. If
    /// no region has room the old pointer stays valid and the result follows
    /// the exhaustion setting.
    pub fn reallocate(&self, pointer: &Pointer, payload: &[u8]) -> AllocResult<Option<Pointer>> {
        let region = self.region(pointer.buffer_id())?;
        match region.update(pointer, payload) {
            Ok(pointer) => Ok(Some(pointer)),
            Err(AllocError::CapacityExceeded { .. }) => {
                let info = region.info(pointer)?;
                let expiry = if info.expires_in > 0 {
                    let deadline = info.created_at.saturating_add(info.expires_in);
                    Expiry::in_millis(deadline.saturating_sub(clock::now_millis()).max(1))
                } else {
                    Expiry::at_millis(info.expires_at)
                };
                let moved = self.store_tagged(payload, expiry, info.payload_tag)?;
                if moved.is_some() {
                    self.free(pointer)?;
                }
                Ok(moved)
            }
            Err(e) => Err(e),
        }
    }

    /// Free a pointer. Returns the bytes released; freeing twice is a no-op
    /// returning 0.
    pub fn free(&self, pointer: &Pointer) -> AllocResult<usize> {
        let freed = self.region(pointer.buffer_id())?.free(pointer)?;
        if freed > 0 {
            FREES.increment();
        }
        Ok(freed)
    }

    /// Metadata snapshot for a live pointer.
    pub fn info(&self, pointer: &Pointer) -> AllocResult<PointerInfo> {
        self.region(pointer.buffer_id())?.info(pointer)
    }

    /// Snapshot every live pointer in every region.
    pub fn live_pointers(&self) -> Vec<PointerInfo> {
        self.regions
            .iter()
            .flat_map(|r| r.live_pointers())
            .collect()
    }

    /// Run an expiration sweep over every region. Returns bytes reclaimed.
    pub fn collect_expired(&self) -> AllocResult<u64> {
        let now = clock::now_millis();
        let mut freed = 0;
        for region in &self.regions {
            freed += eviction::collect_expired(region, self.expire_batch, now)?;
        }
        EXPIRED_BYTES.add(freed);
        Ok(freed)
    }

    /// Run an LFU sweep over every region in shortage. Returns bytes
    /// reclaimed.
    pub fn collect_lfu(&self) -> AllocResult<u64> {
        let now = clock::now_millis();
        let mut freed = 0;
        for region in &self.regions {
            freed += eviction::collect_lfu(region, self.lfu_batch, now)?;
        }
        LFU_BYTES.add(freed);
        Ok(freed)
    }

    /// Free everything, invalidating every outstanding pointer, and reset
    /// the policy.
    pub fn clear(&self) {
        for region in &self.regions {
            region.clear();
        }
        self.policy.reset();
        info!(regions = self.regions.len(), "cleared memory manager");
    }

    /// Bytes issued across all regions.
    pub fn used(&self) -> u64 {
        self.regions.iter().map(|r| r.used()).sum()
    }

    /// Bytes issuable across all regions.
    pub fn capacity(&self) -> u64 {
        self.regions.iter().map(|r| r.capacity()).sum()
    }

    /// The regions, indexed by buffer id.
    pub fn regions(&self) -> &[RegionAllocator] {
        &self.regions
    }

    /// The region with the given buffer id.
    pub fn region(&self, buffer_id: u32) -> AllocResult<&RegionAllocator> {
        self.regions
            .get(buffer_id as usize)
            .ok_or(AllocError::UnknownRegion(buffer_id))
    }

    /// Largest request any region can satisfy.
    pub fn max_request(&self) -> usize {
        self.max_request
    }
}

/// Builder for [`MemoryManager`].
pub struct MemoryManagerBuilder {
    regions: usize,
    region_size: usize,
    strategy: AllocatorKind,
    slot_sizes: Vec<usize>,
    slab_segments: usize,
    allow_larger_slab: bool,
    policy: PolicyKind,
    max_allocations: usize,
    custom_policy: Option<Box<dyn AllocationPolicy>>,
    on_exhaustion: OnExhaustion,
    expire_batch: usize,
    lfu_batch: usize,
    shortage_threshold: u64,
}

impl Default for MemoryManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManagerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            regions: config.memory.regions,
            region_size: config.memory.region_size,
            strategy: config.memory.strategy,
            slot_sizes: config.memory.slot_sizes,
            slab_segments: config.memory.slab_segments,
            allow_larger_slab: config.memory.allow_larger_slab,
            policy: config.policy.kind,
            max_allocations: DEFAULT_MAX_ALLOCATIONS,
            custom_policy: None,
            on_exhaustion: config.policy.on_exhaustion,
            expire_batch: DEFAULT_EXPIRE_BATCH,
            lfu_batch: config.eviction.lfu_batch,
            shortage_threshold: config.eviction.shortage_threshold,
        }
    }

    /// Number of regions (default 1).
    pub fn regions(mut self, regions: usize) -> Self {
        self.regions = regions;
        self
    }

    /// Bytes per region (default 64MB).
    pub fn region_size(mut self, size: usize) -> Self {
        self.region_size = size;
        self
    }

    /// Placement strategy (default coalescing).
    pub fn strategy(mut self, strategy: AllocatorKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Slot sizes for the slab strategy.
    pub fn slot_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.slot_sizes = sizes;
        self
    }

    /// Segments per slab pool (default 1).
    pub fn slab_segments(mut self, segments: usize) -> Self {
        self.slab_segments = segments;
        self
    }

    /// Let an exhausted slab pool fall through to larger slots.
    pub fn allow_larger_slab(mut self, allow: bool) -> Self {
        self.allow_larger_slab = allow;
        self
    }

    /// Stock policy (default sequential).
    pub fn policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Attempts per call for the round-robin policy (default 2).
    pub fn max_allocations(mut self, max: usize) -> Self {
        self.max_allocations = max;
        self
    }

    /// Use a custom policy instead of a stock one.
    pub fn allocation_policy(mut self, policy: impl AllocationPolicy + 'static) -> Self {
        self.custom_policy = Some(Box::new(policy));
        self
    }

    /// Exhaustion reporting (default `Ok(None)`).
    pub fn on_exhaustion(mut self, on_exhaustion: OnExhaustion) -> Self {
        self.on_exhaustion = on_exhaustion;
        self
    }

    /// Pointers freed per region and expiration kind per sweep (default 50).
    pub fn expire_batch(mut self, batch: usize) -> Self {
        self.expire_batch = batch;
        self
    }

    /// Pointers freed per region per LFU sweep; 0 for a tenth of the live
    /// pointers (default 0).
    pub fn lfu_batch(mut self, batch: usize) -> Self {
        self.lfu_batch = batch;
        self
    }

    /// Allocation errors tolerated before a region is in shortage (default 0).
    pub fn shortage_threshold(mut self, threshold: u64) -> Self {
        self.shortage_threshold = threshold;
        self
    }

    /// Allocate the regions and build the manager.
    pub fn build(self) -> AllocResult<MemoryManager> {
        if self.regions == 0 {
            return Err(AllocError::InvalidConfig("regions must be at least 1".into()));
        }
        if self.regions > u32::MAX as usize {
            return Err(AllocError::InvalidConfig(format!(
                "too many regions: {}",
                self.regions
            )));
        }
        if self.max_allocations == 0 {
            return Err(AllocError::InvalidConfig(
                "max_allocations must be at least 1".into(),
            ));
        }

        let mut regions = Vec::with_capacity(self.regions);
        for id in 0..self.regions as u32 {
            let region: RegionAllocator = match self.strategy {
                AllocatorKind::Bump => BumpAllocator::new(id, self.region_size)?.into(),
                AllocatorKind::Coalescing => {
                    CoalescingAllocator::new(id, self.region_size)?.into()
                }
                AllocatorKind::Slab => SlabAllocator::new(
                    id,
                    self.region_size,
                    &self.slot_sizes,
                    self.slab_segments,
                    self.allow_larger_slab,
                )?
                .into(),
            };
            region.stats().set_shortage_threshold(self.shortage_threshold);
            regions.push(region);
        }

        let policy: Box<dyn AllocationPolicy> = match self.custom_policy {
            Some(policy) => policy,
            None => match self.policy {
                PolicyKind::Sequential => Box::new(SequentialPolicy::new()),
                PolicyKind::RoundRobin => Box::new(RoundRobinPolicy::new(self.max_allocations)),
            },
        };

        let max_request = regions.iter().map(|r| r.max_request()).max().unwrap_or(0);

        info!(
            regions = self.regions,
            region_size = self.region_size,
            strategy = %self.strategy,
            "created memory manager"
        );

        Ok(MemoryManager {
            regions,
            policy,
            on_exhaustion: self.on_exhaustion,
            expire_batch: self.expire_batch,
            lfu_batch: self.lfu_batch,
            max_request,
        })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn manager(regions: usize, size: usize) -> MemoryManager {
        MemoryManager::builder()
            .regions(regions)
            .region_size(size)
            .build()
            .unwrap()
    }

    #[test]
    fn test_store_retrieve_free() {
        let mm = manager(1, 128);
        let p = mm.store(b"payload", Expiry::never()).unwrap().unwrap();
        assert_eq!(mm.retrieve(&p).unwrap(), b"payload");
        assert_eq!(mm.used(), 7);
        assert_eq!(mm.capacity(), 128);
        assert_eq!(mm.free(&p).unwrap(), 7);
        assert_eq!(mm.free(&p).unwrap(), 0);
        assert_eq!(mm.used(), 0);
    }

    #[test]
    fn test_sequential_fallback() {
        let mm = manager(2, 16);
        let a = mm.store(&[1; 16], Expiry::never()).unwrap().unwrap();
        let b = mm.store(&[2; 16], Expiry::never()).unwrap().unwrap();
        assert_eq!(a.buffer_id(), 0);
        assert_eq!(b.buffer_id(), 1);
        assert_eq!(mm.store(&[3; 1], Expiry::never()).unwrap(), None);
    }

    #[test]
    fn test_exhaustion_error() {
        let mm = MemoryManager::builder()
            .region_size(8)
            .on_exhaustion(OnExhaustion::Error)
            .build()
            .unwrap();
        mm.store(&[0; 8], Expiry::never()).unwrap();
        assert_eq!(
            mm.store(&[0; 1], Expiry::never()),
            Err(AllocError::OutOfSpace { requested: 1 })
        );
    }

    #[test]
    fn test_oversized_regardless_of_flag() {
        let mm = manager(2, 16);
        assert_eq!(
            mm.store(&[0; 17], Expiry::never()),
            Err(AllocError::OversizedRequest {
                requested: 17,
                limit: 16
            })
        );
    }

    #[test]
    fn test_unknown_region() {
        let mm = manager(1, 16);
        let other = manager(2, 16);
        let _ = other.store(&[0; 16], Expiry::never()).unwrap();
        let p = other.store(&[0; 16], Expiry::never()).unwrap().unwrap();
        assert_eq!(mm.retrieve(&p), Err(AllocError::UnknownRegion(1)));
    }

    #[test]
    fn test_reallocate_moves_when_too_large() {
        let mm = manager(1, 64);
        let p = mm
            .store_tagged(b"small", Expiry::in_millis(60_000), PayloadTag(4))
            .unwrap()
            .unwrap();
        let before = mm.info(&p).unwrap();
        let deadline = before.created_at + before.expires_in;
        std::thread::sleep(std::time::Duration::from_millis(20));

        let same = mm.reallocate(&p, b"tiny").unwrap().unwrap();
        assert_eq!(same, p);

        let moved = mm.reallocate(&p, b"a much longer payload").unwrap().unwrap();
        assert_ne!(moved, p);
        assert_eq!(mm.retrieve(&moved).unwrap(), b"a much longer payload");
        assert_eq!(mm.retrieve(&p), Err(AllocError::StalePointer));

        let info = mm.info(&moved).unwrap();
        assert_eq!(info.payload_tag, PayloadTag(4));
        // The move keeps the deadline instead of restarting the TTL.
        assert!(info.expires_in < 60_000);
        let moved_deadline = info.created_at + info.expires_in;
        assert!((deadline..deadline + 1_000).contains(&moved_deadline));
        assert_eq!(mm.used(), 21);
    }

    #[test]
    fn test_reallocate_keeps_absolute_deadline() {
        let mm = manager(1, 64);
        let deadline = clock::now_millis() + 60_000;
        let p = mm.store(b"ab", Expiry::at_millis(deadline)).unwrap().unwrap();
        let moved = mm.reallocate(&p, b"abcdefgh").unwrap().unwrap();
        let info = mm.info(&moved).unwrap();
        assert_eq!(info.expires_at, deadline);
        assert_eq!(info.expires_in, 0);

        let q = mm.store(b"cd", Expiry::never()).unwrap().unwrap();
        let moved = mm.reallocate(&q, b"abcdefgh").unwrap().unwrap();
        let info = mm.info(&moved).unwrap();
        assert_eq!((info.expires_in, info.expires_at), (0, 0));
    }

    #[test]
    fn test_allocate_and_fill() {
        let mm = manager(1, 64);
        let p = mm
            .allocate(PayloadTag(1), 4, Expiry::never())
            .unwrap()
            .unwrap();
        mm.with_bytes_mut(&p, |b| b.copy_from_slice(b"fill")).unwrap();
        let mut out = Vec::new();
        mm.with_bytes(&p, |b| out.extend_from_slice(b)).unwrap();
        assert_eq!(out, b"fill");
    }

    #[test]
    fn test_clear_resets_policy() {
        let mm = manager(2, 8);
        mm.store(&[0; 8], Expiry::never()).unwrap().unwrap();
        let p = mm.store(&[0; 8], Expiry::never()).unwrap().unwrap();
        assert_eq!(p.buffer_id(), 1);

        mm.clear();
        assert_eq!(mm.used(), 0);
        assert!(mm.live_pointers().is_empty());
        let q = mm.store(&[0; 8], Expiry::never()).unwrap().unwrap();
        assert_eq!(q.buffer_id(), 0);
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            MemoryManager::builder().regions(0).build(),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            MemoryManager::builder().region_size(0).build(),
            Err(AllocError::InvalidConfig(_))
        ));
        assert!(matches!(
            MemoryManager::builder().max_allocations(0).build(),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_toml(
            r#"
            [memory]
            regions = 2
            region_size = "4KB"
            strategy = "bump"
            "#,
        )
        .unwrap();
        let mm = MemoryManager::from_config(&config).unwrap();
        assert_eq!(mm.regions().len(), 2);
        assert_eq!(mm.capacity(), 8192);
        assert_eq!(mm.regions()[0].kind(), AllocatorKind::Bump);
    }
}
