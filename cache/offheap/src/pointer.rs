//! Pointer handles and the per-region pointer table.
//!
//! A [`Pointer`] is a small `Copy` handle naming a slot in a region's
//! [`PointerTable`] together with the generation the slot had when the
//! handle was issued. The metadata itself lives in a [`PointerEntry`] that is
//! owned by the table and is reset, never dropped, while the region lives.
//!
//! # Generation protocol
//!
//! ```text
//!   issue (gen = g, free = false)  --free(handle g)-->  gen = g + 1, free = true
//!          ^                                                   |
//!          +--------- reissue under allocator lock ------------+
//! ```
//!
//! `free` claims the entry with a compare-and-swap from `g` to `g + 1`, so of
//! any number of concurrent frees through handles of generation `g` exactly
//! one succeeds and the rest observe a stale handle. Readers compare the
//! generation before and after copying bytes out.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::error::{AllocError, AllocResult};
use crate::sync::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Opaque handle to an allocated byte range.
///
/// Handles are cheap to copy and carry no borrow of the region. Every access
/// through a handle is checked against the slot's current generation, so a
/// handle kept past `free()` or `clear()` is rejected with
/// [`AllocError::StalePointer`] instead of reading reused memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pointer {
    buffer_id: u32,
    slot: u32,
    generation: u32,
}

impl Pointer {
    #[inline]
    pub(crate) fn new(buffer_id: u32, slot: u32, generation: u32) -> Self {
        Self {
            buffer_id,
            slot,
            generation,
        }
    }

    /// The region this pointer belongs to.
    #[inline]
    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    /// Slot index within the region's pointer table.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation of the slot when this handle was issued.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Application-supplied payload type discriminator.
///
/// The allocator carries the tag through untouched so callers can pick a
/// deserializer on retrieval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PayloadTag(pub u32);

impl PayloadTag {
    /// Tag used for untyped stores.
    pub const NONE: PayloadTag = PayloadTag(0);
}

/// Expiration settings for a stored payload, in milliseconds.
///
/// `expires_in > 0` is a relative lifetime counted from creation,
/// `expires_at > 0` is an absolute epoch deadline. When both are set the
/// relative form wins. Both zero means the payload never expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Expiry {
    /// Relative lifetime in milliseconds.
    pub expires_in: i64,
    /// Absolute deadline in epoch milliseconds.
    pub expires_at: i64,
}

impl Expiry {
    /// Never expires.
    pub const fn never() -> Self {
        Self {
            expires_in: 0,
            expires_at: 0,
        }
    }

    /// Expires `ttl` after creation.
    pub fn after(ttl: Duration) -> Self {
        Self::in_millis(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Expires `millis` milliseconds after creation.
    pub const fn in_millis(millis: i64) -> Self {
        Self {
            expires_in: millis,
            expires_at: 0,
        }
    }

    /// Expires at the given wall-clock time.
    pub fn at(deadline: SystemTime) -> Self {
        Self::at_millis(clock::to_millis(deadline))
    }

    /// Expires at the given epoch millisecond.
    pub const fn at_millis(deadline: i64) -> Self {
        Self {
            expires_in: 0,
            expires_at: deadline,
        }
    }

    /// Resolve the relative-wins rule into `(expires_in, expires_at)`.
    #[inline]
    pub fn normalized(self) -> (i64, i64) {
        if self.expires_in > 0 {
            (self.expires_in, 0)
        } else if self.expires_at > 0 {
            (0, self.expires_at)
        } else {
            (0, 0)
        }
    }

    /// Returns true if this expiry never fires.
    #[inline]
    pub fn is_never(&self) -> bool {
        self.normalized() == (0, 0)
    }
}

/// Point-in-time copy of a pointer's metadata.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointerInfo {
    /// Handle for the range at the time of the snapshot.
    pub pointer: Pointer,
    /// Parent segment (slab pools only, 0 otherwise).
    pub segment: u32,
    /// First byte offset, inclusive.
    pub start: u32,
    /// Last byte offset, inclusive.
    pub end: u32,
    /// Length of the payload currently stored.
    pub len: u32,
    /// Whether the range is free.
    pub free: bool,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    /// Absolute deadline in epoch milliseconds (0 = none).
    pub expires_at: i64,
    /// Relative lifetime in milliseconds (0 = none).
    pub expires_in: i64,
    /// Number of retrievals.
    pub hits: u64,
    /// Time of the last retrieval in epoch milliseconds.
    pub last_hit_at: i64,
    /// Application payload tag.
    pub payload_tag: PayloadTag,
}

impl PointerInfo {
    /// Size of the byte range: `end - start + 1`.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Relative expiration has passed.
    #[inline]
    pub fn is_expired_relative(&self, now: i64) -> bool {
        self.expires_in > 0 && self.created_at.saturating_add(self.expires_in) <= now
    }

    /// Absolute expiration has passed.
    #[inline]
    pub fn is_expired_absolute(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now
    }

    /// Either form of expiration has passed.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.is_expired_relative(now) || self.is_expired_absolute(now)
    }

    /// Hits per millisecond of age.
    ///
    /// Age is clamped to at least one millisecond and zero hits yield 0.0,
    /// so the result is always finite.
    #[inline]
    pub fn frequency(&self, now: i64) -> f64 {
        if self.hits == 0 {
            return 0.0;
        }
        let age = (now - self.created_at).max(1);
        self.hits as f64 / age as f64
    }
}

/// Metadata for one byte range, owned by a [`PointerTable`].
///
/// Range fields are only mutated while the entry is free and the owning
/// allocator holds its lock. The free flag, generation and hit counters are
/// atomics so readers never need the allocator lock.
pub(crate) struct PointerEntry {
    generation: AtomicU32,
    free: AtomicBool,
    segment: AtomicU32,
    start: AtomicU32,
    end: AtomicU32,
    len: AtomicU32,
    created_at: AtomicI64,
    expires_at: AtomicI64,
    expires_in: AtomicI64,
    hits: AtomicU64,
    last_hit_at: AtomicI64,
    tag: AtomicU32,
}

impl PointerEntry {
    /// A free entry covering `[start, end]`.
    pub(crate) fn new_free(segment: u32, start: u32, end: u32) -> Self {
        Self {
            generation: AtomicU32::new(0),
            free: AtomicBool::new(true),
            segment: AtomicU32::new(segment),
            start: AtomicU32::new(start),
            end: AtomicU32::new(end),
            len: AtomicU32::new(0),
            created_at: AtomicI64::new(0),
            expires_at: AtomicI64::new(0),
            expires_in: AtomicI64::new(0),
            hits: AtomicU64::new(0),
            last_hit_at: AtomicI64::new(0),
            tag: AtomicU32::new(0),
        }
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    /// The entry is live and still at `generation`.
    #[inline]
    pub(crate) fn is_current(&self, generation: u32) -> bool {
        !self.is_free() && self.generation() == generation
    }

    #[inline]
    pub(crate) fn segment(&self) -> u32 {
        self.segment.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn start(&self) -> u32 {
        self.start.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn end(&self) -> u32 {
        self.end.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        (self.end() - self.start()) as usize + 1
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub(crate) fn set_len(&self, len: usize) {
        self.len.store(len as u32, Ordering::Release);
    }

    #[inline]
    pub(crate) fn expiry(&self) -> Expiry {
        Expiry {
            expires_in: self.expires_in.load(Ordering::Relaxed),
            expires_at: self.expires_at.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn tag(&self) -> PayloadTag {
        PayloadTag(self.tag.load(Ordering::Relaxed))
    }

    /// Move a free entry to cover `[start, end]` of `segment`.
    pub(crate) fn set_range(&self, segment: u32, start: u32, end: u32) {
        debug_assert!(self.is_free(), "set_range on a live entry");
        debug_assert!(start <= end);
        self.segment.store(segment, Ordering::Relaxed);
        self.start.store(start, Ordering::Release);
        self.end.store(end, Ordering::Release);
    }

    /// Mark a free entry live and return the generation to hand out.
    pub(crate) fn issue(&self, len: usize, tag: PayloadTag, expiry: Expiry, now: i64) -> u32 {
        debug_assert!(self.is_free(), "issue on a live entry");
        let (expires_in, expires_at) = expiry.normalized();
        self.len.store(len as u32, Ordering::Relaxed);
        self.created_at.store(now, Ordering::Relaxed);
        self.expires_in.store(expires_in, Ordering::Relaxed);
        self.expires_at.store(expires_at, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.last_hit_at.store(0, Ordering::Relaxed);
        self.tag.store(tag.0, Ordering::Relaxed);
        self.free.store(false, Ordering::Release);
        self.generation()
    }

    /// Claim a live entry for freeing.
    ///
    /// Returns false if the entry is already free or has moved on to another
    /// generation. On success the generation is bumped, the metadata is reset
    /// and the entry is marked free.
    pub(crate) fn claim(&self, generation: u32) -> bool {
        if self.is_free() {
            return false;
        }
        if self
            .generation
            .compare_exchange(
                generation,
                generation.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.reset();
        true
    }

    /// Unconditionally invalidate every outstanding handle.
    pub(crate) fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.reset();
    }

    fn reset(&self) {
        self.len.store(0, Ordering::Relaxed);
        self.created_at.store(0, Ordering::Relaxed);
        self.expires_in.store(0, Ordering::Relaxed);
        self.expires_at.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.last_hit_at.store(0, Ordering::Relaxed);
        self.tag.store(0, Ordering::Relaxed);
        self.free.store(true, Ordering::Release);
    }

    /// Record a retrieval.
    #[inline]
    pub(crate) fn hit(&self, now: i64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_hit_at.store(now, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, buffer_id: u32, slot: u32) -> PointerInfo {
        PointerInfo {
            pointer: Pointer::new(buffer_id, slot, self.generation()),
            segment: self.segment(),
            start: self.start(),
            end: self.end(),
            len: self.len.load(Ordering::Relaxed),
            free: self.is_free(),
            created_at: self.created_at.load(Ordering::Relaxed),
            expires_at: self.expires_at.load(Ordering::Relaxed),
            expires_in: self.expires_in.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            last_hit_at: self.last_hit_at.load(Ordering::Relaxed),
            payload_tag: self.tag(),
        }
    }
}

/// Slot-indexed storage for a region's pointer entries.
///
/// Slots are never removed. Retired slots go to a vacancy list and are reused
/// with their generation already advanced, so old handles stay stale.
pub(crate) struct PointerTable {
    buffer_id: u32,
    entries: RwLock<Vec<Arc<PointerEntry>>>,
    vacant: Mutex<Vec<u32>>,
}

impl PointerTable {
    pub(crate) fn new(buffer_id: u32) -> Self {
        Self {
            buffer_id,
            entries: RwLock::new(Vec::new()),
            vacant: Mutex::new(Vec::new()),
        }
    }

    /// Place a free entry covering `[start, end]`, reusing a vacant slot when
    /// one exists.
    pub(crate) fn insert(&self, segment: u32, start: u32, end: u32) -> (u32, Arc<PointerEntry>) {
        if let Some(slot) = self.vacant.lock().pop() {
            let entry = self.entries.read()[slot as usize].clone();
            entry.set_range(segment, start, end);
            return (slot, entry);
        }

        let entry = Arc::new(PointerEntry::new_free(segment, start, end));
        let mut entries = self.entries.write();
        let slot = entries.len() as u32;
        entries.push(entry.clone());
        (slot, entry)
    }

    /// Entry at `slot`, regardless of state.
    #[inline]
    pub(crate) fn entry(&self, slot: u32) -> Option<Arc<PointerEntry>> {
        self.entries.read().get(slot as usize).cloned()
    }

    /// Entry for a live handle, or `StalePointer`.
    pub(crate) fn checked(&self, pointer: &Pointer) -> AllocResult<Arc<PointerEntry>> {
        if pointer.buffer_id() != self.buffer_id {
            return Err(AllocError::UnknownRegion(pointer.buffer_id()));
        }
        let entry = self
            .entry(pointer.slot())
            .ok_or(AllocError::StalePointer)?;
        if !entry.is_current(pointer.generation()) {
            return Err(AllocError::StalePointer);
        }
        Ok(entry)
    }

    /// Return a claimed slot to the vacancy list.
    #[inline]
    pub(crate) fn retire(&self, slot: u32) {
        self.vacant.lock().push(slot);
    }

    /// Number of slots ever created.
    pub(crate) fn slot_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Snapshot every live entry.
    pub(crate) fn live(&self) -> Vec<PointerInfo> {
        let entries = self.entries.read();
        entries
            .iter()
            .enumerate()
            .map(|(slot, e)| e.snapshot(self.buffer_id, slot as u32))
            .filter(|info| !info.free)
            .collect()
    }

    /// Invalidate every entry, keeping slot assignments.
    pub(crate) fn invalidate_all(&self) {
        for entry in self.entries.read().iter() {
            entry.invalidate();
        }
    }

    /// Invalidate every entry and mark all slots vacant.
    pub(crate) fn reset(&self) {
        let entries = self.entries.read();
        let mut vacant = self.vacant.lock();
        vacant.clear();
        for (slot, entry) in entries.iter().enumerate().rev() {
            entry.invalidate();
            vacant.push(slot as u32);
        }
    }
}
