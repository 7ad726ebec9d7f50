//! Fixed-size byte regions and their usage counters.
//!
//! A [`Region`] owns one contiguous byte area allocated once at startup and
//! never resized. Allocators carve it into ranges described by pointer
//! entries; every byte access goes through the region's lock and is bounded
//! by the entry's range, so a range can never reach into its neighbors.

use std::ops::Range;

use parking_lot::RwLock;

use crate::error::{AllocError, AllocResult};
use crate::pointer::PointerEntry;
use crate::sync::{AtomicU64, Ordering};

/// A fixed-capacity backing store.
pub struct Region {
    id: u32,
    bytes: RwLock<Box<[u8]>>,
}

impl Region {
    /// Allocate a zeroed region of `size` bytes.
    ///
    /// Offsets are `u32`, so a region holds at most `u32::MAX` bytes.
    pub fn new(id: u32, size: usize) -> AllocResult<Self> {
        if size == 0 {
            return Err(AllocError::InvalidConfig(
                "region size must be greater than zero".into(),
            ));
        }
        if size > u32::MAX as usize {
            return Err(AllocError::InvalidConfig(format!(
                "region size {size} exceeds maximum of {} bytes",
                u32::MAX
            )));
        }

        Ok(Self {
            id,
            bytes: RwLock::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    /// Region identifier.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.read().len()
    }

    /// Write `payload` at `start`.
    ///
    /// Used while the target range is still free and owned by the caller.
    pub(crate) fn write_at(&self, start: u32, payload: &[u8]) {
        let mut bytes = self.bytes.write();
        let start = start as usize;
        bytes[start..start + payload.len()].copy_from_slice(payload);
    }

    /// Overwrite a live entry's payload in place and record the new length.
    pub(crate) fn rewrite(
        &self,
        entry: &PointerEntry,
        generation: u32,
        payload: &[u8],
    ) -> AllocResult<()> {
        let mut bytes = self.bytes.write();
        let range = checked_range(entry, generation, payload.len())?;
        bytes
            .get_mut(range)
            .ok_or(AllocError::StalePointer)?
            .copy_from_slice(payload);
        entry.set_len(payload.len());
        Ok(())
    }

    /// Copy the entry's payload out.
    ///
    /// The generation is checked before and after the copy.
    pub(crate) fn copy_out(&self, entry: &PointerEntry, generation: u32) -> AllocResult<Vec<u8>> {
        self.view(entry, generation, |payload| payload.to_vec())
    }

    /// Run `f` over the entry's payload.
    ///
    /// If the pointer is freed while `f` runs, `f` may observe the freed
    /// payload and the call returns `StalePointer`.
    pub(crate) fn view<R>(
        &self,
        entry: &PointerEntry,
        generation: u32,
        f: impl FnOnce(&[u8]) -> R,
    ) -> AllocResult<R> {
        let bytes = self.bytes.read();
        let range = checked_range(entry, generation, entry.len())?;
        let result = f(bytes.get(range).ok_or(AllocError::StalePointer)?);
        if !entry.is_current(generation) {
            return Err(AllocError::StalePointer);
        }
        Ok(result)
    }

    /// Run `f` over the entry's payload with write access.
    pub(crate) fn view_mut<R>(
        &self,
        entry: &PointerEntry,
        generation: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> AllocResult<R> {
        let mut bytes = self.bytes.write();
        let range = checked_range(entry, generation, entry.len())?;
        Ok(f(bytes.get_mut(range).ok_or(AllocError::StalePointer)?))
    }
}

/// The byte range `[start, start + len)` of a live entry.
///
/// Free and reuse do not take the region lock, so the range is read first
/// and the generation checked afterwards. A range that passes the check was
/// loaded before any claim, and a `len` larger than the entry's capacity
/// means the fields came from different owners.
fn checked_range(entry: &PointerEntry, generation: u32, len: usize) -> AllocResult<Range<usize>> {
    let start = entry.start() as usize;
    let end = entry.end() as usize;
    if !entry.is_current(generation) || start + len > end + 1 {
        return Err(AllocError::StalePointer);
    }
    Ok(start..start + len)
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// Usage and shortage bookkeeping for one allocator.
///
/// `allocation_errors` counts failed placements since the last successful
/// LFU sweep. The allocator is in shortage once the count exceeds the
/// threshold.
#[derive(Debug)]
pub struct RegionStats {
    used: AtomicU64,
    allocation_errors: AtomicU64,
    shortage_threshold: AtomicU64,
}

impl Default for RegionStats {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RegionStats {
    /// Counters starting at zero with the given shortage threshold.
    pub fn new(shortage_threshold: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            allocation_errors: AtomicU64::new(0),
            shortage_threshold: AtomicU64::new(shortage_threshold),
        }
    }

    /// Bytes currently issued.
    #[inline]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn add_used(&self, bytes: usize) {
        self.used.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn sub_used(&self, bytes: usize) {
        self.used.fetch_sub(bytes as u64, Ordering::AcqRel);
    }

    /// Failed placements since the last reset.
    #[inline]
    pub fn allocation_errors(&self) -> u64 {
        self.allocation_errors.load(Ordering::Acquire)
    }

    /// Threshold above which the allocator is in shortage.
    #[inline]
    pub fn shortage_threshold(&self) -> u64 {
        self.shortage_threshold.load(Ordering::Relaxed)
    }

    /// Change the shortage threshold.
    #[inline]
    pub fn set_shortage_threshold(&self, threshold: u64) {
        self.shortage_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Allocation errors exceed the shortage threshold.
    #[inline]
    pub fn in_shortage(&self) -> bool {
        self.allocation_errors() > self.shortage_threshold()
    }

    /// Count a failed placement. Returns true if this failure moved the
    /// allocator into shortage.
    pub(crate) fn record_failure(&self) -> bool {
        let errors = self.allocation_errors.fetch_add(1, Ordering::AcqRel) + 1;
        errors == self.shortage_threshold() + 1
    }

    /// Leave shortage.
    #[inline]
    pub(crate) fn reset_errors(&self) {
        self.allocation_errors.store(0, Ordering::Release);
    }

    /// Zero every counter.
    pub(crate) fn reset(&self) {
        self.used.store(0, Ordering::Release);
        self.reset_errors();
    }
}
