//! The common allocator interface and the closed set of strategies.

use serde::Deserialize;

use crate::bump::BumpAllocator;
use crate::coalescing::CoalescingAllocator;
use crate::error::{AllocError, AllocResult};
use crate::pointer::{Expiry, PayloadTag, Pointer, PointerInfo};
use crate::region::RegionStats;
use crate::slab::SlabAllocator;

/// Which placement strategy an allocator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// First fit over a creation-ordered list, no merging on free.
    Bump,
    /// Largest fit over a size/offset index, merging neighbors on free.
    #[default]
    Coalescing,
    /// Fixed-size slot pools routed by request size.
    Slab,
}

impl std::fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocatorKind::Bump => write!(f, "bump"),
            AllocatorKind::Coalescing => write!(f, "coalescing"),
            AllocatorKind::Slab => write!(f, "slab"),
        }
    }
}

/// Operations every placement strategy provides over its region.
///
/// `store` and `allocate` fail with `OutOfSpace` when nothing fits right now
/// (and count the failure toward shortage), and with `OversizedRequest` when
/// the request could never fit. All pointer-taking methods reject stale
/// handles with `StalePointer`, except `free`, which returns 0 for them.
pub trait Allocator: Send + Sync {
    /// Identifier stamped on every pointer this allocator issues.
    fn buffer_id(&self) -> u32;

    /// The strategy in use.
    fn kind(&self) -> AllocatorKind;

    /// Place a copy of `payload`.
    fn store(&self, payload: &[u8], expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer>;

    /// Reserve `size` bytes, leaving their contents unspecified.
    ///
    /// Fill the range through [`with_bytes_mut`](Allocator::with_bytes_mut).
    fn allocate(&self, size: usize, expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer>;

    /// Copy the payload out, counting a hit.
    fn retrieve(&self, pointer: &Pointer) -> AllocResult<Vec<u8>>;

    /// Borrow the payload, counting a hit.
    fn with_bytes(&self, pointer: &Pointer, f: &mut dyn FnMut(&[u8])) -> AllocResult<()>;

    /// Borrow the payload mutably.
    fn with_bytes_mut(&self, pointer: &Pointer, f: &mut dyn FnMut(&mut [u8]))
    -> AllocResult<()>;

    /// Replace the payload. Fails with `CapacityExceeded`, leaving the
    /// pointer untouched, when `payload` is larger than the range.
    ///
    /// The returned pointer supersedes `pointer`; strategies that update in
    /// place return `pointer` itself.
    fn update(&self, pointer: &Pointer, payload: &[u8]) -> AllocResult<Pointer>;

    /// Release the range. Returns the bytes released, 0 if the pointer was
    /// already freed.
    fn free(&self, pointer: &Pointer) -> AllocResult<usize>;

    /// Metadata snapshot for a live pointer.
    fn info(&self, pointer: &Pointer) -> AllocResult<PointerInfo>;

    /// Snapshot every live pointer.
    fn live_pointers(&self) -> Vec<PointerInfo>;

    /// Free everything, invalidating every outstanding pointer.
    fn clear(&self);

    /// Bytes currently issued.
    fn used(&self) -> u64;

    /// Bytes this allocator can issue in total.
    fn capacity(&self) -> u64;

    /// Largest single request this allocator can ever satisfy.
    fn max_request(&self) -> usize;

    /// Usage and shortage counters.
    fn stats(&self) -> &RegionStats;
}

/// Reject zero-length and never-satisfiable requests.
#[inline]
pub(crate) fn check_request(size: usize, limit: usize) -> AllocResult<()> {
    if size == 0 {
        return Err(AllocError::EmptyPayload);
    }
    if size > limit {
        return Err(AllocError::OversizedRequest {
            requested: size,
            limit,
        });
    }
    Ok(())
}

/// One region's allocator, whichever strategy it uses.
pub enum RegionAllocator {
    /// First-fit, non-merging.
    Bump(BumpAllocator),
    /// Largest-fit, merging.
    Coalescing(CoalescingAllocator),
    /// Fixed-size slot pools.
    Slab(SlabAllocator),
}

macro_rules! dispatch {
    ($self:ident, $a:ident => $body:expr) => {
        match $self {
            RegionAllocator::Bump($a) => $body,
            RegionAllocator::Coalescing($a) => $body,
            RegionAllocator::Slab($a) => $body,
        }
    };
}

impl Allocator for RegionAllocator {
    fn buffer_id(&self) -> u32 {
        dispatch!(self, a => a.buffer_id())
    }

    fn kind(&self) -> AllocatorKind {
        dispatch!(self, a => a.kind())
    }

    fn store(&self, payload: &[u8], expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer> {
        dispatch!(self, a => a.store(payload, expiry, tag))
    }

    fn allocate(&self, size: usize, expiry: Expiry, tag: PayloadTag) -> AllocResult<Pointer> {
        dispatch!(self, a => a.allocate(size, expiry, tag))
    }

    fn retrieve(&self, pointer: &Pointer) -> AllocResult<Vec<u8>> {
        dispatch!(self, a => a.retrieve(pointer))
    }

    fn with_bytes(&self, pointer: &Pointer, f: &mut dyn FnMut(&[u8])) -> AllocResult<()> {
        dispatch!(self, a => a.with_bytes(pointer, f))
    }

    fn with_bytes_mut(
        &self,
        pointer: &Pointer,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> AllocResult<()> {
        dispatch!(self, a => a.with_bytes_mut(pointer, f))
    }

    fn update(&self, pointer: &Pointer, payload: &[u8]) -> AllocResult<Pointer> {
        dispatch!(self, a => a.update(pointer, payload))
    }

    fn free(&self, pointer: &Pointer) -> AllocResult<usize> {
        dispatch!(self, a => a.free(pointer))
    }

    fn info(&self, pointer: &Pointer) -> AllocResult<PointerInfo> {
        dispatch!(self, a => a.info(pointer))
    }

    fn live_pointers(&self) -> Vec<PointerInfo> {
        dispatch!(self, a => a.live_pointers())
    }

    fn clear(&self) {
        dispatch!(self, a => a.clear())
    }

    fn used(&self) -> u64 {
        dispatch!(self, a => a.used())
    }

    fn capacity(&self) -> u64 {
        dispatch!(self, a => a.capacity())
    }

    fn max_request(&self) -> usize {
        dispatch!(self, a => a.max_request())
    }

    fn stats(&self) -> &RegionStats {
        dispatch!(self, a => a.stats())
    }
}

impl From<BumpAllocator> for RegionAllocator {
    fn from(a: BumpAllocator) -> Self {
        RegionAllocator::Bump(a)
    }
}

impl From<CoalescingAllocator> for RegionAllocator {
    fn from(a: CoalescingAllocator) -> Self {
        RegionAllocator::Coalescing(a)
    }
}

impl From<SlabAllocator> for RegionAllocator {
    fn from(a: SlabAllocator) -> Self {
        RegionAllocator::Slab(a)
    }
}
