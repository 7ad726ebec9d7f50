//! Region selection policies.
//!
//! The manager asks its policy which region to try for a placement. On an
//! exhaustion failure it asks again, passing the region that just failed and
//! the attempt number, until the policy answers `None`.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Attempts per call for [`RoundRobinPolicy`] unless configured otherwise.
pub const DEFAULT_MAX_ALLOCATIONS: usize = 2;

/// Chooses which region to try next.
pub trait AllocationPolicy: Send + Sync {
    /// Region index to try for attempt number `attempt` (starting at 1),
    /// given the region that failed the previous attempt, or `None` to give
    /// up. Returned indexes are below `regions`.
    fn next(&self, previous: Option<usize>, attempt: usize, regions: usize) -> Option<usize>;

    /// Forget any cursor state.
    fn reset(&self);
}

/// Sticky fallback: keep placing in the active region until it fails, then
/// make the next region active.
///
/// Each region is tried at most once per call.
#[derive(Debug, Default)]
pub struct SequentialPolicy {
    active: AtomicUsize,
}

impl SequentialPolicy {
    /// Start with region 0 active.
    pub fn new() -> Self {
        Self::default()
    }

    /// The region new placements start from.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

impl AllocationPolicy for SequentialPolicy {
    fn next(&self, previous: Option<usize>, attempt: usize, regions: usize) -> Option<usize> {
        if regions == 0 || attempt > regions {
            return None;
        }
        match previous {
            None => Some(self.active.load(Ordering::Relaxed) % regions),
            Some(failed) => {
                let next = (failed + 1) % regions;
                // Only advance if nobody else already has.
                let _ = self.active.compare_exchange(
                    failed,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                Some(next)
            }
        }
    }

    fn reset(&self) {
        self.active.store(0, Ordering::Relaxed);
    }
}

/// Cyclic: every attempt takes the next region from a shared cursor,
/// whether or not the previous placement succeeded.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
    max_allocations: usize,
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ALLOCATIONS)
    }
}

impl RoundRobinPolicy {
    /// Give up after `max_allocations` attempts per call.
    pub fn new(max_allocations: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            max_allocations,
        }
    }

    /// Attempts per call.
    pub fn max_allocations(&self) -> usize {
        self.max_allocations
    }
}

impl AllocationPolicy for RoundRobinPolicy {
    fn next(&self, _previous: Option<usize>, attempt: usize, regions: usize) -> Option<usize> {
        if regions == 0 || attempt > self.max_allocations {
            return None;
        }
        Some(self.cursor.fetch_add(1, Ordering::Relaxed) % regions)
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}
