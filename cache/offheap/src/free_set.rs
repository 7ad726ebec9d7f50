//! Free-range index for the coalescing allocator.
//!
//! Two ordered views over the same set of free ranges:
//!
//! ```text
//!   by_size   : (Reverse(capacity), start)   largest first, for fit search
//!   by_offset : start -> end                 address order, for neighbor merge
//! ```
//!
//! All mutation goes through `insert`/`remove`, which always touch both views.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AllocError, AllocResult};

#[inline]
fn capacity(start: u32, end: u32) -> u64 {
    (end - start) as u64 + 1
}

/// Free ranges of one region, indexed by size and by offset.
#[derive(Debug, Default)]
pub(crate) struct FreeSet {
    by_size: BTreeSet<(Reverse<u64>, u32)>,
    by_offset: BTreeMap<u32, u32>,
    free_bytes: u64,
}

impl FreeSet {
    /// A set holding one range covering `[0, size)`.
    pub(crate) fn spanning(size: usize) -> Self {
        let mut set = Self::default();
        if size > 0 {
            set.insert(0, (size - 1) as u32);
        }
        set
    }

    fn insert(&mut self, start: u32, end: u32) {
        self.by_size.insert((Reverse(capacity(start, end)), start));
        self.by_offset.insert(start, end);
        self.free_bytes += capacity(start, end);
    }

    fn remove(&mut self, start: u32) -> Option<u32> {
        let end = self.by_offset.remove(&start)?;
        self.by_size.remove(&(Reverse(capacity(start, end)), start));
        self.free_bytes -= capacity(start, end);
        Some(end)
    }

    /// Total free bytes.
    #[inline]
    pub(crate) fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// The largest free range as `(start, end)`.
    #[inline]
    pub(crate) fn largest(&self) -> Option<(u32, u32)> {
        self.by_size
            .first()
            .and_then(|&(_, start)| self.by_offset.get(&start).map(|&end| (start, end)))
    }

    /// Free ranges in address order.
    pub(crate) fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_offset.iter().map(|(&s, &e)| (s, e))
    }

    /// Carve `size` bytes off the front of the largest free range.
    ///
    /// Only the largest range is considered: if it is too small nothing is.
    pub(crate) fn take(&mut self, size: usize) -> Option<(u32, u32)> {
        let (start, end) = self.largest()?;
        if capacity(start, end) < size as u64 {
            return None;
        }
        self.remove(start);
        let issued_end = start + (size as u32 - 1);
        if issued_end < end {
            self.insert(issued_end + 1, end);
        }
        Some((start, issued_end))
    }

    /// Return `[start, end]` to the set, merging with free neighbors.
    ///
    /// Returns the merged range. Releasing a range that overlaps a free one
    /// is an invariant violation and leaves the set untouched.
    pub(crate) fn release(&mut self, start: u32, end: u32) -> AllocResult<(u32, u32)> {
        if let Some((&ls, &le)) = self.by_offset.range(..=end).next_back() {
            if le >= start {
                return Err(AllocError::InvariantViolation(format!(
                    "released range [{start}, {end}] overlaps free range [{ls}, {le}]"
                )));
            }
        }

        let mut merged_start = start;
        let mut merged_end = end;

        // Left neighbor ends right before us.
        if let Some((&ls, &le)) = self.by_offset.range(..start).next_back() {
            if le.checked_add(1) == Some(start) {
                self.remove(ls);
                merged_start = ls;
            }
        }

        // Right neighbor starts right after us.
        if let Some(rs) = end.checked_add(1) {
            if let Some(re) = self.remove(rs) {
                merged_end = re;
            }
        }

        self.insert(merged_start, merged_end);
        Ok((merged_start, merged_end))
    }

    /// Drop everything and cover `[0, size)` again.
    pub(crate) fn reset(&mut self, size: usize) {
        *self = Self::spanning(size);
    }

    /// Verify both views agree and that no two ranges overlap or touch.
    pub(crate) fn check(&self) -> AllocResult<()> {
        if self.by_size.len() != self.ranges().count() {
            return Err(AllocError::InvariantViolation(format!(
                "free index sizes differ: {} by size, {} by offset",
                self.by_size.len(),
                self.ranges().count()
            )));
        }

        for &(Reverse(cap), start) in &self.by_size {
            match self.by_offset.get(&start) {
                Some(&end) if capacity(start, end) == cap => {}
                _ => {
                    return Err(AllocError::InvariantViolation(format!(
                        "free range at {start} of {cap} bytes missing from offset index"
                    )));
                }
            }
        }

        let mut total = 0u64;
        let mut prev: Option<u32> = None;
        for (&start, &end) in &self.by_offset {
            if end < start {
                return Err(AllocError::InvariantViolation(format!(
                    "free range [{start}, {end}] is inverted"
                )));
            }
            if let Some(prev_end) = prev {
                if prev_end as u64 + 1 >= start as u64 {
                    return Err(AllocError::InvariantViolation(format!(
                        "free range at {start} overlaps or touches range ending at {prev_end}"
                    )));
                }
            }
            total += capacity(start, end);
            prev = Some(end);
        }

        if total != self.free_bytes {
            return Err(AllocError::InvariantViolation(format!(
                "free byte count {} does not match ranges total {total}",
                self.free_bytes
            )));
        }

        Ok(())
    }
}
