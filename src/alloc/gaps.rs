//! # Gap List Allocation
//!
//! The shared swap file holds tiles of every buffer in the process, and
//! buffers may use different tile sizes. Free space is therefore tracked as
//! arbitrary `[start, end)` byte ranges ("gaps") kept sorted by offset.
//!
//! ## Allocation
//!
//! First fit: the first gap at least as long as the request is used. An exact
//! match removes the gap, a longer one is shrunk from the front. If no gap is
//! large enough the file grows by `GROWTH_STEP_TILES` requests and the unused
//! tail of the growth becomes a new gap.
//!
//! ## Release
//!
//! A released range is merged with its neighbours, checked in this order:
//!
//! ```text
//! both:   [lower)[freed)[upper)  ->  [lower ........ upper)
//! upper:         [freed)[upper)  ->  [freed ........ upper)
//! lower:  [lower)[freed)         ->  [lower ........ freed)
//! none:          [freed)         ->  new gap inserted in order
//! ```
//!
//! so the list never holds two touching ranges. When every tile is released
//! the list is either empty (nothing was ever allocated) or a single gap
//! spanning the whole file.

use eyre::{bail, ensure, Result};

use crate::config::GROWTH_STEP_TILES;
use crate::error::TileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

impl Gap {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Result of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapGrant {
    pub offset: u64,
    /// New size of the file, if this allocation grew it.
    pub grow_to: Option<u64>,
}

#[derive(Debug, Default)]
pub struct GapAllocator {
    gaps: Vec<Gap>,
    total: u64,
    limit: Option<u64>,
}

impl GapAllocator {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            gaps: Vec::new(),
            total: 0,
            limit,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    pub fn free_bytes(&self) -> u64 {
        self.gaps.iter().map(Gap::len).sum()
    }

    pub fn allocate(&mut self, len: u64) -> Result<GapGrant> {
        ensure!(len > 0, "cannot allocate an empty range");

        if let Some(idx) = self.gaps.iter().position(|gap| gap.len() >= len) {
            let gap = &mut self.gaps[idx];
            let offset = gap.start;
            if gap.len() == len {
                self.gaps.remove(idx);
            } else {
                gap.start += len;
            }
            return Ok(GapGrant {
                offset,
                grow_to: None,
            });
        }

        let offset = self.total;
        let new_total = self.total + GROWTH_STEP_TILES * len;

        if let Some(limit) = self.limit {
            if offset + len > limit {
                bail!(TileError::AllocationExhausted {
                    requested: offset + len,
                    limit,
                });
            }
        }
        let new_total = match self.limit {
            Some(limit) => new_total.min(limit),
            None => new_total,
        };

        self.total = new_total;
        if offset + len < new_total {
            self.gaps.push(Gap {
                start: offset + len,
                end: new_total,
            });
        }

        Ok(GapGrant {
            offset,
            grow_to: Some(new_total),
        })
    }

    pub fn release(&mut self, start: u64, len: u64) {
        let end = start + len;
        debug_assert!(end <= self.total, "released range past end of file");

        let idx = self.gaps.partition_point(|gap| gap.start < start);
        let touches_lower = idx > 0 && self.gaps[idx - 1].end == start;
        let touches_upper = idx < self.gaps.len() && self.gaps[idx].start == end;

        debug_assert!(
            idx == 0 || self.gaps[idx - 1].end <= start,
            "released range overlaps a free gap"
        );
        debug_assert!(
            idx == self.gaps.len() || self.gaps[idx].start >= end,
            "released range overlaps a free gap"
        );

        match (touches_lower, touches_upper) {
            (true, true) => {
                let upper_end = self.gaps[idx].end;
                self.gaps[idx - 1].end = upper_end;
                self.gaps.remove(idx);
            }
            (false, true) => self.gaps[idx].start = start,
            (true, false) => self.gaps[idx - 1].end = end,
            (false, false) => self.gaps.insert(idx, Gap { start, end }),
        }
    }

    /// Verifies ordering, coalescing and that `free + live == total`.
    pub fn check(&self, live_bytes: u64) -> Result<()> {
        for pair in self.gaps.windows(2) {
            ensure!(
                pair[0].end < pair[1].start,
                "gaps {:?} and {:?} overlap or were not merged",
                pair[0],
                pair[1]
            );
        }
        for gap in &self.gaps {
            ensure!(!gap.is_empty(), "empty gap {:?} in list", gap);
            ensure!(gap.end <= self.total, "gap {:?} past end of file", gap);
        }
        ensure!(
            self.free_bytes() + live_bytes == self.total,
            "free {} + live {} != file size {}",
            self.free_bytes(),
            live_bytes,
            self.total
        );
        Ok(())
    }

    /// True when nothing is allocated.
    pub fn is_fully_free(&self) -> bool {
        match self.gaps.as_slice() {
            [] => self.total == 0,
            [only] => only.start == 0 && only.end == self.total,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TILE: u64 = 64;

    #[test]
    fn first_allocation_grows_file_and_leaves_tail_gap() {
        let mut alloc = GapAllocator::new(None);

        let grant = alloc.allocate(TILE).unwrap();

        assert_eq!(grant.offset, 0);
        assert_eq!(grant.grow_to, Some(32 * TILE));
        assert_eq!(
            alloc.gaps(),
            &[Gap {
                start: TILE,
                end: 32 * TILE
            }]
        );
        alloc.check(TILE).unwrap();
    }

    #[test]
    fn exact_fit_removes_gap() {
        let mut alloc = GapAllocator::new(None);
        let a = alloc.allocate(TILE).unwrap().offset;
        let _b = alloc.allocate(TILE).unwrap().offset;
        alloc.release(a, TILE);

        let again = alloc.allocate(TILE).unwrap();

        assert_eq!(again.offset, a);
        assert_eq!(alloc.gaps().len(), 1);
        alloc.check(2 * TILE).unwrap();
    }

    #[test]
    fn release_merges_with_both_neighbours() {
        let mut alloc = GapAllocator::new(None);
        let offsets: Vec<u64> = (0..4).map(|_| alloc.allocate(TILE).unwrap().offset).collect();

        alloc.release(offsets[0], TILE);
        alloc.release(offsets[2], TILE);
        assert_eq!(alloc.gaps().len(), 3);

        alloc.release(offsets[1], TILE);

        assert_eq!(alloc.gaps().len(), 2);
        assert_eq!(alloc.gaps()[0], Gap { start: 0, end: 3 * TILE });
        alloc.check(TILE).unwrap();
    }

    #[test]
    fn release_merges_with_upper_only() {
        let mut alloc = GapAllocator::new(None);
        let a = alloc.allocate(TILE).unwrap().offset;
        let b = alloc.allocate(TILE).unwrap().offset;

        alloc.release(b, TILE);

        assert_eq!(alloc.gaps()[0].start, b);
        assert_eq!(alloc.gaps().len(), 1);
        alloc.check(TILE).unwrap();
        assert_eq!(a, 0);
    }

    #[test]
    fn release_merges_with_lower_only() {
        let mut alloc = GapAllocator::new(None);
        let a = alloc.allocate(TILE).unwrap().offset;
        let b = alloc.allocate(TILE).unwrap().offset;
        let _c = alloc.allocate(TILE).unwrap().offset;

        alloc.release(a, TILE);
        alloc.release(b, TILE);

        assert_eq!(alloc.gaps()[0], Gap { start: 0, end: 2 * TILE });
        assert_eq!(alloc.gaps().len(), 2);
        alloc.check(TILE).unwrap();
    }

    #[test]
    fn releasing_everything_leaves_one_gap() {
        let mut alloc = GapAllocator::new(None);
        let offsets: Vec<u64> = (0..40).map(|_| alloc.allocate(TILE).unwrap().offset).collect();

        for offset in offsets.iter().step_by(2).rev() {
            alloc.release(*offset, TILE);
        }
        alloc.check(20 * TILE).unwrap();
        for offset in offsets.iter().skip(1).step_by(2) {
            alloc.release(*offset, TILE);
        }

        assert!(alloc.is_fully_free());
        alloc.check(0).unwrap();
    }

    #[test]
    fn mixed_sizes_keep_accounting_exact() {
        let mut alloc = GapAllocator::new(None);
        let small = alloc.allocate(16).unwrap().offset;
        let big = alloc.allocate(256).unwrap().offset;
        let small2 = alloc.allocate(16).unwrap().offset;

        alloc.check(16 + 256 + 16).unwrap();
        alloc.release(big, 256);
        alloc.check(32).unwrap();
        alloc.release(small, 16);
        alloc.release(small2, 16);

        alloc.check(0).unwrap();
        assert!(alloc.is_fully_free());
    }

    #[test]
    fn limit_is_enforced() {
        let mut alloc = GapAllocator::new(Some(2 * TILE));
        alloc.allocate(TILE).unwrap();
        alloc.allocate(TILE).unwrap();

        let err = alloc.allocate(TILE).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<TileError>(),
            Some(TileError::AllocationExhausted { .. })
        ));
    }

    #[test]
    fn empty_allocator_is_fully_free() {
        let alloc = GapAllocator::new(None);

        assert!(alloc.is_fully_free());
        alloc.check(0).unwrap();
    }
}
