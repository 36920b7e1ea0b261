//! # Tile Slot Allocation
//!
//! File-backed buffers store every tile in a slot of exactly one tile size.
//! The allocator hands out slots from two sources:
//!
//! 1. A LIFO list of slots released by `void`
//! 2. A bump pointer (`next_pre_alloc`) into space that has been reserved at
//!    the end of the file but not used yet
//!
//! ## Growth
//!
//! When the bump pointer reaches the reserved size (`total`), the reservation
//! grows by `GROWTH_STEP_TILES` slots and the allocation reports the new size
//! so the caller can queue a resize of the backing file. The reservation
//! always stays ahead of the bump pointer, so the next allocation has room.
//!
//! ```text
//! 0        256                         next_pre_alloc         total
//! +--------+----+----+----+----+-------+-----------------------+
//! | header | t0 | t1 |free| t3 |  ...  |   reserved, unused    |
//! +--------+----+----+----+----+-------+-----------------------+
//! ```
//!
//! ## Reload
//!
//! After the on-disk index is re-read, the allocator is reset to the highest
//! slot end seen and the free list is dropped. Another process may have
//! compacted the file, so nothing below the high-water mark is assumed free.
//!
//! ## Thread Safety
//!
//! Not thread-safe on its own; the owning backend keeps it under its state
//! lock.

use eyre::{bail, Result};

use crate::config::GROWTH_STEP_TILES;
use crate::error::TileError;

/// Result of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    pub offset: u64,
    /// New reserved size of the file, if this allocation grew it.
    pub grow_to: Option<u64>,
}

#[derive(Debug)]
pub struct SlotAllocator {
    slot_size: u64,
    reserved_prefix: u64,
    free: Vec<u64>,
    next_pre_alloc: u64,
    total: u64,
    limit: Option<u64>,
}

impl SlotAllocator {
    /// `reserved_prefix` bytes at the start of the file are never handed out.
    pub fn new(slot_size: u64, reserved_prefix: u64, limit: Option<u64>) -> Self {
        Self {
            slot_size,
            reserved_prefix,
            free: Vec::new(),
            next_pre_alloc: reserved_prefix,
            total: reserved_prefix,
            limit,
        }
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn next_pre_alloc(&self) -> u64 {
        self.next_pre_alloc
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocate(&mut self) -> Result<SlotGrant> {
        if let Some(offset) = self.free.pop() {
            return Ok(SlotGrant {
                offset,
                grow_to: None,
            });
        }

        let offset = self.next_pre_alloc;
        let next = offset + self.slot_size;

        if let Some(limit) = self.limit {
            if next > limit {
                bail!(TileError::AllocationExhausted {
                    requested: next,
                    limit,
                });
            }
        }

        self.next_pre_alloc = next;

        let mut grow_to = None;
        if self.next_pre_alloc >= self.total {
            let mut new_total = self.total + GROWTH_STEP_TILES * self.slot_size;
            if let Some(limit) = self.limit {
                new_total = new_total.min(limit).max(self.next_pre_alloc);
            }
            if new_total > self.total {
                self.total = new_total;
                grow_to = Some(new_total);
            }
        }

        Ok(SlotGrant { offset, grow_to })
    }

    pub fn release(&mut self, offset: u64) {
        debug_assert!(offset >= self.reserved_prefix, "released the file header");
        debug_assert!(
            !self.free.contains(&offset),
            "slot {} released twice",
            offset
        );
        self.free.push(offset);
    }

    /// Makes sure `len` bytes past the bump pointer are reserved (for the
    /// index chain written on flush). Returns the new size if it grew.
    pub fn reserve_tail(&mut self, len: u64) -> Option<u64> {
        let needed = self.next_pre_alloc + len;
        if needed > self.total {
            self.total = needed;
            Some(needed)
        } else {
            None
        }
    }

    /// Restarts allocation after the index was reloaded from disk.
    pub fn reset_to(&mut self, high_water: u64) {
        let high_water = high_water.max(self.reserved_prefix);
        self.free.clear();
        self.next_pre_alloc = high_water;
        self.total = high_water;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOT: u64 = 100;
    const PREFIX: u64 = 256;

    #[test]
    fn first_allocation_reserves_a_growth_step() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, None);

        let grant = alloc.allocate().unwrap();

        assert_eq!(grant.offset, PREFIX);
        assert_eq!(grant.grow_to, Some(PREFIX + GROWTH_STEP_TILES * SLOT));
        assert_eq!(alloc.next_pre_alloc(), PREFIX + SLOT);
    }

    #[test]
    fn grows_again_when_reservation_is_used_up() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, None);
        let mut growths = Vec::new();

        for _ in 0..40 {
            if let Some(size) = alloc.allocate().unwrap().grow_to {
                growths.push(size);
            }
        }

        assert_eq!(
            growths,
            vec![PREFIX + 32 * SLOT, PREFIX + 64 * SLOT],
            "40 slots need two growth steps"
        );
    }

    #[test]
    fn released_slots_are_reused_lifo() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, None);
        let a = alloc.allocate().unwrap().offset;
        let b = alloc.allocate().unwrap().offset;

        alloc.release(a);
        alloc.release(b);

        assert_eq!(alloc.free_count(), 2);
        assert_eq!(alloc.allocate().unwrap().offset, b);
        assert_eq!(alloc.allocate().unwrap().offset, a);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn limit_is_enforced() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, Some(PREFIX + 2 * SLOT));

        alloc.allocate().unwrap();
        alloc.allocate().unwrap();
        let err = alloc.allocate().unwrap_err();

        assert!(matches!(
            err.downcast_ref::<TileError>(),
            Some(TileError::AllocationExhausted { .. })
        ));
        assert_eq!(alloc.next_pre_alloc(), PREFIX + 2 * SLOT);
    }

    #[test]
    fn reset_drops_free_list() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, None);
        let a = alloc.allocate().unwrap().offset;
        alloc.release(a);

        alloc.reset_to(PREFIX + 5 * SLOT);

        assert_eq!(alloc.free_count(), 0);
        assert_eq!(alloc.next_pre_alloc(), PREFIX + 5 * SLOT);
        assert_eq!(alloc.total(), PREFIX + 5 * SLOT);
    }

    #[test]
    fn reset_never_goes_below_prefix() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, None);

        alloc.reset_to(0);

        assert_eq!(alloc.next_pre_alloc(), PREFIX);
    }

    #[test]
    fn reserve_tail_extends_total_only_when_needed() {
        let mut alloc = SlotAllocator::new(SLOT, PREFIX, None);
        alloc.allocate().unwrap();

        assert_eq!(alloc.reserve_tail(SLOT), None);
        let needed = alloc.total() - alloc.next_pre_alloc() + 1;
        let grown = alloc.reserve_tail(needed).unwrap();
        assert_eq!(grown, alloc.next_pre_alloc() + needed);
    }
}
