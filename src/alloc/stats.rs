//! Live and peak allocation counters.
//!
//! Counters are atomics so `stats()` can be read without taking the owning
//! backend's lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AllocStats {
    tiles: AtomicU64,
    bytes: AtomicU64,
    peak_tiles: AtomicU64,
    peak_bytes: AtomicU64,
}

/// Point-in-time copy of [`AllocStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocSnapshot {
    pub tiles: u64,
    pub bytes: u64,
    pub peak_tiles: u64,
    pub peak_bytes: u64,
}

impl AllocStats {
    pub fn record_alloc(&self, size: u64) {
        let tiles = self.tiles.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = self.bytes.fetch_add(size, Ordering::Relaxed) + size;
        Self::raise(&self.peak_tiles, tiles);
        Self::raise(&self.peak_bytes, bytes);
    }

    pub fn record_free(&self, size: u64) {
        self.tiles.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size, Ordering::Relaxed);
    }

    /// Forgets live counts, keeping peaks (used after an index reload).
    pub fn reset_live(&self, tiles: u64, bytes: u64) {
        self.tiles.store(tiles, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        Self::raise(&self.peak_tiles, tiles);
        Self::raise(&self.peak_bytes, bytes);
    }

    pub fn snapshot(&self) -> AllocSnapshot {
        AllocSnapshot {
            tiles: self.tiles.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            peak_tiles: self.peak_tiles.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }

    fn raise(peak: &AtomicU64, value: u64) {
        let mut current = peak.load(Ordering::Relaxed);
        while value > current {
            match peak.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => current = x,
            }
        }
    }
}
