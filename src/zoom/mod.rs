//! # Mipmap Pyramid
//!
//! [`ZoomCache`] wraps a backend and derives level `z > 0` tiles on demand
//! from the four level `z - 1` tiles beneath them:
//!
//! ```text
//!  z=1   ┌───────┬───────┐
//!        │  TL   │  TR   │     (x, y, 1) is built from
//!        ├───────┼───────┤       (2x, 2y, 0)   (2x+1, 2y, 0)
//!        │  BL   │  BR   │       (2x, 2y+1, 0) (2x+1, 2y+1, 0)
//!        └───────┴───────┘
//! ```
//!
//! Derived tiles are written back into the wrapped backend, so a later `get`
//! is a plain lookup. Changing a tile does not evict its ancestors; it sets a
//! dirty bit for the quadrant it covers in each cached ancestor, and the next
//! `get` of an ancestor recomputes only its dirty quadrants.
//!
//! ## Fetch rules for one level `z` tile
//!
//! | cached tile | dirty bits | quadrants fetched from `z - 1` |
//! |-------------|------------|--------------------------------|
//! | absent      | any        | all four                       |
//! | present     | none       | none, returned as is           |
//! | present     | some       | the dirty ones                 |
//!
//! A fetched child that does not exist zeroes its quadrant. When no fetched
//! child exists and nothing of the old tile survives, the result is "not
//! found" and the caller substitutes its shared empty tile. A cached tile
//! whose refetched quadrants all turned out missing keeps its clean
//! quadrants and is returned with the others zeroed.
//!
//! Dirty bits are only tracked up to `max_level`; levels above it are
//! reported as not found rather than served stale.

mod downscale;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::alloc::AllocSnapshot;
use crate::backend::TileBackend;
use crate::config::MAX_ZOOM_LEVEL;
use crate::tile::{Quadrant, Rect, Tile, TileKey, TileLayout};

const ALL_QUADRANTS: u8 = 0b1111;

pub struct ZoomCache<B> {
    inner: B,
    dirty: Mutex<HashMap<TileKey, u8>>,
    max_level: i32,
}

impl<B: TileBackend> ZoomCache<B> {
    pub fn new(inner: B) -> Self {
        Self::with_max_level(inner, MAX_ZOOM_LEVEL)
    }

    pub fn with_max_level(inner: B, max_level: i32) -> Self {
        Self {
            inner,
            dirty: Mutex::new(HashMap::new()),
            max_level,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    /// Dirty quadrant bits of `key` (TL=1, TR=2, BL=4, BR=8).
    pub fn dirty_quadrants(&self, key: TileKey) -> u8 {
        self.dirty.lock().get(&key).copied().unwrap_or(0)
    }

    /// Flags the quadrant covering `key` dirty in every cached ancestor.
    ///
    /// Stops at the first ancestor that is not cached; anything above it was
    /// derived through it and will be rebuilt from scratch.
    pub fn invalidate(&self, key: TileKey) -> Result<()> {
        let mut child = key;
        while child.z < self.max_level {
            let Some(parent) = child.parent() else {
                break;
            };
            if !self.inner.exist(parent)? {
                break;
            }
            *self.dirty.lock().entry(parent).or_insert(0) |= child.quadrant_in_parent().bit();
            child = parent;
        }
        Ok(())
    }

    fn build(&self, key: TileKey, cached: Option<Tile>, dirty: u8) -> Result<Option<Tile>> {
        let fetch = if cached.is_some() { dirty } else { ALL_QUADRANTS };

        let mut children: [Option<Tile>; 4] = Default::default();
        for (slot, quadrant) in children.iter_mut().zip(Quadrant::ALL) {
            if fetch & quadrant.bit() != 0 {
                let (i, j) = quadrant.offsets();
                if let Some(child) = key.child(i, j) {
                    *slot = self.get(child)?;
                }
            }
        }

        let found = children.iter().any(Option::is_some);
        if !found && fetch == ALL_QUADRANTS {
            if cached.is_some() {
                self.inner.void(key)?;
            }
            self.clear_dirty(key, fetch);
            return Ok(None);
        }

        let layout = self.inner.layout();
        let mut tile = cached.unwrap_or_else(|| Tile::zeroed(layout.tile_size()));
        let dst = tile.data_mut();
        for (child, quadrant) in children.iter().zip(Quadrant::ALL) {
            if fetch & quadrant.bit() == 0 {
                continue;
            }
            match child {
                Some(src) => downscale::downscale_into(layout, src.data(), dst, quadrant),
                None => downscale::blank(layout, dst, quadrant),
            }
        }

        trace!(x = key.x, y = key.y, z = key.z, quadrants = fetch, "rebuilt mip tile");
        self.inner.store(key, &mut tile)?;
        self.clear_dirty(key, fetch);
        Ok(Some(tile))
    }

    fn clear_dirty(&self, key: TileKey, bits: u8) {
        let mut dirty = self.dirty.lock();
        if let Some(flags) = dirty.get_mut(&key) {
            *flags &= !bits;
            if *flags == 0 {
                dirty.remove(&key);
            }
        }
    }
}

impl<B: TileBackend> TileBackend for ZoomCache<B> {
    fn layout(&self) -> &TileLayout {
        self.inner.layout()
    }

    fn get(&self, key: TileKey) -> Result<Option<Tile>> {
        if key.z > self.max_level {
            return Ok(None);
        }
        let cached = self.inner.get(key)?;
        if key.z <= 0 {
            return Ok(cached);
        }

        let dirty = self.dirty_quadrants(key);
        if cached.is_some() && dirty == 0 {
            return Ok(cached);
        }
        self.build(key, cached, dirty)
    }

    fn set(&self, key: TileKey, tile: &Tile) -> Result<()> {
        self.inner.set(key, tile)?;
        self.dirty.lock().remove(&key);
        self.invalidate(key)
    }

    fn void(&self, key: TileKey) -> Result<()> {
        self.inner.void(key)?;
        self.dirty.lock().remove(&key);
        self.invalidate(key)
    }

    fn exist(&self, key: TileKey) -> Result<bool> {
        self.inner.exist(key)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn idle(&self) -> Result<()> {
        self.inner.idle()
    }

    fn stats(&self) -> AllocSnapshot {
        self.inner.stats()
    }

    fn extent(&self) -> Option<Rect> {
        self.inner.extent()
    }

    fn set_extent(&self, extent: Rect) {
        self.inner.set_extent(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RamBackend;
    use crate::tile::PixelFormat;

    fn float_cache() -> ZoomCache<RamBackend> {
        let layout = TileLayout::new(4, 4, PixelFormat::rgba_float()).unwrap();
        ZoomCache::new(RamBackend::new(layout))
    }

    fn solid_float(value: f32) -> Tile {
        let data: Vec<u8> = std::iter::repeat(value.to_ne_bytes())
            .take(4 * 4 * 4)
            .flatten()
            .collect();
        Tile::from_data(data, 1)
    }

    fn pixel(tile: &Tile, x: usize, y: usize, c: usize) -> f32 {
        let at = (y * 4 + x) * 16 + c * 4;
        f32::from_ne_bytes(tile.data()[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn no_sources_is_not_found() {
        let cache = float_cache();

        assert!(cache.get(TileKey::new(0, 0, 1)).unwrap().is_none());
        assert!(cache.get(TileKey::new(3, -2, 4)).unwrap().is_none());
    }

    #[test]
    fn level_one_is_the_box_average_of_level_zero() {
        let cache = float_cache();
        let values = [0.0f32, 1.0, 0.25, 0.75];
        for (quadrant, value) in Quadrant::ALL.iter().zip(values) {
            let (i, j) = quadrant.offsets();
            cache.set(TileKey::new(i as i32, j as i32, 0), &solid_float(value)).unwrap();
        }

        let tile = cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();

        for (quadrant, value) in Quadrant::ALL.iter().zip(values) {
            let (i, j) = quadrant.offsets();
            for c in 0..4 {
                let got = pixel(&tile, i * 2 + 1, j * 2, c);
                assert!((got - value).abs() < 1e-6, "{:?} got {}", quadrant, got);
            }
        }
        assert!(cache.exist(TileKey::new(0, 0, 1)).unwrap());
    }

    #[test]
    fn missing_child_zeroes_its_quadrant() {
        let cache = float_cache();
        cache.set(TileKey::new(0, 0, 0), &solid_float(1.0)).unwrap();

        let tile = cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();

        assert_eq!(pixel(&tile, 0, 0, 0), 1.0);
        assert_eq!(pixel(&tile, 3, 3, 0), 0.0);
    }

    #[test]
    fn changing_a_child_dirties_only_its_quadrant() {
        let cache = float_cache();
        for (i, j) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            cache.set(TileKey::new(i, j, 0), &solid_float(1.0)).unwrap();
        }
        cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();

        cache.set(TileKey::new(1, 1, 0), &solid_float(0.5)).unwrap();
        assert_eq!(cache.dirty_quadrants(TileKey::new(0, 0, 1)), Quadrant::BottomRight.bit());

        let tile = cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();
        assert_eq!(pixel(&tile, 0, 0, 0), 1.0);
        assert_eq!(pixel(&tile, 3, 3, 0), 0.5);
        assert_eq!(cache.dirty_quadrants(TileKey::new(0, 0, 1)), 0);
    }

    #[test]
    fn void_marks_parent_dirty_instead_of_evicting() {
        let cache = float_cache();
        cache.set(TileKey::new(0, 0, 0), &solid_float(1.0)).unwrap();
        cache.set(TileKey::new(1, 0, 0), &solid_float(1.0)).unwrap();
        cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();

        cache.void(TileKey::new(1, 0, 0)).unwrap();

        assert!(cache.exist(TileKey::new(0, 0, 1)).unwrap());
        let tile = cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();
        assert_eq!(pixel(&tile, 0, 0, 0), 1.0);
        assert_eq!(pixel(&tile, 2, 0, 0), 0.0);
    }

    #[test]
    fn levels_above_the_ceiling_are_not_found() {
        let layout = TileLayout::new(4, 4, PixelFormat::rgba_float()).unwrap();
        let cache = ZoomCache::with_max_level(RamBackend::new(layout), 1);
        cache.set(TileKey::new(0, 0, 0), &solid_float(1.0)).unwrap();

        assert!(cache.get(TileKey::new(0, 0, 2)).unwrap().is_none());
        assert!(!cache.exist(TileKey::new(0, 0, 2)).unwrap());
        let top = cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();
        assert_eq!(pixel(&top, 0, 0, 0), 1.0);

        cache.set(TileKey::new(0, 0, 0), &solid_float(0.0)).unwrap();

        assert_eq!(cache.dirty_quadrants(TileKey::new(0, 0, 1)), Quadrant::TopLeft.bit());
        let top = cache.get(TileKey::new(0, 0, 1)).unwrap().unwrap();
        assert_eq!(pixel(&top, 0, 0, 0), 0.0);
        assert!(cache.get(TileKey::new(0, 0, 2)).unwrap().is_none());
    }

    #[test]
    fn far_away_tiles_are_not_found() {
        let cache = float_cache();

        assert!(cache.get(TileKey::new(1 << 30, 0, 1)).unwrap().is_none());
        assert!(cache.get(TileKey::new(0, -(1 << 30) - 1, 3)).unwrap().is_none());

        let edge = TileKey::new(i32::MAX, i32::MIN, 0);
        cache.set(edge, &solid_float(1.0)).unwrap();
        let parent = TileKey::new(i32::MAX / 2, i32::MIN / 2, 1);
        let tile = cache.get(parent).unwrap().unwrap();
        assert_eq!(pixel(&tile, 2, 0, 0), 1.0);
        assert_eq!(pixel(&tile, 0, 0, 0), 0.0);
    }

    #[test]
    fn levels_build_recursively() {
        let cache = float_cache();
        cache.set(TileKey::new(0, 0, 0), &solid_float(0.8)).unwrap();

        let tile = cache.get(TileKey::new(0, 0, 2)).unwrap().unwrap();

        assert!((pixel(&tile, 0, 0, 0) - 0.8).abs() < 1e-6);
        assert_eq!(pixel(&tile, 1, 0, 0), 0.0);
        assert!(cache.exist(TileKey::new(0, 0, 1)).unwrap());

        cache.set(TileKey::new(0, 0, 0), &solid_float(0.4)).unwrap();
        assert_ne!(cache.dirty_quadrants(TileKey::new(0, 0, 2)), 0);
        let tile = cache.get(TileKey::new(0, 0, 2)).unwrap().unwrap();
        assert!((pixel(&tile, 0, 0, 0) - 0.4).abs() < 1e-6);
    }
}
