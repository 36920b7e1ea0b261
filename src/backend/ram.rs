//! In-memory backend.
//!
//! Tiles live in heap buffers keyed by [`TileKey`]. Buffers released by `void`
//! go on a spare list and are reused by the next new tile instead of being
//! reallocated. There is no writer thread and `flush` does nothing.

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::{check_tile_size, TileBackend};
use crate::alloc::{AllocSnapshot, AllocStats};
use crate::tile::{Rect, Tile, TileKey, TileLayout};

struct RamEntry {
    data: Box<[u8]>,
    revision: u32,
}

#[derive(Default)]
struct RamState {
    entries: HashMap<TileKey, RamEntry>,
    spare: Vec<Box<[u8]>>,
    extent: Rect,
}

pub struct RamBackend {
    layout: TileLayout,
    state: RwLock<RamState>,
    stats: AllocStats,
}

impl RamBackend {
    pub fn new(layout: TileLayout) -> Self {
        Self {
            layout,
            state: RwLock::new(RamState::default()),
            stats: AllocStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TileBackend for RamBackend {
    fn layout(&self) -> &TileLayout {
        &self.layout
    }

    fn get(&self, key: TileKey) -> Result<Option<Tile>> {
        let state = self.state.read();
        Ok(state
            .entries
            .get(&key)
            .map(|entry| Tile::loaded(entry.data.clone(), entry.revision)))
    }

    fn set(&self, key: TileKey, tile: &Tile) -> Result<()> {
        check_tile_size(&self.layout, tile)?;
        let mut state = self.state.write();
        let state = &mut *state;

        match state.entries.get_mut(&key) {
            Some(entry) => {
                entry.data.copy_from_slice(tile.data());
                entry.revision = tile.revision();
            }
            None => {
                let data = match state.spare.pop() {
                    Some(mut buf) => {
                        buf.copy_from_slice(tile.data());
                        buf
                    }
                    None => tile.data().into(),
                };
                self.stats.record_alloc(data.len() as u64);
                state.entries.insert(
                    key,
                    RamEntry {
                        data,
                        revision: tile.revision(),
                    },
                );
            }
        }
        Ok(())
    }

    fn void(&self, key: TileKey) -> Result<()> {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.remove(&key) {
            trace!(x = key.x, y = key.y, z = key.z, "voided ram tile");
            self.stats.record_free(entry.data.len() as u64);
            state.spare.push(entry.data);
        }
        Ok(())
    }

    fn exist(&self, key: TileKey) -> Result<bool> {
        Ok(self.state.read().entries.contains_key(&key))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> AllocSnapshot {
        self.stats.snapshot()
    }

    fn extent(&self) -> Option<Rect> {
        Some(self.state.read().extent)
    }

    fn set_extent(&self, extent: Rect) {
        self.state.write().extent = extent;
    }
}
