//! # Tile Backends
//!
//! A backend owns the index from [`TileKey`] to stored pixels and answers the
//! tile command protocol:
//!
//! ```text
//! GET(x,y,z)   -> tile | not found     freshly allocated copy, caller owns it
//! SET(x,y,z,t) -> ()                   allocates on first use, async on disk
//! VOID(x,y,z)  -> ()                   drops entry, cancels queued write
//! EXIST(x,y,z) -> bool
//! FLUSH()      -> ()                   persist index + fsync (disk only)
//! IDLE()       -> ()                   hook, does nothing today
//! ```
//!
//! ## Variants
//!
//! | Backend                 | Storage                         | Writer thread |
//! |-------------------------|---------------------------------|---------------|
//! | [`RamBackend`]          | heap buffers in a hash map      | no            |
//! | [`FileBackend`]         | `pread`/`pwrite` on a file      | yes           |
//! | [`MappedBackend`]       | memory-mapped file              | growth + queued writes |
//! | [`SwapBackend`]         | process-wide shared swap file   | yes           |
//!
//! `FileBackend` and `MappedBackend` are the same [`DiskBackend`] over a
//! different [`Store`]; they share the on-disk format. All pipeline backends
//! share the queued read/write path in `queued`.

mod disk;
mod queued;
mod ram;
mod store;
mod swap;

pub use disk::{ChangeListener, DiskBackend, FileBackend, MappedBackend};
pub use ram::RamBackend;
pub use store::{FileStore, MappedStore, Store};
pub use swap::{SwapBackend, SwapFile};

use eyre::Result;

use crate::alloc::AllocSnapshot;
use crate::tile::{Rect, Tile, TileKey, TileLayout};

pub trait TileBackend: Send + Sync {
    fn layout(&self) -> &TileLayout;

    fn get(&self, key: TileKey) -> Result<Option<Tile>>;

    /// Stores `tile` under `key`, recording its revision.
    fn set(&self, key: TileKey, tile: &Tile) -> Result<()>;

    fn void(&self, key: TileKey) -> Result<()>;

    fn exist(&self, key: TileKey) -> Result<bool>;

    fn flush(&self) -> Result<()>;

    fn idle(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> AllocSnapshot;

    /// Bounding box of the buffer, if this backend records one.
    fn extent(&self) -> Option<Rect> {
        None
    }

    fn set_extent(&self, _extent: Rect) {}

    /// Sets `tile` only if it changed since it was last stored.
    ///
    /// Returns whether a write was issued.
    fn store(&self, key: TileKey, tile: &mut Tile) -> Result<bool> {
        if tile.is_stored() {
            return Ok(false);
        }
        self.set(key, tile)?;
        tile.mark_stored();
        Ok(true)
    }
}

/// One request of the tile command protocol.
#[derive(Debug)]
pub enum TileCommand<'a> {
    Get(TileKey),
    Set(TileKey, &'a Tile),
    Void(TileKey),
    Exist(TileKey),
    Flush,
    Idle,
}

#[derive(Debug, PartialEq)]
pub enum CommandReply {
    Tile(Option<Tile>),
    Exists(bool),
    Done,
}

impl TileCommand<'_> {
    pub fn dispatch<B: TileBackend + ?Sized>(self, backend: &B) -> Result<CommandReply> {
        match self {
            TileCommand::Get(key) => backend.get(key).map(CommandReply::Tile),
            TileCommand::Set(key, tile) => backend.set(key, tile).map(|_| CommandReply::Done),
            TileCommand::Void(key) => backend.void(key).map(|_| CommandReply::Done),
            TileCommand::Exist(key) => backend.exist(key).map(CommandReply::Exists),
            TileCommand::Flush => backend.flush().map(|_| CommandReply::Done),
            TileCommand::Idle => backend.idle().map(|_| CommandReply::Done),
        }
    }
}

impl<B: TileBackend + ?Sized> TileBackend for std::sync::Arc<B> {
    fn layout(&self) -> &TileLayout {
        (**self).layout()
    }

    fn get(&self, key: TileKey) -> Result<Option<Tile>> {
        (**self).get(key)
    }

    fn set(&self, key: TileKey, tile: &Tile) -> Result<()> {
        (**self).set(key, tile)
    }

    fn void(&self, key: TileKey) -> Result<()> {
        (**self).void(key)
    }

    fn exist(&self, key: TileKey) -> Result<bool> {
        (**self).exist(key)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn idle(&self) -> Result<()> {
        (**self).idle()
    }

    fn stats(&self) -> AllocSnapshot {
        (**self).stats()
    }

    fn extent(&self) -> Option<Rect> {
        (**self).extent()
    }

    fn set_extent(&self, extent: Rect) {
        (**self).set_extent(extent)
    }
}

pub(crate) fn check_tile_size(layout: &TileLayout, tile: &Tile) -> Result<()> {
    eyre::ensure!(
        tile.len() == layout.tile_size(),
        "tile holds {} bytes, backend expects {}",
        tile.len(),
        layout.tile_size()
    );
    Ok(())
}
