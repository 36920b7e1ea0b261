//! # Tiles
//!
//! A tile is a fixed-size block of raw pixel bytes addressed by a
//! [`TileKey`] `(x, y, z)`. Backends hand out freshly allocated [`Tile`]s and
//! never a reference into their own storage; the caller owns what it gets.
//!
//! ## Revisions
//!
//! Every tile carries a `revision` that the owner bumps whenever it changes
//! the pixels, and a `stored_revision` recording the revision last handed to a
//! backend. [`TileBackend::store`](crate::backend::TileBackend::store) uses
//! the pair to skip writes of unchanged content.

mod key;
mod layout;

pub use key::{Quadrant, TileKey};
pub use layout::{PixelFormat, Rect, SampleType, TileLayout};

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    data: Box<[u8]>,
    revision: u32,
    stored_revision: u32,
}

impl Tile {
    /// A zero-filled tile at revision 1 that has never been stored.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            revision: 1,
            stored_revision: 0,
        }
    }

    pub fn from_data(data: impl Into<Box<[u8]>>, revision: u32) -> Self {
        Self {
            data: data.into(),
            revision,
            stored_revision: 0,
        }
    }

    /// A tile read back from a backend: already stored at `revision`.
    pub(crate) fn loaded(data: Box<[u8]>, revision: u32) -> Self {
        Self {
            data,
            revision,
            stored_revision: revision,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel access. Bumps the revision.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.revision = self.revision.wrapping_add(1);
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    pub fn is_stored(&self) -> bool {
        self.revision == self.stored_revision
    }

    pub fn mark_stored(&mut self) {
        self.stored_revision = self.revision;
    }

    pub fn into_data(self) -> Box<[u8]> {
        self.data
    }
}
