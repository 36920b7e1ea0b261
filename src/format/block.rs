//! # Index Blocks
//!
//! The tile index is a singly linked chain of blocks. Every block starts with
//! the same 16-byte [`IndexBlock`] prefix; the only block type defined so far
//! is the tile entry, which extends the prefix to 40 bytes.
//!
//! ```text
//! IndexBlock (16 bytes)          TileIndexBlock (40 bytes)
//! +--------+-------+--------+    +-------------+--------+---+---+---+-----+
//! | length | flags |  next  |    | IndexBlock  | offset | x | y | z | rev |
//! |   u32  |  u32  |  u64   |    |   16 bytes  |  u64   |i32|i32|i32| u32 |
//! +--------+-------+--------+    +-------------+--------+---+---+---+-----+
//! ```
//!
//! `next` is the file offset of the following block, 0 terminates the chain.

use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{INDEX_BLOCK_SIZE, TILE_INDEX_BLOCK_SIZE};
use crate::tile::TileKey;

/// Block type flag for tile entries.
pub const BLOCK_FLAG_TILE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexBlock {
    length: U32,
    flags: U32,
    next: U64,
}

const _: () = assert!(std::mem::size_of::<IndexBlock>() == INDEX_BLOCK_SIZE);

impl IndexBlock {
    pub fn new(length: u32, flags: u32) -> Self {
        Self {
            length: U32::new(length),
            flags: U32::new(flags),
            next: U64::new(0),
        }
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn next(&self) -> u64 {
        self.next.get()
    }

    pub fn set_next(&mut self, next: u64) {
        self.next = U64::new(next);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TileIndexBlock {
    block: IndexBlock,
    offset: U64,
    x: I32,
    y: I32,
    z: I32,
    rev: U32,
}

const _: () = assert!(std::mem::size_of::<TileIndexBlock>() == TILE_INDEX_BLOCK_SIZE);

impl TileIndexBlock {
    pub fn new(key: TileKey, offset: u64, rev: u32) -> Self {
        Self {
            block: IndexBlock::new(TILE_INDEX_BLOCK_SIZE as u32, BLOCK_FLAG_TILE),
            offset: U64::new(offset),
            x: I32::new(key.x),
            y: I32::new(key.y),
            z: I32::new(key.z),
            rev: U32::new(rev),
        }
    }

    pub fn block(&self) -> &IndexBlock {
        &self.block
    }

    pub fn key(&self) -> TileKey {
        TileKey::new(self.x.get(), self.y.get(), self.z.get())
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn rev(&self) -> u32 {
        self.rev.get()
    }

    pub fn next(&self) -> u64 {
        self.block.next()
    }

    pub fn set_next(&mut self, next: u64) {
        self.block.set_next(next);
    }
}
