//! # Buffer File Header
//!
//! Every buffer file starts with a fixed 256-byte header. Tile payloads follow
//! it directly and the index chain lives wherever `next` points.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  -------------------------------------------
//! 0       4     magic            "GEGL"
//! 4       4     flags            low byte: format revision, bit 8: locked,
//!                                bit 9: flushed, bit 10: is-header
//! 8       8     next             offset of the first index block (0 = empty)
//! 16      4     tile_width
//! 20      4     tile_height
//! 24      2     bytes_per_pixel
//! 26      64    description      NUL-padded pixel-format descriptor
//! 90      4     x                bounding box origin
//! 94      4     y
//! 98      4     width            bounding box size
//! 102     4     height
//! 106     4     rev              index revision, bumped on every flush
//! 110     146   padding
//! ```
//!
//! All multi-byte fields are little-endian. The struct is `Unaligned`, so it
//! can be parsed straight out of an mmap'd region or an arbitrary buffer.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BUFFER_HEADER_SIZE, BUFFER_MAGIC, DESCRIPTION_LEN, FORMAT_REVISION};
use crate::tile::{PixelFormat, Rect, TileLayout};

pub const FLAG_REVISION_MASK: u32 = 0xff;
pub const FLAG_LOCKED: u32 = 1 << 8;
pub const FLAG_FLUSHED: u32 = 1 << 9;
pub const FLAG_IS_HEADER: u32 = 1 << 10;

const PADDING_LEN: usize = 146;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BufferHeader {
    magic: [u8; 4],
    flags: U32,
    next: U64,
    tile_width: U32,
    tile_height: U32,
    bytes_per_pixel: U16,
    description: [u8; DESCRIPTION_LEN],
    x: I32,
    y: I32,
    width: U32,
    height: U32,
    rev: U32,
    padding: [u8; PADDING_LEN],
}

const _: () = assert!(std::mem::size_of::<BufferHeader>() == BUFFER_HEADER_SIZE);

impl BufferHeader {
    /// Fresh header for an empty buffer: revision 0, no index, empty extent.
    pub fn new(layout: &TileLayout) -> Self {
        let mut description = [0u8; DESCRIPTION_LEN];
        let desc = layout.format.description().as_bytes();
        let len = desc.len().min(DESCRIPTION_LEN - 1);
        description[..len].copy_from_slice(&desc[..len]);

        Self {
            magic: *BUFFER_MAGIC,
            flags: U32::new(FLAG_IS_HEADER | FORMAT_REVISION),
            next: U64::new(0),
            tile_width: U32::new(layout.tile_width),
            tile_height: U32::new(layout.tile_height),
            bytes_per_pixel: U16::new(layout.bytes_per_pixel),
            description,
            x: I32::new(0),
            y: I32::new(0),
            width: U32::new(0),
            height: U32::new(0),
            rev: U32::new(0),
            padding: [0u8; PADDING_LEN],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= BUFFER_HEADER_SIZE,
            "buffer too small for BufferHeader: {} < {}",
            bytes.len(),
            BUFFER_HEADER_SIZE
        );

        let header = Self::read_from_bytes(&bytes[..BUFFER_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse BufferHeader: {:?}", e))?;

        ensure!(&header.magic == BUFFER_MAGIC, "invalid magic bytes in buffer file");
        ensure!(
            header.flags() & FLAG_IS_HEADER != 0,
            "header flags 0x{:x} lack the is-header bit",
            header.flags()
        );
        ensure!(
            header.format_revision() == FORMAT_REVISION,
            "unsupported format revision: {} (expected {})",
            header.format_revision(),
            FORMAT_REVISION
        );
        ensure!(
            header.tile_width() > 0 && header.tile_height() > 0 && header.bytes_per_pixel() > 0,
            "header describes empty tiles ({}x{}, {} bytes per pixel)",
            header.tile_width(),
            header.tile_height(),
            header.bytes_per_pixel()
        );

        Ok(header)
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn format_revision(&self) -> u32 {
        self.flags() & FLAG_REVISION_MASK
    }

    pub fn is_locked(&self) -> bool {
        self.flags() & FLAG_LOCKED != 0
    }

    pub fn set_locked(&mut self, locked: bool) {
        let flags = if locked {
            self.flags() | FLAG_LOCKED
        } else {
            self.flags() & !FLAG_LOCKED
        };
        self.flags = U32::new(flags);
    }

    pub fn set_flushed(&mut self, flushed: bool) {
        let flags = if flushed {
            self.flags() | FLAG_FLUSHED
        } else {
            self.flags() & !FLAG_FLUSHED
        };
        self.flags = U32::new(flags);
    }

    pub fn next(&self) -> u64 {
        self.next.get()
    }

    pub fn set_next(&mut self, offset: u64) {
        self.next = U64::new(offset);
    }

    pub fn rev(&self) -> u32 {
        self.rev.get()
    }

    pub fn set_rev(&mut self, rev: u32) {
        self.rev = U32::new(rev);
    }

    pub fn bump_rev(&mut self) -> u32 {
        let rev = self.rev().wrapping_add(1);
        self.set_rev(rev);
        rev
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width.get()
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height.get()
    }

    pub fn bytes_per_pixel(&self) -> u16 {
        self.bytes_per_pixel.get()
    }

    pub fn description(&self) -> &str {
        let end = self
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DESCRIPTION_LEN);
        std::str::from_utf8(&self.description[..end]).unwrap_or("")
    }

    pub fn layout(&self) -> Result<TileLayout> {
        TileLayout::with_bytes_per_pixel(
            self.tile_width(),
            self.tile_height(),
            self.bytes_per_pixel(),
            PixelFormat::parse(self.description()),
        )
    }

    pub fn extent(&self) -> Rect {
        Rect::new(
            self.x.get(),
            self.y.get(),
            self.width.get(),
            self.height.get(),
        )
    }

    pub fn set_extent(&mut self, extent: Rect) {
        self.x = I32::new(extent.x);
        self.y = I32::new(extent.y);
        self.width = U32::new(extent.width);
        self.height = U32::new(extent.height);
    }
}
