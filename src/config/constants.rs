//! # Tile Buffer Configuration Constants
//!
//! This module centralizes the compile-time constants of the tile store,
//! grouping interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! BUFFER_HEADER_SIZE (256 bytes)
//!       │
//!       ├─> first tile slot starts here in every file backend
//!       │
//!       └─> BufferHeader struct size (compile-time checked in format::header)
//!
//! INDEX_BLOCK_SIZE (16 bytes)
//!       │
//!       └─> TILE_INDEX_BLOCK_SIZE (40 bytes = block + offset + x,y,z + rev)
//!
//! GROWTH_STEP_TILES (32)
//!       │
//!       └─> file and swap backends grow by this many tile slots at once
//! ```
//!
//! ## Runtime Settings
//!
//! Values a deployment may want to change (queue size, swap directory, lock
//! polling) live in [`super::TileConfig`]; the constants here are only their
//! defaults.

use std::time::Duration;

// ============================================================================
// ON-DISK LAYOUT
// Changing any of these breaks compatibility with existing buffer files
// ============================================================================

/// Size of the buffer file header in bytes.
/// Tile payloads begin immediately after it.
pub const BUFFER_HEADER_SIZE: usize = 256;

/// Size of the generic index block header (length, flags, next).
pub const INDEX_BLOCK_SIZE: usize = 16;

/// Size of a tile index block: block header + offset(8) + x,y,z(12) + rev(4).
pub const TILE_INDEX_BLOCK_SIZE: usize = INDEX_BLOCK_SIZE + 8 + 12 + 4;

/// Length of the pixel-format descriptor stored in the header.
pub const DESCRIPTION_LEN: usize = 64;

/// Magic bytes at offset 0 of every buffer file.
pub const BUFFER_MAGIC: &[u8; 4] = b"GEGL";

/// On-disk format revision, stored in the low byte of the header flags.
pub const FORMAT_REVISION: u32 = 1;

const _: () = assert!(
    TILE_INDEX_BLOCK_SIZE == 40,
    "tile index block layout changed"
);

const _: () = assert!(
    FORMAT_REVISION <= 0xff,
    "format revision must fit in the low byte of the header flags"
);

// ============================================================================
// ALLOCATION
// ============================================================================

/// Number of tile slots added whenever a file or the swap file runs full.
pub const GROWTH_STEP_TILES: u64 = 32;

// ============================================================================
// WRITER PIPELINE DEFAULTS
// ============================================================================

/// Default byte limit of the writer queue before producers block (50 MiB).
pub const DEFAULT_QUEUE_SIZE_LIMIT: usize = 50 * 1024 * 1024;

/// Bookkeeping bytes charged per queued write on top of its payload.
/// Keeps a flood of tiny writes from bypassing the byte limit.
pub const QUEUE_ENTRY_OVERHEAD: usize = 64;

/// Interval between header re-reads while another process holds the lock.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// Overrides the swap directory.
pub const ENV_SWAP_DIR: &str = "TILEBUF_SWAP";

/// Overrides the writer queue byte limit.
pub const ENV_QUEUE_SIZE: &str = "TILEBUF_QUEUE_SIZE";

/// Suffix of the per-process swap file name (`<pid>-shared.swap`).
pub const SWAP_FILE_SUFFIX: &str = "-shared.swap";

// ============================================================================
// MIPMAP PYRAMID
// ============================================================================

/// Highest mip level whose quadrants are tracked for invalidation.
/// At 64x64 tiles level 16 covers a 4-gigapixel edge with one tile.
pub const MAX_ZOOM_LEVEL: i32 = 16;
