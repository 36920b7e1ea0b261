//! # tilebuf - Tile-Backed Virtual Memory for Rasters
//!
//! tilebuf stores an effectively unbounded 2-D raster, plus its mipmap
//! pyramid, as fixed-size tiles. Tiles live in RAM, in a buffer file, in a
//! memory-mapped buffer file or in a process-wide swap file, and are written
//! out by one background thread so callers never block on disk I/O.
//!
//! - **Read-your-writes without blocking**: a `get` of a tile whose write is
//!   still queued is served from the queue
//! - **Coalescing**: rewriting a tile that has not reached disk replaces the
//!   queued bytes instead of queueing a second write
//! - **Bounded memory**: producers block once queued writes exceed a byte limit
//!
//! ## Quick Start
//!
//! ```ignore
//! use tilebuf::{PixelFormat, Tile, TileBackend, TileConfig, TileContext, TileKey, TileLayout};
//!
//! let ctx = TileContext::new(TileConfig::from_env())?;
//! let layout = TileLayout::new(128, 128, PixelFormat::rgba_float())?;
//!
//! let buffer = ctx.file("./scene.gegl", Some(layout.clone()))?;
//! buffer.set(TileKey::new(0, 0, 0), &Tile::zeroed(layout.tile_size()))?;
//! let tile = buffer.get(TileKey::new(0, 0, 0))?;
//! buffer.flush()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Caller (compositor, cache layer)  │
//! ├─────────────────────────────────────┤
//! │   TileCommand: GET SET VOID EXIST   │
//! │                FLUSH IDLE           │
//! ├─────────────────────────────────────┤
//! │        ZoomCache (mip levels)       │
//! ├──────────┬──────────────┬───────────┤
//! │   RAM    │ File / mmap  │   Swap    │
//! │          │   + index    │ + gaps    │
//! ├──────────┴──────────────┴───────────┤
//! │  WriterPipeline (one writer thread) │
//! ├─────────────────────────────────────┤
//! │     pwrite / memory map / fsync     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! buffer.gegl
//! ├── [0, 256)        header: magic, flags, layout, extent, rev, next
//! ├── tile slots      tile_size bytes each, grown 32 slots at a time
//! └── index chain     40-byte tile index blocks linked by `next`
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants and the runtime [`TileConfig`]
//! - [`error`]: typed [`TileError`] and the [`IoFailurePolicy`]
//! - [`tile`]: tile keys, tiles and tile layouts
//! - [`alloc`]: slot and gap allocators for backing files
//! - [`format`]: the on-disk header and index chain
//! - [`pipeline`]: the background writer queue
//! - [`backend`]: the [`TileBackend`] trait and its implementations
//! - [`zoom`]: on-demand mipmap levels
//! - [`context`]: process-level owner of the pipeline and swap file

pub mod alloc;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod tile;
pub mod zoom;

pub use backend::{
    ChangeListener, CommandReply, FileBackend, MappedBackend, RamBackend, SwapBackend,
    TileBackend, TileCommand,
};
pub use config::TileConfig;
pub use context::TileContext;
pub use error::{IoFailurePolicy, TileError};
pub use tile::{PixelFormat, Rect, Tile, TileKey, TileLayout};
pub use zoom::ZoomCache;
