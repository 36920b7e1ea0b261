//! # Tile Store Errors
//!
//! All fallible operations return `eyre::Result`. The failures a caller may
//! want to react to are raised as a typed [`TileError`] inside the report, so
//! they can be recovered with `report.downcast_ref::<TileError>()`:
//!
//! ```ignore
//! match backend.get(key) {
//!     Err(report) => match report.downcast_ref::<TileError>() {
//!         Some(TileError::LockTimeout { .. }) => retry_later(),
//!         _ => return Err(report),
//!     },
//!     Ok(tile) => use_tile(tile),
//! }
//! ```
//!
//! Every error aborts only the operation that raised it. The in-memory index
//! stays authoritative and the backend remains usable.

use std::path::PathBuf;
use std::time::Duration;

use crate::tile::TileKey;

#[derive(Debug)]
pub enum TileError {
    /// A read, write, seek, resize or open failed.
    Io {
        path: PathBuf,
        offset: u64,
        message: String,
    },
    /// The on-disk header or index chain is malformed.
    CorruptIndex { path: PathBuf, reason: String },
    /// Growing the backing store would exceed the configured ceiling.
    AllocationExhausted { requested: u64, limit: u64 },
    /// Another process kept the advisory lock longer than the configured timeout.
    LockTimeout { path: PathBuf, waited: Duration },
    /// A queued write for this tile failed; its stored content is unreliable.
    CorruptTile { key: TileKey },
    /// An existing file was opened with a tile layout different from its header.
    LayoutMismatch { path: PathBuf, reason: String },
}

impl std::fmt::Display for TileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileError::Io {
                path,
                offset,
                message,
            } => write!(
                f,
                "i/o failure on '{}' at offset {}: {}",
                path.display(),
                offset,
                message
            ),
            TileError::CorruptIndex { path, reason } => {
                write!(f, "corrupt tile index in '{}': {}", path.display(), reason)
            }
            TileError::AllocationExhausted { requested, limit } => write!(
                f,
                "backing store exhausted: {} bytes requested, limit is {}",
                requested, limit
            ),
            TileError::LockTimeout { path, waited } => write!(
                f,
                "'{}' still locked by another process after {:?}",
                path.display(),
                waited
            ),
            TileError::CorruptTile { key } => {
                write!(f, "tile {} was not stored correctly", key)
            }
            TileError::LayoutMismatch { path, reason } => {
                write!(f, "tile layout mismatch for '{}': {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for TileError {}

impl TileError {
    pub fn io(path: &std::path::Path, offset: u64, err: impl std::fmt::Display) -> Self {
        TileError::Io {
            path: path.to_path_buf(),
            offset,
            message: format!("{:#}", err),
        }
    }

    pub fn corrupt_index(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        TileError::CorruptIndex {
            path: path.to_path_buf(),
            reason: format!("{:#}", err),
        }
    }
}

/// How I/O failures are handled.
///
/// The writer thread cannot return errors to whoever queued the write, so the
/// policy decides whether a failure is only logged or reported later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoFailurePolicy {
    /// Log a warning. Reads yield zero-filled or partially filled tiles and
    /// failed writes are dropped.
    #[default]
    Warn,
    /// Failed reads return [`TileError::Io`]. Failed writes are remembered and
    /// returned once by the next command on the same backend.
    Surface,
    /// Failed reads return [`TileError::Io`]. A failed tile write marks the
    /// tile, and `get` reports [`TileError::CorruptTile`] until it is set again
    /// or voided.
    MarkCorrupt,
}

impl IoFailurePolicy {
    pub fn fails_reads(self) -> bool {
        !matches!(self, IoFailurePolicy::Warn)
    }
}

/// A write that the background writer could not complete.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub key: Option<TileKey>,
    pub offset: u64,
    pub message: String,
}
