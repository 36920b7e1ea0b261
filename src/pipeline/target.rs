//! Destinations the writer thread can perform operations against.

use std::path::Path;

use eyre::Result;

use crate::tile::TileKey;

/// A file-like sink for queued operations.
///
/// Implementations are called from the writer thread only, one operation at a
/// time per pipeline.
pub trait WriteTarget: Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn truncate(&self, len: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn path(&self) -> &Path;
}

/// Identifies a registered [`WriteTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub(crate) u64);

/// Refers to one queued write for coalescing, cancelling and read-through.
///
/// Handles are never reused, so a stale handle simply stops matching once its
/// operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(pub(crate) u64);

#[derive(Debug)]
pub enum WriteOp {
    Write { offset: u64, data: Vec<u8> },
    Truncate { len: u64 },
    Sync,
}

impl WriteOp {
    pub(crate) fn payload_len(&self) -> usize {
        match self {
            WriteOp::Write { data, .. } => data.len(),
            WriteOp::Truncate { .. } | WriteOp::Sync => 0,
        }
    }

    pub(crate) fn offset(&self) -> u64 {
        match self {
            WriteOp::Write { offset, .. } => *offset,
            WriteOp::Truncate { len } => *len,
            WriteOp::Sync => 0,
        }
    }
}

/// An operation tagged with who queued it.
#[derive(Debug)]
pub struct QueuedOp {
    pub target: TargetId,
    /// The tile this write carries, if any. Used in failure reports.
    pub key: Option<TileKey>,
    pub op: WriteOp,
}

impl QueuedOp {
    pub fn write(target: TargetId, key: Option<TileKey>, offset: u64, data: Vec<u8>) -> Self {
        Self {
            target,
            key,
            op: WriteOp::Write { offset, data },
        }
    }

    pub fn truncate(target: TargetId, len: u64) -> Self {
        Self {
            target,
            key: None,
            op: WriteOp::Truncate { len },
        }
    }

    pub fn sync(target: TargetId) -> Self {
        Self {
            target,
            key: None,
            op: WriteOp::Sync,
        }
    }
}
