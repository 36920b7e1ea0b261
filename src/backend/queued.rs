//! Tile I/O shared by the backends that write through the pipeline.
//!
//! The file, mmap and swap backends differ in where slots come from and what
//! a flush means, but they read, write and account for failures the same
//! way. [`QueuedIndex`] is that common part: the key -> slot map plus the
//! per-tile links into the writer queue.

use std::path::Path;

use eyre::{bail, Result};
use hashbrown::{HashMap, HashSet};
use tracing::{trace, warn};

use crate::error::{IoFailurePolicy, TileError, WriteFailure};
use crate::format::ReadAt;
use crate::pipeline::{QueuedOp, TargetId, WriteHandle, WriterPipeline};
use crate::tile::{Tile, TileKey};

/// Where one tile lives and whether a write for it is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotEntry {
    pub offset: u64,
    pub revision: u32,
    pub write: Option<WriteHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct QueuedIndex {
    pub entries: HashMap<TileKey, SlotEntry>,
    corrupt: HashSet<TileKey>,
}

impl QueuedIndex {
    pub fn get(&self, key: &TileKey) -> Option<&SlotEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_corrupt(&self, key: &TileKey) -> bool {
        self.corrupt.contains(key)
    }

    pub fn mark_corrupt(&mut self, key: TileKey) {
        self.corrupt.insert(key);
    }

    /// Removes the entry and cancels its queued write, if any.
    pub fn remove(&mut self, pipeline: &WriterPipeline, key: &TileKey) -> Option<SlotEntry> {
        self.corrupt.remove(key);
        let entry = self.entries.remove(key)?;
        if let Some(handle) = entry.write {
            if pipeline.cancel(handle) {
                trace!(x = key.x, y = key.y, z = key.z, "cancelled queued write");
            }
        }
        Some(entry)
    }

    /// Reads a tile, preferring a queued or in-progress write over the store.
    pub fn read(
        &self,
        pipeline: &WriterPipeline,
        store: Option<&dyn ReadAt>,
        key: TileKey,
        tile_size: usize,
        policy: IoFailurePolicy,
        path: &Path,
    ) -> Result<Option<Tile>> {
        if self.corrupt.contains(&key) {
            bail!(TileError::CorruptTile { key });
        }
        let Some(entry) = self.entries.get(&key) else {
            return Ok(None);
        };

        let mut data = vec![0u8; tile_size].into_boxed_slice();

        if let Some(handle) = entry.write {
            if pipeline.read_pending(handle, &mut data) {
                trace!(x = key.x, y = key.y, z = key.z, "read tile from queue");
                return Ok(Some(Tile::loaded(data, entry.revision)));
            }
        }

        let result = match store {
            Some(store) => store.read_exact_at(&mut data, entry.offset),
            None => Err(eyre::eyre!("backing file was never created")),
        };
        if let Err(err) = result {
            warn!(
                path = %path.display(),
                offset = entry.offset,
                x = key.x,
                y = key.y,
                z = key.z,
                error = %err,
                "unable to read tile"
            );
            if policy.fails_reads() {
                bail!(TileError::io(path, entry.offset, err));
            }
        }

        Ok(Some(Tile::loaded(data, entry.revision)))
    }

    /// Records `tile` under `key` at `offset` and schedules its bytes.
    ///
    /// A write still waiting in the queue is overwritten in place; otherwise
    /// `direct` gets a chance to store the bytes synchronously before a new
    /// write is queued.
    pub fn write(
        &mut self,
        pipeline: &WriterPipeline,
        target: TargetId,
        key: TileKey,
        offset: u64,
        tile: &Tile,
        direct: impl FnOnce(u64, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        self.corrupt.remove(&key);
        let entry = self.entries.entry(key).or_insert(SlotEntry {
            offset,
            revision: 0,
            write: None,
        });
        entry.revision = tile.revision();

        if let Some(handle) = entry.write {
            if pipeline.coalesce(handle, tile.data()) {
                trace!(x = key.x, y = key.y, z = key.z, "coalesced queued write");
                return Ok(());
            }
        }

        if pipeline.is_idle(target) && direct(entry.offset, tile.data())? {
            entry.write = None;
            return Ok(());
        }

        entry.write = Some(pipeline.enqueue(QueuedOp::write(
            target,
            Some(key),
            entry.offset,
            tile.data().to_vec(),
        )));
        trace!(x = key.x, y = key.y, z = key.z, offset = entry.offset, "queued tile write");
        Ok(())
    }

    /// Applies `policy` to failures the writer reported for `target`.
    pub fn absorb_failures(
        &mut self,
        pipeline: &WriterPipeline,
        target: Option<TargetId>,
        policy: IoFailurePolicy,
        path: &Path,
    ) -> Result<()> {
        let Some(target) = target else {
            return Ok(());
        };
        let failures = pipeline.take_failures(target);
        if failures.is_empty() {
            return Ok(());
        }

        match policy {
            IoFailurePolicy::Warn => Ok(()),
            IoFailurePolicy::Surface => Err(surface(path, &failures)),
            IoFailurePolicy::MarkCorrupt => {
                let mut untracked = Vec::new();
                for failure in failures {
                    match failure.key {
                        Some(key) => self.mark_failed_write(pipeline, key),
                        None => untracked.push(failure),
                    }
                }
                if untracked.is_empty() {
                    Ok(())
                } else {
                    Err(surface(path, &untracked))
                }
            }
        }
    }

    fn mark_failed_write(&mut self, pipeline: &WriterPipeline, key: TileKey) {
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        // A newer write for the tile may still succeed.
        if entry.write.is_some_and(|handle| pipeline.is_pending(handle)) {
            return;
        }
        warn!(x = key.x, y = key.y, z = key.z, "marking tile corrupt after failed write");
        self.corrupt.insert(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.corrupt.clear();
    }
}

fn surface(path: &Path, failures: &[WriteFailure]) -> eyre::Report {
    let first = &failures[0];
    let message = if failures.len() > 1 {
        format!("{} (and {} more failed writes)", first.message, failures.len() - 1)
    } else {
        first.message.clone()
    };
    eyre::Report::new(TileError::Io {
        path: path.to_path_buf(),
        offset: first.offset,
        message,
    })
}
