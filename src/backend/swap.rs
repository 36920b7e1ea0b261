//! # Swap Backend
//!
//! Buffers that only need to spill out of RAM share one anonymous swap file
//! per [`TileContext`](crate::context::TileContext), named
//! `<pid>-shared.swap` in the configured swap directory. Nothing about a swap
//! buffer survives the process: there is no header and no on-disk index, and
//! `flush` has nothing to persist.
//!
//! ```text
//! SwapBackend (64x64 RGBA float) ──┐
//! SwapBackend (128x128 u8)  ───────┼──► SwapFile ──► GapAllocator + <pid>-shared.swap
//! SwapBackend (...)  ──────────────┘
//! ```
//!
//! Buffers may use different tile sizes, so space is handed out by the
//! coalescing [`GapAllocator`] rather than fixed slots. The file is created on
//! the first allocation and removed when the last owner of the [`SwapFile`]
//! drops it, after checking that every byte was given back.
//!
//! Lock order is backend state, then the swap file's allocator, then the
//! writer queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::queued::QueuedIndex;
use super::store::{FileStore, Store};
use super::{check_tile_size, TileBackend};
use crate::alloc::{AllocSnapshot, AllocStats, Gap, GapAllocator};
use crate::config::{TileConfig, SWAP_FILE_SUFFIX};
use crate::error::TileError;
use crate::format::ReadAt;
use crate::pipeline::{QueuedOp, TargetId, WriterPipeline};
use crate::tile::{Tile, TileKey, TileLayout};

struct SwapInner {
    store: Option<Arc<FileStore>>,
    target: Option<TargetId>,
    gaps: GapAllocator,
    live: u64,
}

/// The process-wide swap file and its free-space list.
pub struct SwapFile {
    path: PathBuf,
    pipeline: Arc<WriterPipeline>,
    inner: Mutex<SwapInner>,
}

impl SwapFile {
    pub fn new(config: &TileConfig, pipeline: Arc<WriterPipeline>) -> Self {
        let name = format!("{}{}", std::process::id(), SWAP_FILE_SUFFIX);
        Self::with_path(config.swap_dir.join(name), config.max_file_size, pipeline)
    }

    pub fn with_path<P: AsRef<Path>>(
        path: P,
        limit: Option<u64>,
        pipeline: Arc<WriterPipeline>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pipeline,
            inner: Mutex::new(SwapInner {
                store: None,
                target: None,
                gaps: GapAllocator::new(limit),
                live: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().gaps.total()
    }

    pub fn live_bytes(&self) -> u64 {
        self.inner.lock().live
    }

    pub fn gaps(&self) -> Vec<Gap> {
        self.inner.lock().gaps.gaps().to_vec()
    }

    /// Verifies that free gaps and live tiles exactly cover the file.
    pub fn check(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.gaps.check(inner.live)
    }

    fn allocate(&self, len: u64) -> Result<(u64, Arc<FileStore>)> {
        let mut inner = self.inner.lock();

        let (store, target) = match (&inner.store, inner.target) {
            (Some(store), Some(target)) => (Arc::clone(store), target),
            _ => {
                if let Some(dir) = self.path.parent() {
                    std::fs::create_dir_all(dir).wrap_err_with(|| {
                        format!("failed to create swap directory '{}'", dir.display())
                    })?;
                }
                let store = Arc::new(
                    FileStore::create(&self.path).map_err(|e| TileError::io(&self.path, 0, e))?,
                );
                let target = self.pipeline.register(store.clone());
                inner.store = Some(Arc::clone(&store));
                inner.target = Some(target);
                debug!(path = %self.path.display(), "created swap file");
                (store, target)
            }
        };

        let grant = inner.gaps.allocate(len)?;
        if let Some(size) = grant.grow_to {
            trace!(path = %self.path.display(), size, "growing swap file");
            self.pipeline.enqueue(QueuedOp::truncate(target, size));
        }
        inner.live += len;
        Ok((grant.offset, store))
    }

    fn release(&self, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        inner.gaps.release(offset, len);
        inner.live -= len;
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(target) = inner.target.take() {
            self.pipeline.unregister(target);
        }

        if let Err(err) = inner.gaps.check(inner.live) {
            warn!(path = %self.path.display(), error = %err, "swap gap list inconsistent at shutdown");
        } else if !inner.gaps.is_fully_free() {
            warn!(
                path = %self.path.display(),
                live = inner.live,
                "swap file still holds tiles at shutdown"
            );
        }

        if inner.store.take().is_some() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed swap file"),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "failed to remove swap file")
                }
            }
        }
    }
}

#[derive(Default)]
struct SwapState {
    index: QueuedIndex,
    store: Option<Arc<FileStore>>,
    target: Option<TargetId>,
}

/// One buffer's tiles inside the shared [`SwapFile`].
pub struct SwapBackend {
    layout: TileLayout,
    config: Arc<TileConfig>,
    pipeline: Arc<WriterPipeline>,
    swap: Arc<SwapFile>,
    state: Mutex<SwapState>,
    stats: AllocStats,
}

impl SwapBackend {
    pub fn new(
        layout: TileLayout,
        config: Arc<TileConfig>,
        pipeline: Arc<WriterPipeline>,
        swap: Arc<SwapFile>,
    ) -> Self {
        Self {
            layout,
            config,
            pipeline,
            swap,
            state: Mutex::new(SwapState::default()),
            stats: AllocStats::default(),
        }
    }

    pub fn swap_file(&self) -> &Arc<SwapFile> {
        &self.swap
    }

    fn absorb(&self, state: &mut SwapState) -> Result<()> {
        state.index.absorb_failures(
            &self.pipeline,
            state.target,
            self.config.io_failure_policy,
            self.swap.path(),
        )
    }
}

impl TileBackend for SwapBackend {
    fn layout(&self) -> &TileLayout {
        &self.layout
    }

    fn get(&self, key: TileKey) -> Result<Option<Tile>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;
        let store = state.store.as_deref().map(|s| s as &dyn ReadAt);
        state.index.read(
            &self.pipeline,
            store,
            key,
            self.layout.tile_size(),
            self.config.io_failure_policy,
            self.swap.path(),
        )
    }

    fn set(&self, key: TileKey, tile: &Tile) -> Result<()> {
        check_tile_size(&self.layout, tile)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;

        let tile_size = self.layout.tile_size() as u64;
        let offset = match state.index.get(&key) {
            Some(entry) => entry.offset,
            None => {
                let (offset, store) = self.swap.allocate(tile_size)?;
                if state.target.is_none() {
                    state.target = Some(self.pipeline.register(store.clone()));
                    state.store = Some(store);
                }
                self.stats.record_alloc(tile_size);
                offset
            }
        };

        let Some(target) = state.target else {
            eyre::bail!("swap backend has no write target");
        };
        state
            .index
            .write(&self.pipeline, target, key, offset, tile, |_, _| Ok(false))
    }

    fn void(&self, key: TileKey) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;
        if let Some(entry) = state.index.remove(&self.pipeline, &key) {
            let tile_size = self.layout.tile_size() as u64;
            // An in-progress write may still land in the slot; wait before reuse.
            if entry.write.is_some_and(|handle| self.pipeline.is_pending(handle)) {
                if let Some(target) = state.target {
                    self.pipeline.finish_writing(target);
                }
            }
            self.swap.release(entry.offset, tile_size);
            self.stats.record_free(tile_size);
        }
        Ok(())
    }

    fn exist(&self, key: TileKey) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;
        Ok(state.index.contains(&key))
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock();
        self.absorb(&mut guard)
    }

    fn stats(&self) -> AllocSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for SwapBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let keys: Vec<TileKey> = state.index.entries.keys().copied().collect();
        let mut offsets = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = state.index.remove(&self.pipeline, &key) {
                offsets.push(entry.offset);
            }
        }
        if let Some(target) = state.target.take() {
            self.pipeline.unregister(target);
        }

        let tile_size = self.layout.tile_size() as u64;
        for offset in offsets {
            self.swap.release(offset, tile_size);
        }
        trace!(path = %self.swap.path().display(), "released swap buffer");
    }
}
