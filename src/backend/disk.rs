//! # Disk Backend
//!
//! A buffer stored in one file using the layout described in
//! [`crate::format`]. Tile bytes go through the shared writer pipeline; the
//! index lives in memory and is written out by `flush`.
//!
//! ## Lifecycle
//!
//! ```text
//!            open(path) with no file            open(path) on a buffer file
//!                     │                                   │
//!                     ▼                                   ▼
//!            ┌────────────────┐   first set/flush   ┌──────────┐
//!            │ UNINITIALIZED  │ ──────────────────► │  EXISTS  │ ◄─┐
//!            └────────────────┘   create + header   └──────────┘   │ reload()
//!                                                        │  └──────┘
//!                                                        ▼ drop
//!                                               wait for pending writes
//! ```
//!
//! Opening an existing file takes the tile layout from its header and loads
//! the index. The in-memory revision starts one behind the file's so the
//! first load always reads the chain.
//!
//! ## Index Reload
//!
//! Several processes may share a buffer file. `reload` re-reads the header
//! and, if its revision moved, walks the chain:
//!
//! - same key, same revision: keep the entry, adopt the on-disk offset
//! - same key, other revision: the tile was rewritten elsewhere; drop the
//!   entry and tell the [`ChangeListener`]
//! - unknown key: add it
//!
//! Afterwards the slot allocator restarts at the highest used slot with an
//! empty free list, since the other writer may have reused any free slot.
//!
//! ## Advisory Lock
//!
//! `try_lock` sets the header's locked flag; `load_index` in other processes
//! then polls every `lock_poll_interval` until it clears, failing with
//! [`TileError::LockTimeout`] if `lock_timeout` is set and runs out. `unlock`
//! clears the flag and waits for every pending write before returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use eyre::{bail, Result};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use zerocopy::IntoBytes;

use super::queued::{QueuedIndex, SlotEntry};
use super::store::{FileStore, MappedStore, Store};
use super::{check_tile_size, TileBackend};
use crate::alloc::{AllocSnapshot, AllocStats, SlotAllocator};
use crate::config::{TileConfig, BUFFER_HEADER_SIZE, TILE_INDEX_BLOCK_SIZE};
use crate::error::TileError;
use crate::format::{
    read_chain, read_header, BufferHeader, ChainWriter, PlacedBlock, ReadAt, TileIndexBlock,
};
use crate::pipeline::{QueuedOp, TargetId, WriterPipeline};
use crate::tile::{Rect, Tile, TileKey, TileLayout};

/// Buffer file accessed with positioned reads and writes.
pub type FileBackend = DiskBackend<FileStore>;

/// Buffer file accessed through a memory mapping.
pub type MappedBackend = DiskBackend<MappedStore>;

/// Receives notice of tiles another writer changed under a shared file.
pub trait ChangeListener: Send + Sync {
    /// The cached copy of `key` is stale and must be fetched again.
    fn tile_changed(&self, key: TileKey);

    /// Pixel area of a changed level-0 tile.
    fn region_changed(&self, _rect: Rect) {}
}

struct DiskState<S> {
    store: Option<Arc<S>>,
    target: Option<TargetId>,
    header: BufferHeader,
    index: QueuedIndex,
    alloc: SlotAllocator,
    extent: Rect,
    holds_lock: bool,
}

pub struct DiskBackend<S: Store> {
    path: PathBuf,
    layout: TileLayout,
    config: Arc<TileConfig>,
    pipeline: Arc<WriterPipeline>,
    state: Mutex<DiskState<S>>,
    stats: AllocStats,
    listener: Option<Arc<dyn ChangeListener>>,
}

impl<S: Store> DiskBackend<S> {
    /// Opens the buffer at `path`, or prepares to create it on first write.
    ///
    /// `layout` is required for a new file. For an existing file it is
    /// optional and, if given, must match the header.
    pub fn open<P: AsRef<Path>>(
        path: P,
        layout: Option<TileLayout>,
        config: Arc<TileConfig>,
        pipeline: Arc<WriterPipeline>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existing_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        if existing_len == 0 {
            let Some(layout) = layout else {
                bail!(
                    "buffer file '{}' does not exist and no tile layout was given",
                    path.display()
                );
            };
            debug!(path = %path.display(), kind = S::KIND, "new buffer, file created on first write");
            let alloc = SlotAllocator::new(
                layout.tile_size() as u64,
                BUFFER_HEADER_SIZE as u64,
                config.max_file_size,
            );
            return Ok(Self {
                state: Mutex::new(DiskState {
                    store: None,
                    target: None,
                    header: BufferHeader::new(&layout),
                    index: QueuedIndex::default(),
                    alloc,
                    extent: Rect::default(),
                    holds_lock: false,
                }),
                path,
                layout,
                config,
                pipeline,
                stats: AllocStats::default(),
                listener: None,
            });
        }

        let store = S::open(&path).map_err(|e| TileError::io(&path, 0, e))?;
        let mut header = read_header(&store).map_err(|e| TileError::corrupt_index(&path, e))?;
        let stored = header
            .layout()
            .map_err(|e| TileError::corrupt_index(&path, e))?;

        if let Some(requested) = &layout {
            if *requested != stored {
                bail!(TileError::LayoutMismatch {
                    path,
                    reason: format!(
                        "file holds {}x{} tiles of {} bytes per pixel ('{}'), \
                         caller asked for {}x{} of {} ('{}')",
                        stored.tile_width,
                        stored.tile_height,
                        stored.bytes_per_pixel,
                        stored.format.description(),
                        requested.tile_width,
                        requested.tile_height,
                        requested.bytes_per_pixel,
                        requested.format.description()
                    ),
                });
            }
        }

        let store = Arc::new(store);
        let target = pipeline.register(store.clone());
        let extent = header.extent();
        header.set_rev(header.rev().wrapping_sub(1));
        header.set_locked(false);

        let alloc = SlotAllocator::new(
            stored.tile_size() as u64,
            BUFFER_HEADER_SIZE as u64,
            config.max_file_size,
        );
        let backend = Self {
            state: Mutex::new(DiskState {
                store: Some(store),
                target: Some(target),
                header,
                index: QueuedIndex::default(),
                alloc,
                extent,
                holds_lock: false,
            }),
            path,
            layout: stored,
            config,
            pipeline,
            stats: AllocStats::default(),
            listener: None,
        };

        {
            let mut state = backend.state.lock();
            backend.load_index(&mut state)?;
        }
        debug!(path = %backend.path.display(), kind = S::KIND, "opened buffer file");
        Ok(backend)
    }

    pub fn with_listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file has been created yet.
    pub fn exists_on_disk(&self) -> bool {
        self.state.lock().store.is_some()
    }

    /// Index revision of the last flush or load.
    pub fn revision(&self) -> u32 {
        self.state.lock().header.rev()
    }

    /// Bytes of file space currently reserved by the allocator.
    pub fn reserved_size(&self) -> u64 {
        self.state.lock().alloc.total()
    }

    pub fn holds_lock(&self) -> bool {
        self.state.lock().holds_lock
    }

    /// Blocks until every queued operation for this file has been performed.
    pub fn finish_writing(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(target) = state.target {
            self.pipeline.finish_writing(target);
        }
        state
            .index
            .absorb_failures(&self.pipeline, state.target, self.config.io_failure_policy, &self.path)
    }

    /// Re-reads the on-disk index if another writer flushed it.
    pub fn reload(&self) -> Result<()> {
        let changed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.index.absorb_failures(
                &self.pipeline,
                state.target,
                self.config.io_failure_policy,
                &self.path,
            )?;
            if let Some(target) = state.target {
                self.pipeline.finish_writing(target);
            }
            self.load_index(state)?
        };
        self.notify(&changed);
        Ok(())
    }

    /// Sets the header's locked flag unless another holder already set it.
    pub fn try_lock(&self) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;
        let (store, target) = self.ensure_exist(state)?;

        self.pipeline.finish_writing(target);
        let on_disk = read_header(&*store).map_err(|e| TileError::corrupt_index(&self.path, e))?;
        if on_disk.is_locked() {
            return Ok(false);
        }

        state.header.set_locked(true);
        state.holds_lock = true;
        self.queue_header(state, target);
        self.pipeline.finish_writing(target);
        debug!(path = %self.path.display(), "locked buffer file");
        self.absorb(state)?;
        Ok(true)
    }

    /// Clears the locked flag once all pending writes have landed.
    pub fn unlock(&self) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (true, Some(target)) = (state.holds_lock, state.target) else {
            warn!(path = %self.path.display(), "tried to unlock unlocked buffer");
            return Ok(false);
        };

        state.header.set_locked(false);
        state.holds_lock = false;
        self.queue_header(state, target);
        self.pipeline.finish_writing(target);
        debug!(path = %self.path.display(), "unlocked buffer file");
        self.absorb(state)?;
        Ok(true)
    }

    /// Waits for pending writes and reports any failure still unreported.
    pub fn close(self) -> Result<()> {
        self.finish_writing()
    }

    fn tile_size(&self) -> usize {
        self.layout.tile_size()
    }

    fn absorb(&self, state: &mut DiskState<S>) -> Result<()> {
        state
            .index
            .absorb_failures(&self.pipeline, state.target, self.config.io_failure_policy, &self.path)
    }

    fn ensure_exist(&self, state: &mut DiskState<S>) -> Result<(Arc<S>, TargetId)> {
        if let (Some(store), Some(target)) = (&state.store, state.target) {
            return Ok((Arc::clone(store), target));
        }

        let store = Arc::new(S::create(&self.path).map_err(|e| TileError::io(&self.path, 0, e))?);
        let target = self.pipeline.register(store.clone());
        state.store = Some(Arc::clone(&store));
        state.target = Some(target);
        state.alloc.reset_to(BUFFER_HEADER_SIZE as u64);
        self.queue_header(state, target);

        debug!(path = %self.path.display(), kind = S::KIND, "created buffer file");
        Ok((store, target))
    }

    fn queue_header(&self, state: &mut DiskState<S>, target: TargetId) {
        state.header.set_extent(state.extent);
        self.pipeline.enqueue(QueuedOp::write(
            target,
            None,
            0,
            state.header.as_bytes().to_vec(),
        ));
        self.pipeline.enqueue(QueuedOp::sync(target));
        trace!(path = %self.path.display(), next = state.header.next(), "queued header write");
    }

    fn queue_grow(&self, target: TargetId, len: Option<u64>) {
        if let Some(len) = len {
            trace!(path = %self.path.display(), len, "queued file growth");
            self.pipeline.enqueue(QueuedOp::truncate(target, len));
        }
    }

    fn queue_block(&self, target: TargetId, placed: PlacedBlock<TileKey>) {
        self.pipeline.enqueue(QueuedOp::write(
            target,
            None,
            placed.offset,
            placed.block.as_bytes().to_vec(),
        ));
    }

    /// Writes the whole index as a fresh chain at the allocation frontier,
    /// then the header pointing at it.
    fn write_index(&self, state: &mut DiskState<S>, target: TargetId) {
        state.header.bump_rev();

        let mut keys: Vec<TileKey> = state.index.entries.keys().copied().collect();
        keys.sort_unstable_by_key(|key| (key.z_order(), *key));

        if keys.is_empty() {
            state.header.set_next(0);
        } else {
            let chain_len = keys.len() as u64 * TILE_INDEX_BLOCK_SIZE as u64;
            let grown = state.alloc.reserve_tail(chain_len);
            self.queue_grow(target, grown);

            let mut chain = ChainWriter::new(state.alloc.next_pre_alloc());
            state.header.set_next(chain.start());

            for key in keys {
                let Some(entry) = state.index.get(&key) else {
                    continue;
                };
                let block = TileIndexBlock::new(key, entry.offset, entry.revision);
                if let Some(placed) = chain.push(key, block) {
                    self.queue_block(target, placed);
                }
            }
            if let Some(placed) = chain.finish() {
                self.queue_block(target, placed);
            }
        }

        state.header.set_flushed(true);
        self.queue_header(state, target);
    }

    fn wait_unlocked(&self, store: &S, own_lock: bool) -> Result<BufferHeader> {
        let started = Instant::now();
        loop {
            let header =
                read_header(store).map_err(|e| TileError::corrupt_index(&self.path, e))?;
            if own_lock || !header.is_locked() {
                return Ok(header);
            }
            if let Some(timeout) = self.config.lock_timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    bail!(TileError::LockTimeout {
                        path: self.path.clone(),
                        waited,
                    });
                }
            }
            trace!(path = %self.path.display(), "buffer file locked, waiting");
            std::thread::sleep(self.config.lock_poll_interval);
        }
    }

    /// Reconciles the in-memory index with the file. Returns keys that were
    /// rewritten by another writer.
    fn load_index(&self, state: &mut DiskState<S>) -> Result<Vec<TileKey>> {
        let Some(store) = state.store.clone() else {
            return Ok(Vec::new());
        };

        let header = self.wait_unlocked(&store, state.holds_lock)?;
        if header.rev() == state.header.rev() {
            debug!(path = %self.path.display(), rev = header.rev(), "index unchanged");
            return Ok(Vec::new());
        }

        let blocks = read_chain(&*store, header.next())
            .map_err(|e| TileError::corrupt_index(&self.path, e))?;
        if let Some(bad) = blocks.iter().find(|b| b.offset() < BUFFER_HEADER_SIZE as u64) {
            bail!(TileError::corrupt_index(
                &self.path,
                format!("tile {} stored inside the header at {}", bad.key(), bad.offset())
            ));
        }

        let holds_lock = state.holds_lock;
        state.header = header;
        state.header.set_locked(holds_lock);

        let mut changed = Vec::new();
        for block in blocks {
            let key = block.key();
            match state.index.entries.get_mut(&key) {
                Some(existing) if existing.revision == block.rev() => {
                    existing.offset = block.offset();
                    continue;
                }
                Some(_) => {
                    state.index.remove(&self.pipeline, &key);
                    changed.push(key);
                }
                None => {}
            }
            state.index.entries.insert(
                key,
                SlotEntry {
                    offset: block.offset(),
                    revision: block.rev(),
                    write: None,
                },
            );
        }

        let tile_size = self.tile_size() as u64;
        let high_water = state
            .index
            .entries
            .values()
            .map(|entry| entry.offset + tile_size)
            .max()
            .unwrap_or(0);
        state.alloc.reset_to(high_water);

        let tiles = state.index.len() as u64;
        self.stats.reset_live(tiles, tiles * tile_size);

        debug!(
            path = %self.path.display(),
            rev = state.header.rev(),
            tiles,
            changed = changed.len(),
            "loaded index"
        );
        Ok(changed)
    }

    fn notify(&self, changed: &[TileKey]) {
        let Some(listener) = &self.listener else {
            return;
        };
        let (width, height) = (self.layout.tile_width, self.layout.tile_height);
        for key in changed {
            listener.tile_changed(*key);
            if key.z == 0 {
                let (x, y) = key.pixel_origin(width, height);
                listener.region_changed(Rect::new(x, y, width, height));
            }
        }
    }
}

impl<S: Store> TileBackend for DiskBackend<S> {
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
            self.tile_size(),
            self.config.io_failure_policy,
            &self.path,
        )
    }

    fn set(&self, key: TileKey, tile: &Tile) -> Result<()> {
        check_tile_size(&self.layout, tile)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;
        let (store, target) = self.ensure_exist(state)?;

        let offset = match state.index.get(&key) {
            Some(entry) => entry.offset,
            None => {
                let grant = state.alloc.allocate()?;
                self.queue_grow(target, grant.grow_to);
                self.stats.record_alloc(self.tile_size() as u64);
                grant.offset
            }
        };

        let path = &self.path;
        state.index.write(&self.pipeline, target, key, offset, tile, |offset, data| {
            match store.write_direct(offset, data) {
                Ok(done) => Ok(done),
                Err(err) => {
                    warn!(path = %path.display(), offset, error = %err, "direct write failed, queueing");
                    Ok(false)
                }
            }
        })
    }

    fn void(&self, key: TileKey) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.absorb(state)?;
        if let Some(entry) = state.index.remove(&self.pipeline, &key) {
            state.alloc.release(entry.offset);
            self.stats.record_free(self.tile_size() as u64);
            trace!(x = key.x, y = key.y, z = key.z, offset = entry.offset, "voided tile");
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
        let state = &mut *guard;
        self.absorb(state)?;
        let (_, target) = self.ensure_exist(state)?;

        self.write_index(state, target);
        self.pipeline.finish_writing(target);

        debug!(
            path = %self.path.display(),
            rev = state.header.rev(),
            tiles = state.index.len(),
            "flushed buffer"
        );
        self.absorb(state)
    }

    fn stats(&self) -> AllocSnapshot {
        self.stats.snapshot()
    }

    fn extent(&self) -> Option<Rect> {
        Some(self.state.lock().extent)
    }

    fn set_extent(&self, extent: Rect) {
        self.state.lock().extent = extent;
    }
}

impl<S: Store> Drop for DiskBackend<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(target) = state.target.take() {
            self.pipeline.unregister(target);
            trace!(path = %self.path.display(), "closed buffer file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::PixelFormat;
    use std::time::Duration;
    use tempfile::tempdir;

    fn layout() -> TileLayout {
        TileLayout::new(8, 8, PixelFormat::rgba_u8()).unwrap()
    }

    fn pipeline() -> Arc<WriterPipeline> {
        Arc::new(WriterPipeline::new(1 << 20).unwrap())
    }

    fn tile(fill: u8, revision: u32) -> Tile {
        Tile::from_data(vec![fill; 256], revision)
    }

    #[derive(Default)]
    struct Recorder {
        tiles: Mutex<Vec<TileKey>>,
        regions: Mutex<Vec<Rect>>,
    }

    impl ChangeListener for Recorder {
        fn tile_changed(&self, key: TileKey) {
            self.tiles.lock().push(key);
        }

        fn region_changed(&self, rect: Rect) {
            self.regions.lock().push(rect);
        }
    }

    #[test]
    fn file_is_created_lazily() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lazy.buf");
        let backend =
            FileBackend::open(&path, Some(layout()), Arc::default(), pipeline()).unwrap();

        assert!(!path.exists());
        assert!(!backend.exists_on_disk());

        backend.set(TileKey::new(0, 0, 0), &tile(1, 1)).unwrap();
        backend.finish_writing().unwrap();

        assert!(path.exists());
        let header = read_header(&std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(header.rev(), 0);
        assert_eq!(header.tile_width(), 8);
    }

    #[test]
    fn open_without_layout_needs_existing_file() {
        let dir = tempdir().unwrap();

        let result = FileBackend::open(dir.path().join("x.buf"), None, Arc::default(), pipeline());

        assert!(result.is_err());
    }

    #[test]
    fn reopen_takes_layout_from_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("l.buf");
        let pipeline = pipeline();
        {
            let backend =
                FileBackend::open(&path, Some(layout()), Arc::default(), pipeline.clone()).unwrap();
            backend.set_extent(Rect::new(-4, -4, 100, 50));
            backend.flush().unwrap();
        }

        let reopened = FileBackend::open(&path, None, Arc::default(), pipeline.clone()).unwrap();
        assert_eq!(reopened.layout(), &layout());
        assert_eq!(reopened.extent(), Some(Rect::new(-4, -4, 100, 50)));

        let other = TileLayout::new(16, 16, PixelFormat::rgba_u8()).unwrap();
        let err = FileBackend::open(&path, Some(other), Arc::default(), pipeline)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<TileError>(),
            Some(TileError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn garbage_file_is_corrupt_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.buf");
        std::fs::write(&path, vec![0xabu8; 512]).unwrap();

        let err = FileBackend::open(&path, None, Arc::default(), pipeline())
            .err()
            .unwrap();

        assert!(matches!(
            err.downcast_ref::<TileError>(),
            Some(TileError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn flush_bumps_revision_and_writes_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.buf");
        let backend =
            FileBackend::open(&path, Some(layout()), Arc::default(), pipeline()).unwrap();

        for x in 0..3 {
            backend.set(TileKey::new(x, 0, 0), &tile(x as u8, 1)).unwrap();
        }
        backend.flush().unwrap();
        backend.flush().unwrap();

        assert_eq!(backend.revision(), 2);
        let file = std::fs::File::open(&path).unwrap();
        let header = read_header(&file).unwrap();
        assert_eq!(header.rev(), 2);
        let chain = read_chain(&file, header.next()).unwrap();
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn empty_flush_writes_empty_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.buf");
        let backend =
            FileBackend::open(&path, Some(layout()), Arc::default(), pipeline()).unwrap();

        backend.flush().unwrap();

        let header = read_header(&std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(header.next(), 0);
        assert_eq!(header.rev(), 1);
    }

    #[test]
    fn lock_blocks_reload_until_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock.buf");
        let pipeline = pipeline();
        let owner =
            FileBackend::open(&path, Some(layout()), Arc::default(), pipeline.clone()).unwrap();
        owner.set(TileKey::new(0, 0, 0), &tile(1, 1)).unwrap();
        owner.flush().unwrap();

        let config = Arc::new(
            TileConfig::default()
                .with_lock_poll_interval(Duration::from_millis(5))
                .with_lock_timeout(Some(Duration::from_millis(40))),
        );
        let reader = FileBackend::open(&path, None, config, pipeline.clone()).unwrap();

        assert!(owner.try_lock().unwrap());
        assert!(!reader.try_lock().unwrap());
        owner.set(TileKey::new(1, 0, 0), &tile(2, 1)).unwrap();
        owner.flush().unwrap();

        let err = reader.reload().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TileError>(),
            Some(TileError::LockTimeout { .. })
        ));

        assert!(owner.unlock().unwrap());
        assert!(!owner.unlock().unwrap());
        reader.reload().unwrap();
        assert!(reader.exist(TileKey::new(1, 0, 0)).unwrap());
    }

    #[test]
    fn reload_reports_externally_rewritten_tiles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.buf");
        let pipeline = pipeline();
        let writer =
            FileBackend::open(&path, Some(layout()), Arc::default(), pipeline.clone()).unwrap();
        writer.set(TileKey::new(1, 2, 0), &tile(1, 1)).unwrap();
        writer.set(TileKey::new(0, 0, 1), &tile(1, 1)).unwrap();
        writer.flush().unwrap();

        let recorder = Arc::new(Recorder::default());
        let reader = FileBackend::open(&path, None, Arc::default(), pipeline.clone())
            .unwrap()
            .with_listener(recorder.clone());
        assert_eq!(reader.get(TileKey::new(1, 2, 0)).unwrap().unwrap().data()[0], 1);

        writer.set(TileKey::new(1, 2, 0), &tile(9, 5)).unwrap();
        writer.set(TileKey::new(0, 0, 1), &tile(9, 5)).unwrap();
        writer.flush().unwrap();
        reader.reload().unwrap();

        let mut changed = recorder.tiles.lock().clone();
        changed.sort();
        assert_eq!(changed, vec![TileKey::new(0, 0, 1), TileKey::new(1, 2, 0)]);
        assert_eq!(*recorder.regions.lock(), vec![Rect::new(8, 16, 8, 8)]);

        let fresh = reader.get(TileKey::new(1, 2, 0)).unwrap().unwrap();
        assert_eq!(fresh.revision(), 5);
        assert_eq!(fresh.data()[0], 9);

        reader.reload().unwrap();
        assert_eq!(recorder.tiles.lock().len(), 2, "unchanged revision skips reload");
    }

    #[test]
    fn void_releases_slot_for_reuse() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(
            dir.path().join("v.buf"),
            Some(layout()),
            Arc::default(),
            pipeline(),
        )
        .unwrap();
        let a = TileKey::new(0, 0, 0);
        let b = TileKey::new(1, 0, 0);

        backend.set(a, &tile(1, 1)).unwrap();
        let first = backend.state.lock().index.get(&a).unwrap().offset;
        backend.void(a).unwrap();
        backend.set(b, &tile(2, 1)).unwrap();

        assert_eq!(backend.state.lock().index.get(&b).unwrap().offset, first);
        assert_eq!(backend.stats().tiles, 1);
        assert_eq!(backend.stats().peak_tiles, 1);
    }

    #[test]
    fn mapped_backend_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.buf");
        let pipeline = pipeline();
        {
            let backend =
                MappedBackend::open(&path, Some(layout()), Arc::default(), pipeline.clone())
                    .unwrap();
            for x in 0..5 {
                backend.set(TileKey::new(x, x, 0), &tile(x as u8 + 1, 2)).unwrap();
            }
            backend.flush().unwrap();
            // The queue is idle now, so this one goes straight into the map.
            backend.set(TileKey::new(0, 0, 0), &tile(42, 3)).unwrap();
            assert_eq!(backend.get(TileKey::new(0, 0, 0)).unwrap().unwrap().data()[0], 42);
            backend.flush().unwrap();
        }

        let reopened = MappedBackend::open(&path, None, Arc::default(), pipeline).unwrap();
        for x in 1..5 {
            let got = reopened.get(TileKey::new(x, x, 0)).unwrap().unwrap();
            assert_eq!(got.data(), &[x as u8 + 1; 256][..]);
        }
        assert_eq!(reopened.get(TileKey::new(0, 0, 0)).unwrap().unwrap().data()[0], 42);
    }
}
