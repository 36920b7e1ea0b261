//! # Tile Context
//!
//! Process-level owner of everything the backends share: the runtime
//! [`TileConfig`], the single background [`WriterPipeline`] and the
//! `<pid>-shared.swap` file. Applications create one context at startup and
//! open every buffer through it.
//!
//! ```ignore
//! let ctx = TileContext::new(TileConfig::from_env())?;
//!
//! let scratch = ctx.swap(TileLayout::new(128, 128, PixelFormat::rgba_float())?);
//! let saved = ctx.file("image.gegl", Some(layout))?;
//! ```
//!
//! Dropping the context (after every backend opened through it) drains the
//! writer queue, joins the writer thread and removes the swap file.

use std::path::Path;
use std::sync::Arc;

use eyre::Result;
use tracing::debug;

use crate::backend::{FileBackend, MappedBackend, RamBackend, SwapBackend, SwapFile};
use crate::config::TileConfig;
use crate::pipeline::WriterPipeline;
use crate::tile::TileLayout;
use crate::zoom::ZoomCache;

pub struct TileContext {
    config: Arc<TileConfig>,
    pipeline: Arc<WriterPipeline>,
    swap: Arc<SwapFile>,
}

impl TileContext {
    pub fn new(config: TileConfig) -> Result<Self> {
        let config = Arc::new(config);
        let pipeline = Arc::new(WriterPipeline::new(config.queue_size_limit)?);
        let swap = Arc::new(SwapFile::new(&config, Arc::clone(&pipeline)));
        debug!(
            swap = %swap.path().display(),
            queue_limit = config.queue_size_limit,
            "tile context ready"
        );
        Ok(Self {
            config,
            pipeline,
            swap,
        })
    }

    pub fn config(&self) -> &Arc<TileConfig> {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<WriterPipeline> {
        &self.pipeline
    }

    pub fn swap_file(&self) -> &Arc<SwapFile> {
        &self.swap
    }

    pub fn ram(&self, layout: TileLayout) -> RamBackend {
        RamBackend::new(layout)
    }

    /// Opens or lazily creates a buffer file accessed with `pread`/`pwrite`.
    ///
    /// `layout` may be `None` only for an existing file; its header supplies
    /// the layout.
    pub fn file<P: AsRef<Path>>(&self, path: P, layout: Option<TileLayout>) -> Result<FileBackend> {
        FileBackend::open(path, layout, Arc::clone(&self.config), Arc::clone(&self.pipeline))
    }

    /// Like [`file`](Self::file), with tile data served from a memory map.
    pub fn mapped<P: AsRef<Path>>(
        &self,
        path: P,
        layout: Option<TileLayout>,
    ) -> Result<MappedBackend> {
        MappedBackend::open(path, layout, Arc::clone(&self.config), Arc::clone(&self.pipeline))
    }

    /// A scratch buffer in the shared swap file.
    pub fn swap(&self, layout: TileLayout) -> SwapBackend {
        SwapBackend::new(
            layout,
            Arc::clone(&self.config),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.swap),
        )
    }

    /// A swap buffer with its mipmap pyramid derived on demand.
    pub fn zoomed_swap(&self, layout: TileLayout) -> ZoomCache<SwapBackend> {
        ZoomCache::new(self.swap(layout))
    }
}
