//! # Backing Stores
//!
//! A [`Store`] is the file a disk backend keeps its tiles in. Two flavours:
//!
//! - [`FileStore`]: positioned `pread`/`pwrite` on a plain file. Also used for
//!   the shared swap file.
//! - [`MappedStore`]: the file is memory-mapped; tile writes may be copied
//!   straight into the mapping, and a resize remaps it.
//!
//! Both are [`WriteTarget`]s driven by the writer thread and [`ReadAt`]
//! sources for `get`.
//!
//! ## Resizing
//!
//! `truncate(len)` only ever grows the file. The slot allocator may be reset
//! below the real file size after an index reload, and shrinking would cut off
//! the index chain the header still points at.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::trace;

use crate::format::ReadAt;
use crate::pipeline::WriteTarget;

pub trait Store: WriteTarget + ReadAt + Sized + 'static {
    const KIND: &'static str;

    /// Creates (or empties) the file at `path`.
    fn create(path: &Path) -> Result<Self>;

    fn open(path: &Path) -> Result<Self>;

    /// Writes without going through the writer thread. Returns false if this
    /// store cannot, in which case the caller queues the write.
    fn write_direct(&self, _offset: u64, _data: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

fn open_file(path: &Path, create: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(create)
        .open(path)
        .wrap_err_with(|| format!("failed to open buffer file '{}'", path.display()))
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
}

impl Store for FileStore {
    const KIND: &'static str = "file";

    fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: open_file(path, true)?,
        })
    }

    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: open_file(path, false)?,
        })
    }
}

impl WriteTarget for FileStore {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", data.len(), offset))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let current = self.file.metadata().wrap_err("failed to stat buffer file")?.len();
        if len > current {
            trace!(path = %self.path.display(), len, "growing file");
            self.file
                .set_len(len)
                .wrap_err_with(|| format!("failed to extend file to {} bytes", len))?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync buffer file")
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadAt for FileStore {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        ReadAt::read_exact_at(&self.file, buf, offset)
    }

    fn byte_len(&self) -> Result<u64> {
        self.file.byte_len()
    }
}

/// Memory-mapped buffer file.
///
/// The mapping is absent while the file is empty (a zero-length map is not
/// allowed) and is replaced whenever the file grows.
#[derive(Debug)]
pub struct MappedStore {
    path: PathBuf,
    file: File,
    map: RwLock<Option<MmapMut>>,
}

impl MappedStore {
    fn from_file(path: &Path, file: File) -> Result<Self> {
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();
        let map = if len > 0 { Some(Self::map(path, &file)?) } else { None };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map: RwLock::new(map),
        })
    }

    fn map(path: &Path, file: &File) -> Result<MmapMut> {
        // SAFETY: MmapMut::map_mut is unsafe because the file may be modified
        // externally. This is acceptable because:
        // 1. Buffer files are shared only under the cooperative header lock
        // 2. Every access goes through the RwLock and bounds-checks the range
        // 3. The old mapping is dropped under the write lock before remapping
        unsafe {
            MmapMut::map_mut(file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))
        }
    }

    pub fn mapped_len(&self) -> usize {
        self.map.read().as_ref().map_or(0, |m| m.len())
    }
}

fn range_in(len: usize, offset: u64, size: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(size)?;
    (end <= len).then_some(start..end)
}

impl Store for MappedStore {
    const KIND: &'static str = "mmap";

    fn create(path: &Path) -> Result<Self> {
        Self::from_file(path, open_file(path, true)?)
    }

    fn open(path: &Path) -> Result<Self> {
        Self::from_file(path, open_file(path, false)?)
    }

    fn write_direct(&self, offset: u64, data: &[u8]) -> Result<bool> {
        let mut guard = self.map.write();
        let Some(map) = guard.as_mut() else {
            return Ok(false);
        };
        match range_in(map.len(), offset, data.len()) {
            Some(range) => {
                map[range].copy_from_slice(data);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl WriteTarget for MappedStore {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.write_direct(offset, data)? {
            return Ok(());
        }
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", data.len(), offset))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut guard = self.map.write();
        let current = self.file.metadata().wrap_err("failed to stat buffer file")?.len();
        if len <= current && guard.is_some() {
            return Ok(());
        }

        if let Some(old) = guard.take() {
            old.flush().wrap_err("failed to flush mmap before grow")?;
        }
        if len > current {
            self.file
                .set_len(len)
                .wrap_err_with(|| format!("failed to extend file to {} bytes", len))?;
        }
        *guard = Some(Self::map(&self.path, &self.file)?);
        trace!(path = %self.path.display(), len, "remapped file");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if let Some(map) = self.map.read().as_ref() {
            map.flush().wrap_err("failed to sync mmap to disk")?;
        }
        self.file.sync_data().wrap_err("failed to sync buffer file")
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadAt for MappedStore {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if let Some(map) = self.map.read().as_ref() {
            if let Some(range) = range_in(map.len(), offset, buf.len()) {
                buf.copy_from_slice(&map[range]);
                return Ok(());
            }
        }
        ReadAt::read_exact_at(&self.file, buf, offset)
    }

    fn byte_len(&self) -> Result<u64> {
        self.file.byte_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_truncate_only_grows() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(&dir.path().join("a.buf")).unwrap();

        store.truncate(4096).unwrap();
        store.truncate(100).unwrap();

        assert_eq!(store.byte_len().unwrap(), 4096);
    }

    #[test]
    fn file_store_write_then_read() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(&dir.path().join("a.buf")).unwrap();

        store.write_at(300, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        ReadAt::read_exact_at(&store, &mut out, 300).unwrap();

        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn mapped_store_starts_unmapped_and_remaps_on_grow() {
        let dir = tempdir().unwrap();
        let store = MappedStore::create(&dir.path().join("m.buf")).unwrap();

        assert_eq!(store.mapped_len(), 0);
        assert!(!store.write_direct(0, &[1]).unwrap());

        store.truncate(8192).unwrap();
        assert_eq!(store.mapped_len(), 8192);
        assert!(store.write_direct(4096, &[7; 16]).unwrap());
        assert!(!store.write_direct(8190, &[7; 16]).unwrap());

        let mut out = [0u8; 16];
        ReadAt::read_exact_at(&store, &mut out, 4096).unwrap();
        assert_eq!(out, [7; 16]);
    }

    #[test]
    fn mapped_store_writes_past_map_go_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.buf");
        let store = MappedStore::create(&path).unwrap();

        store.write_at(0, &[9; 256]).unwrap();
        store.sync().unwrap();
        drop(store);

        let reopened = MappedStore::open(&path).unwrap();
        assert_eq!(reopened.mapped_len(), 256);
        let mut out = [0u8; 4];
        ReadAt::read_exact_at(&reopened, &mut out, 252).unwrap();
        assert_eq!(out, [9; 4]);
    }
}
