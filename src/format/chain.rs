//! # Index Chain
//!
//! Reading walks the chain from `header.next` until a block with `next == 0`.
//! Every block is bounds-checked against the file length and the walk is
//! capped at `file_len / 16` steps, so a corrupt or cyclic chain fails with an
//! error instead of looping.
//!
//! Writing uses [`ChainWriter`], which holds one block back: a block's `next`
//! pointer is only known once the following block has been placed, and the
//! last block is emitted with `next = 0`.
//!
//! ```text
//! header.next ──► [blk @ A, next=B] ──► [blk @ B, next=C] ──► [blk @ C, next=0]
//! ```

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::FromBytes;

use super::block::{IndexBlock, TileIndexBlock, BLOCK_FLAG_TILE};
use super::header::BufferHeader;
use crate::config::{BUFFER_HEADER_SIZE, INDEX_BLOCK_SIZE, TILE_INDEX_BLOCK_SIZE};

/// Positioned reads from a file image.
pub trait ReadAt {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn byte_len(&self) -> Result<u64>;
}

impl ReadAt for File {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        FileExt::read_exact_at(self, buf, offset)
            .wrap_err_with(|| format!("failed to read {} bytes at offset {}", buf.len(), offset))
    }

    fn byte_len(&self) -> Result<u64> {
        Ok(self.metadata().wrap_err("failed to stat buffer file")?.len())
    }
}

impl ReadAt for [u8] {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let start = usize::try_from(offset)?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                eyre::eyre!(
                    "read of {} bytes at offset {} past end of image ({} bytes)",
                    buf.len(),
                    offset,
                    self.len()
                )
            })?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }

    fn byte_len(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }
}

pub fn read_header<R: ReadAt + ?Sized>(source: &R) -> Result<BufferHeader> {
    let mut bytes = [0u8; BUFFER_HEADER_SIZE];
    source.read_exact_at(&mut bytes, 0)?;
    BufferHeader::from_bytes(&bytes)
}

/// Returns every tile entry reachable from `first`, in chain order.
pub fn read_chain<R: ReadAt + ?Sized>(source: &R, first: u64) -> Result<Vec<TileIndexBlock>> {
    let file_len = source.byte_len()?;
    let max_steps = file_len / INDEX_BLOCK_SIZE as u64;

    let mut entries = Vec::new();
    let mut offset = first;
    let mut steps = 0u64;

    while offset != 0 {
        steps += 1;
        ensure!(
            steps <= max_steps,
            "index chain longer than the file allows, likely a cycle"
        );
        ensure!(
            offset >= BUFFER_HEADER_SIZE as u64,
            "index block at {} overlaps the header",
            offset
        );
        ensure!(
            offset
                .checked_add(INDEX_BLOCK_SIZE as u64)
                .is_some_and(|end| end <= file_len),
            "index block at {} past end of file ({} bytes)",
            offset,
            file_len
        );

        let mut prefix = [0u8; INDEX_BLOCK_SIZE];
        source.read_exact_at(&mut prefix, offset)?;
        let block = IndexBlock::read_from_bytes(&prefix)
            .map_err(|e| eyre::eyre!("failed to parse IndexBlock: {:?}", e))?;

        ensure!(
            block.length() as usize >= INDEX_BLOCK_SIZE,
            "index block at {} has invalid length {}",
            offset,
            block.length()
        );

        if block.flags() & BLOCK_FLAG_TILE != 0 {
            if block.length() as usize != TILE_INDEX_BLOCK_SIZE {
                bail!(
                    "tile index block at {} has length {}, expected {}",
                    offset,
                    block.length(),
                    TILE_INDEX_BLOCK_SIZE
                );
            }
            ensure!(
                offset + TILE_INDEX_BLOCK_SIZE as u64 <= file_len,
                "tile index block at {} truncated",
                offset
            );
            let mut bytes = [0u8; TILE_INDEX_BLOCK_SIZE];
            source.read_exact_at(&mut bytes, offset)?;
            let entry = TileIndexBlock::read_from_bytes(&bytes)
                .map_err(|e| eyre::eyre!("failed to parse TileIndexBlock: {:?}", e))?;
            entries.push(entry);
        }

        offset = block.next();
    }

    Ok(entries)
}

/// A finished block and where it goes.
#[derive(Debug, Clone, Copy)]
pub struct PlacedBlock<K> {
    pub owner: K,
    pub offset: u64,
    pub block: TileIndexBlock,
}

/// Lays out a chain of tile blocks starting at a given offset.
#[derive(Debug)]
pub struct ChainWriter<K> {
    cursor: u64,
    held: Option<(K, TileIndexBlock)>,
}

impl<K> ChainWriter<K> {
    pub fn new(start: u64) -> Self {
        Self { cursor: start, held: None }
    }

    /// Offset of the first block, the value `header.next` must carry.
    pub fn start(&self) -> u64 {
        self.cursor
    }

    /// Adds a block and returns the previous one, now linked to it.
    pub fn push(&mut self, owner: K, block: TileIndexBlock) -> Option<PlacedBlock<K>> {
        self.advance(Some((owner, block)))
    }

    /// Emits the held block as the end of the chain.
    pub fn finish(mut self) -> Option<PlacedBlock<K>> {
        self.advance(None)
    }

    fn advance(&mut self, incoming: Option<(K, TileIndexBlock)>) -> Option<PlacedBlock<K>> {
        let placed = self.held.take().map(|(owner, mut block)| {
            let end = self.cursor + block.block().length() as u64;
            block.set_next(if incoming.is_some() { end } else { 0 });
            let placed = PlacedBlock {
                owner,
                offset: self.cursor,
                block,
            };
            self.cursor = end;
            placed
        });
        self.held = incoming;
        placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{PixelFormat, TileKey, TileLayout};
    use zerocopy::IntoBytes;

    fn image_with_chain(keys: &[TileKey]) -> (Vec<u8>, u64) {
        let layout = TileLayout::new(4, 4, PixelFormat::rgba_u8()).unwrap();
        let start = 1024u64;
        let mut image = vec![0u8; start as usize + keys.len() * TILE_INDEX_BLOCK_SIZE];

        let mut writer = ChainWriter::new(start);
        let mut placed = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            placed.extend(writer.push(i, TileIndexBlock::new(*key, 256 + 64 * i as u64, 1)));
        }
        placed.extend(writer.finish());

        for p in &placed {
            let at = p.offset as usize;
            image[at..at + TILE_INDEX_BLOCK_SIZE].copy_from_slice(p.block.as_bytes());
        }

        let mut header = BufferHeader::new(&layout);
        header.set_next(if keys.is_empty() { 0 } else { start });
        image[..BUFFER_HEADER_SIZE].copy_from_slice(header.as_bytes());
        (image, start)
    }

    #[test]
    fn writer_links_blocks_and_terminates() {
        let mut writer = ChainWriter::new(1000);
        let a = TileIndexBlock::new(TileKey::new(0, 0, 0), 256, 1);

        assert!(writer.push("a", a).is_none());
        let first = writer.push("b", a).unwrap();
        let second = writer.push("c", a).unwrap();
        let last = writer.finish().unwrap();

        assert_eq!((first.owner, first.offset, first.block.next()), ("a", 1000, 1040));
        assert_eq!((second.owner, second.offset, second.block.next()), ("b", 1040, 1080));
        assert_eq!((last.owner, last.offset, last.block.next()), ("c", 1080, 0));
    }

    #[test]
    fn empty_writer_emits_nothing() {
        let writer: ChainWriter<()> = ChainWriter::new(256);

        assert!(writer.finish().is_none());
    }

    #[test]
    fn chain_reads_back_in_order() {
        let keys = [
            TileKey::new(0, 0, 0),
            TileKey::new(1, 0, 0),
            TileKey::new(-1, 5, 2),
        ];
        let (image, _) = image_with_chain(&keys);

        let header = read_header(image.as_slice()).unwrap();
        let entries = read_chain(image.as_slice(), header.next()).unwrap();

        let read: Vec<TileKey> = entries.iter().map(|e| e.key()).collect();
        assert_eq!(read, keys);
        assert_eq!(entries[2].offset(), 256 + 128);
    }

    #[test]
    fn empty_index_reads_as_no_entries() {
        let (image, _) = image_with_chain(&[]);

        let header = read_header(image.as_slice()).unwrap();

        assert_eq!(header.next(), 0);
        assert!(read_chain(image.as_slice(), 0).unwrap().is_empty());
    }

    #[test]
    fn cyclic_chain_is_rejected() {
        let (mut image, start) = image_with_chain(&[TileKey::new(0, 0, 0)]);
        let at = start as usize + 8;
        image[at..at + 8].copy_from_slice(&start.to_le_bytes());

        assert!(read_chain(image.as_slice(), start).is_err());
    }

    #[test]
    fn out_of_range_pointer_is_rejected() {
        let (image, _) = image_with_chain(&[TileKey::new(0, 0, 0)]);

        assert!(read_chain(image.as_slice(), image.len() as u64 - 4).is_err());
        assert!(read_chain(image.as_slice(), 16).is_err());
    }
}
