//! # On-Disk Format
//!
//! A buffer file is a 256-byte [`BufferHeader`], then tile payloads in
//! fixed-size slots, then (after a flush) a linked chain of index blocks that
//! records where each tile lives.
//!
//! ```text
//! +-----------+--------+--------+-----+--------+----------------------+
//! | header    | tile 0 | tile 1 | ... | tile n | index chain          |
//! | 256 bytes |        |        |     |        | 40 bytes per tile    |
//! +-----------+--------+--------+-----+--------+----------------------+
//! ```
//!
//! The chain is rewritten from scratch on every flush at the current
//! allocation frontier. Old chains are left in place as dead bytes and their
//! space is reused by later tile allocations.

mod block;
mod chain;
mod header;

pub use block::{IndexBlock, TileIndexBlock, BLOCK_FLAG_TILE};
pub use chain::{read_chain, read_header, ChainWriter, PlacedBlock, ReadAt};
pub use header::{BufferHeader, FLAG_FLUSHED, FLAG_IS_HEADER, FLAG_LOCKED};
