//! # Storage Allocation
//!
//! Every persistent backend maps tile identity to a byte offset in its
//! backing file. Two allocators cover the two cases:
//!
//! - [`SlotAllocator`]: fixed-size slots with a LIFO free list and a
//!   bump pointer, used by the per-buffer file and mmap backends
//! - [`GapAllocator`]: variable-length `[start, end)` gaps with coalescing on
//!   release, used by the process-wide swap file shared by buffers of
//!   different tile sizes
//!
//! Both grow their file by 32 tile slots at a time and report the new size to
//! the caller, which queues the resize on the writer pipeline. Neither does
//! I/O or locking itself.

mod gaps;
mod slots;
mod stats;

pub use gaps::{Gap, GapAllocator, GapGrant};
pub use slots::{SlotAllocator, SlotGrant};
pub use stats::{AllocSnapshot, AllocStats};
