//! Physical page-frame allocation with per-CPU freelists and per-frame
//! reference counts.
//!
//! The allocator serves whole frames of `PAGE_SIZE` bytes out of one
//! contiguous region of physical memory. Each CPU owns a freelist shard, so
//! the common path takes only the local lock; an empty shard steals from its
//! neighbors. A table of reference counts, carved out of the front of the
//! managed region, tracks how many holders each frame has; a frame returns
//! to a freelist exactly when its count drops to zero.

#![cfg_attr(not(test), no_std)]

mod frame_allocator;

pub use self::frame_allocator::{FrameAllocator, FreeList};
