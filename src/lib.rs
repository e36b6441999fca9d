//! # segalloc - A Segregated-Fit Heap Allocator
//!
//! This crate provides a general purpose **boundary-tag allocator** that
//! manages one contiguous, growable memory region, the way `malloc` manages
//! the area above the program break.
//!
//! ## Overview
//!
//! The region is split into blocks. Each block carries its size and state in
//! a header word and a matching footer word, so the neighbours of any block
//! can be found in O(1) in both directions:
//!
//! ```text
//!   ┌─────┬──────────┬────────────┬──────────────────┬────────┬─────────────┬──────────┐
//!   │ pad │ prologue │   alloc    │       free       │ alloc  │    free     │ epilogue │
//!   │     │  16 | 1  │  128 | 1   │     512 | 0      │ 32 | 1 │  1376 | 0   │  0 | 1   │
//!   └─────┴──────────┴────────────┴──────────────────┴────────┴─────────────┴──────────┘
//!    low                                                                         high
//! ```
//!
//! Free blocks are additionally linked into one of 11 size-class lists
//! (`≤32`, `≤64`, ..., `≤16384`, larger). The links live inside the free
//! blocks themselves.
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Header/footer codec and block navigation (internal)
//!   ├── free_list  - Segregated size-class lists (internal)
//!   ├── fit        - Best-fit search over the size classes (internal)
//!   ├── coalesce   - Merging of adjacent free blocks (internal)
//!   ├── heap       - Heap: allocate, free, resize, zeroed_allocate
//!   ├── check      - Consistency checker and statistics
//!   ├── region     - Region trait, ArenaRegion, MmapRegion, SbrkRegion
//!   ├── config     - HeapConfig
//!   ├── error      - HeapError, HeapViolation
//!   └── sync       - LockedHeap (GlobalAlloc)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::{ArenaRegion, Heap};
//!
//! let mut heap = Heap::new(ArenaRegion::new(64 * 1024)).unwrap();
//!
//! let address = heap.allocate(100).unwrap().unwrap();
//! unsafe {
//!   address.as_ptr().write_bytes(0x2a, 100);
//!   let address = heap.resize(Some(address), 400).unwrap();
//!   heap.free(address);
//! }
//!
//! assert!(heap.verify().is_ok());
//! ```
//!
//! ## How It Works
//!
//! - **allocate** rounds the request up to a block size, asks the size-class
//!   lists for the best fitting free block and splits off the unused tail.
//!   If nothing fits, the region grows by at least one chunk (2048 bytes).
//! - **free** marks the block free and immediately merges it with free
//!   neighbours, so no two free blocks are ever adjacent.
//! - **resize** shrinks in place, grows into a free successor when possible
//!   and only moves the data as a last resort.
//!
//! ## Limitations
//!
//! - **Single-threaded**: a [`Heap`] has no internal locking. [`LockedHeap`]
//!   serializes access with a mutex.
//! - **Grow only**: memory is never returned to the region.
//! - **16-byte alignment**: larger alignments are not supported.
//! - **64-bit only**: tags and links are 8-byte words.
//!
//! ## Safety
//!
//! Allocation is safe. Freeing and resizing take raw addresses and are
//! `unsafe`: passing an address that this heap did not hand out, or one that
//! was already freed, corrupts the heap.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("segalloc stores 8-byte tags and requires a 64-bit target");

/// Alignment of every payload address and block size.
pub const ALIGNMENT: usize = 16;

pub mod align;
mod block;
mod check;
mod coalesce;
pub mod config;
pub mod error;
mod fit;
mod free_list;
mod heap;
pub mod region;
mod sync;

pub use check::HeapStats;
pub use config::HeapConfig;
pub use error::{HeapError, HeapResult, HeapViolation};
pub use free_list::{CLASS_COUNT, class_of};
pub use heap::Heap;
#[cfg(unix)]
pub use region::{MmapRegion, SbrkRegion};
pub use region::{ArenaRegion, Region};
pub use sync::LockedHeap;
