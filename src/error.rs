//! Allocator error types.

use std::io;

use thiserror::Error;

/// Result of a heap operation.
pub type HeapResult<T> = Result<T, HeapError>;

/// Failures surfaced by the heap. None of them leave the heap in an
/// inconsistent state; it stays usable after any of these.
#[derive(Error, Debug)]
pub enum HeapError {
  /// The region could not grow by the bytes needed to satisfy a request.
  #[error("out of memory: requested {requested} bytes")]
  OutOfMemory { requested: usize },

  /// `count * size` does not fit in a `usize`.
  #[error("allocation size overflow: {count} x {size} bytes")]
  SizeOverflow { count: usize, size: usize },

  /// The backing memory for a region could not be obtained.
  #[error("region unavailable: {0}")]
  RegionUnavailable(#[from] io::Error),
}

/// First structural problem found by [`crate::Heap::verify`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapViolation {
  #[error("prologue at 0x{address:x} is damaged")]
  BadPrologue { address: usize },

  #[error("epilogue at 0x{address:x} is damaged")]
  BadEpilogue { address: usize },

  #[error("block at 0x{address:x} lies outside the region")]
  OutOfBounds { address: usize },

  #[error("block at 0x{address:x} is not aligned")]
  Misaligned { address: usize },

  #[error("block at 0x{address:x} has header 0x{header:x} but footer 0x{footer:x}")]
  TagMismatch {
    address: usize,
    header: usize,
    footer: usize,
  },

  #[error("block at 0x{address:x} has invalid size {size}")]
  BadSize { address: usize, size: usize },

  #[error("free blocks at 0x{address:x} and its predecessor were not coalesced")]
  AdjacentFree { address: usize },

  #[error("free block at 0x{address:x} ({size} bytes) is not in its size class list")]
  Unlisted { address: usize, size: usize },

  #[error("block at 0x{address:x} ({size} bytes) is listed in class {class}")]
  WrongClass {
    address: usize,
    size: usize,
    class: usize,
  },

  #[error("allocated block at 0x{address:x} is in a free list")]
  ListedAllocated { address: usize },

  #[error("free list link at 0x{address:x} is broken")]
  BrokenLink { address: usize },

  #[error("heap walk found {walked} free blocks but the lists hold {listed}")]
  FreeCountMismatch { walked: usize, listed: usize },

  #[error("blocks cover {covered} bytes but the region holds {expected}")]
  ExtentMismatch { covered: usize, expected: usize },
}
