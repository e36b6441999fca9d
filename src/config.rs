//! Heap configuration.

use crate::block::MIN_BLOCK_SIZE;

/// Tunables of a [`crate::Heap`]. Fixed once the heap is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Minimum number of bytes the region grows by when no free block fits.
  ///
  /// Default: 2048. Rounded up to a multiple of 16 and to at least one
  /// minimum block.
  pub chunk_size: usize,

  /// Run [`crate::Heap::check_heap`] after every public operation.
  ///
  /// Default: false. When off, `check_heap` returns `true` without walking
  /// the heap.
  pub check_heap: bool,
}

impl HeapConfig {
  /// Default growth chunk in bytes.
  pub const DEFAULT_CHUNK_SIZE: usize = 2048;

  pub fn new() -> Self {
    Self {
      chunk_size: Self::DEFAULT_CHUNK_SIZE,
      check_heap: false,
    }
  }

  pub fn with_chunk_size(
    mut self,
    chunk_size: usize,
  ) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  pub fn with_heap_check(
    mut self,
    enabled: bool,
  ) -> Self {
    self.check_heap = enabled;
    self
  }

  /// Growth chunk as the heap uses it.
  pub fn normalized_chunk_size(&self) -> usize {
    crate::align!(self.chunk_size.clamp(MIN_BLOCK_SIZE, isize::MAX as usize / 2))
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = HeapConfig::default();
    assert_eq!(config.chunk_size, 2048);
    assert!(!config.check_heap);
    assert_eq!(config.normalized_chunk_size(), 2048);
  }

  #[test]
  fn test_chunk_size_is_normalized() {
    assert_eq!(HeapConfig::new().with_chunk_size(0).normalized_chunk_size(), 32);
    assert_eq!(HeapConfig::new().with_chunk_size(1000).normalized_chunk_size(), 1008);
    assert_eq!(HeapConfig::new().with_chunk_size(4096).normalized_chunk_size(), 4096);
  }
}
