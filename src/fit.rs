use crate::{
  block::Block,
  free_list::{CLASS_COUNT, FreeLists, class_of},
};

impl FreeLists {
  /// Finds a free block of at least `size` bytes.
  ///
  /// Classes are scanned upwards starting at `class_of(size)`. Inside a
  /// class the smallest fitting block wins and an exact match stops the
  /// search immediately. Every block of a higher class is larger than any
  /// block of a lower one, so the first class holding a candidate ends the
  /// scan.
  ///
  /// # Safety
  ///
  /// The lists must be well formed.
  pub unsafe fn find_fit(
    &self,
    size: usize,
  ) -> Option<Block> {
    unsafe {
      for class in class_of(size)..CLASS_COUNT {
        let mut best: Option<(Block, usize)> = None;

        for block in self.iter(class) {
          let block_size = block.size();
          if block_size == size {
            return Some(block);
          }
          if block_size > size && best.is_none_or(|(_, best_size)| block_size < best_size) {
            best = Some((block, block_size));
          }
        }

        if let Some((block, _)) = best {
          return Some(block);
        }
      }

      None
    }
  }
}
