//! Heap consistency checker and statistics.

use log::error;

use crate::{
  ALIGNMENT,
  block::{Block, MIN_BLOCK_SIZE, OVERHEAD, WORD_SIZE, pack},
  error::HeapViolation,
  free_list::{CLASS_COUNT, class_of},
  heap::Heap,
  region::Region,
};

/// Snapshot of the blocks between the prologue and the epilogue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes obtained from the region, sentinels included.
  pub region_bytes: usize,
  pub blocks: usize,
  pub allocated_blocks: usize,
  /// Allocated block bytes, tags included.
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

impl<R: Region> Heap<R> {
  /// Runs [`Heap::verify`] if [`crate::HeapConfig::check_heap`] is set and
  /// logs the first violation, tagged with `context` (usually `line!()`).
  ///
  /// Always `true` when checking is disabled.
  pub fn check_heap(
    &self,
    context: u32,
  ) -> bool {
    if !self.config.check_heap {
      return true;
    }

    match self.verify() {
      Ok(()) => true,
      Err(violation) => {
        error!("heap check failed at {}: {}", context, violation);
        false
      }
    }
  }

  /// Walks the whole heap and every free list, returning the first broken
  /// invariant. Reports only; nothing is repaired.
  pub fn verify(&self) -> Result<(), HeapViolation> {
    let low = self.region.low() as usize;
    let high = self.region.high() as usize;
    let prologue = self.prologue;

    unsafe {
      if prologue.header_word() != pack(OVERHEAD, true)
        || prologue.footer_word() != pack(OVERHEAD, true)
      {
        return Err(HeapViolation::BadPrologue {
          address: prologue.addr(),
        });
      }

      let mut walked_free = 0;
      let mut prev_free = false;
      let mut block = prologue.next();

      loop {
        let address = block.addr();
        if address < low + WORD_SIZE || address > high {
          return Err(HeapViolation::OutOfBounds { address });
        }

        let size = block.size();
        if size == 0 {
          break;
        }

        if address % ALIGNMENT != 0 {
          return Err(HeapViolation::Misaligned { address });
        }
        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 || address + size > high {
          return Err(HeapViolation::BadSize { address, size });
        }

        let header = block.header_word();
        let footer = block.footer_word();
        if header != footer {
          return Err(HeapViolation::TagMismatch {
            address,
            header,
            footer,
          });
        }

        let free = !block.is_allocated();
        if free {
          if prev_free {
            return Err(HeapViolation::AdjacentFree { address });
          }
          if !self.lists.contains(block) {
            return Err(HeapViolation::Unlisted { address, size });
          }
          walked_free += 1;
        }

        prev_free = free;
        block = block.next();
      }

      let epilogue = block;
      if !epilogue.is_allocated() {
        return Err(HeapViolation::BadEpilogue {
          address: epilogue.addr(),
        });
      }

      // Everything from the prologue header to the end of the epilogue
      // header must be covered by blocks.
      let covered = epilogue.addr() - prologue.header() as usize;
      let expected = high - prologue.header() as usize;
      if covered != expected {
        return Err(HeapViolation::ExtentMismatch { covered, expected });
      }

      let listed = self.verify_lists(low, high)?;
      if listed != walked_free {
        return Err(HeapViolation::FreeCountMismatch {
          walked: walked_free,
          listed,
        });
      }
    }

    Ok(())
  }

  /// Checks every list node and returns the number of listed blocks.
  unsafe fn verify_lists(
    &self,
    low: usize,
    high: usize,
  ) -> Result<usize, HeapViolation> {
    let in_region = |block: Block| block.addr() > low + WORD_SIZE && block.addr() < high;
    let mut listed = 0;

    unsafe {
      for class in 0..CLASS_COUNT {
        let mut pred: Option<Block> = None;
        let mut current = self.lists.head(class);

        while let Some(block) = current {
          let address = block.addr();
          if !in_region(block) {
            return Err(HeapViolation::BrokenLink { address });
          }
          if block.is_allocated() {
            return Err(HeapViolation::ListedAllocated { address });
          }

          let size = block.size();
          if class_of(size) != class {
            return Err(HeapViolation::WrongClass {
              address,
              size,
              class,
            });
          }
          if block.pred() != pred {
            return Err(HeapViolation::BrokenLink { address });
          }

          listed += 1;
          pred = current;
          current = block.succ();
        }
      }
    }

    Ok(listed)
  }

  /// Counts blocks and bytes by state.
  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      region_bytes: self.region.len(),
      ..HeapStats::default()
    };

    unsafe {
      let mut block = self.prologue.next();
      while block.size() > 0 {
        let size = block.size();
        stats.blocks += 1;

        if block.is_allocated() {
          stats.allocated_blocks += 1;
          stats.allocated_bytes += size;
        } else {
          stats.free_blocks += 1;
          stats.free_bytes += size;
          stats.largest_free = stats.largest_free.max(size);
        }

        block = block.next();
      }
    }

    stats
  }
}

#[cfg(test)]
mod tests {
  use std::ptr::NonNull;

  use crate::{ALIGNMENT, Heap, HeapConfig, block::Block, error::HeapViolation, region::ArenaRegion};

  fn heap() -> Heap<ArenaRegion> {
    Heap::new(ArenaRegion::new(1 << 16)).unwrap()
  }

  #[test]
  fn test_check_heap_disabled_is_noop() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap().unwrap();

    // Corrupt the footer; an unchecked heap does not notice.
    unsafe {
      let block = Block::from_payload(a);
      block.footer().cast::<usize>().write(0);
    }
    assert!(heap.check_heap(line!()));
    assert!(heap.verify().is_err());
  }

  #[test]
  fn test_detects_tag_mismatch() {
    let mut heap = Heap::with_config(
      ArenaRegion::new(1 << 16),
      HeapConfig::new().with_heap_check(true),
    )
    .unwrap();
    let a = heap.allocate(64).unwrap().unwrap();

    unsafe {
      Block::from_payload(a).footer().cast::<usize>().write(0x50);
    }

    assert!(!heap.check_heap(line!()));
    assert!(matches!(
      heap.verify(),
      Err(HeapViolation::TagMismatch {
        header: 0x51,
        footer: 0x50,
        ..
      })
    ));
  }

  #[test]
  fn test_detects_adjacent_free() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap().unwrap();
    let _guard = heap.allocate(8).unwrap();

    // Free `a` and its neighbour by hand, bypassing the coalescer.
    unsafe {
      for block in [Block::from_payload(a), Block::from_payload(a).next()] {
        block.set_tags(block.size(), false);
        heap.lists.insert(block);
      }
    }

    assert!(matches!(
      heap.verify(),
      Err(HeapViolation::AdjacentFree { .. })
    ));
  }

  #[test]
  fn test_detects_unlisted_free_block() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap().unwrap();
    let _guard = heap.allocate(8).unwrap();

    unsafe {
      let block = Block::from_payload(a);
      block.set_tags(block.size(), false);
    }

    assert!(matches!(
      heap.verify(),
      Err(HeapViolation::Unlisted { size: 80, .. })
    ));
  }

  #[test]
  fn test_detects_bad_prologue() {
    let heap = heap();
    unsafe {
      heap.prologue.header().cast::<usize>().write(0);
    }
    assert!(matches!(heap.verify(), Err(HeapViolation::BadPrologue { .. })));
  }

  #[test]
  fn test_stats() {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    let _c = heap.allocate(8).unwrap();
    unsafe { heap.free(a) };

    let stats = heap.stats();
    assert_eq!(stats.blocks, 4);
    assert_eq!(stats.allocated_blocks, 2);
    assert_eq!(stats.allocated_bytes, 224 + 32);
    assert_eq!(stats.free_blocks, 2);
    assert_eq!(stats.free_bytes, 2048 - 224 - 32);
    assert_eq!(stats.largest_free, 2048 - 128 - 224 - 32);
    assert_eq!(stats.region_bytes, 2048 + 32);

    let b = b.map(NonNull::as_ptr).unwrap();
    assert_eq!(b as usize % ALIGNMENT, 0);
  }
}
