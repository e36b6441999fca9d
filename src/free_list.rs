//! Segregated free lists.
//!
//! Free blocks are kept in [`CLASS_COUNT`] doubly linked lists, one per size
//! class. The links are stored inside the free blocks themselves (see
//! [`crate::block`]), so the registry is only an array of list heads.
//!
//! ```text
//!   class:   0     1     2      3           9       10
//!   limit:  ≤32   ≤64  ≤128   ≤256  ...  ≤16384   larger
//!            │     │                                 │
//!            ▼     ▼                                 ▼
//!          ┌───┐ ┌───┐                             ┌────┐
//!          │ F │ │ F │                             │ F  │
//!          └─┬─┘ └───┘                             └─┬──┘
//!            ▼                                       ▼
//!          ┌───┐                                   ┌────┐
//!          │ F │                                   │ F  │
//!          └───┘                                   └────┘
//! ```
//!
//! Insertion is LIFO at the head of the class list.

use log::warn;

use crate::block::Block;

/// Number of size classes.
pub const CLASS_COUNT: usize = 11;

/// Inclusive upper bound of every class but the last one.
const CLASS_LIMITS: [usize; CLASS_COUNT - 1] = [
  32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Returns the size class of a block of `size` bytes.
#[inline]
pub fn class_of(size: usize) -> usize {
  CLASS_LIMITS
    .iter()
    .position(|&limit| size <= limit)
    .unwrap_or(CLASS_COUNT - 1)
}

pub(crate) struct FreeLists {
  heads: [Option<Block>; CLASS_COUNT],
}

impl FreeLists {
  pub const fn new() -> Self {
    Self {
      heads: [None; CLASS_COUNT],
    }
  }

  #[inline]
  pub fn head(
    &self,
    class: usize,
  ) -> Option<Block> {
    self.heads[class]
  }

  /// Pushes `block` on the list of its current size class.
  ///
  /// # Safety
  ///
  /// `block` must be a free block of this heap with a valid header and must
  /// not already be linked.
  pub unsafe fn insert(
    &mut self,
    block: Block,
  ) {
    unsafe {
      let class = class_of(block.size());
      let head = self.heads[class];

      block.set_pred(None);
      block.set_succ(head);

      if let Some(head) = head {
        head.set_pred(Some(block));
      }

      self.heads[class] = Some(block);
    }
  }

  /// Unlinks `block` from the list of its current size class. Returns
  /// `false`, leaving every list untouched, if the block is not found there.
  ///
  /// # Safety
  ///
  /// `block` must have a valid header and every list must be well formed.
  pub unsafe fn remove(
    &mut self,
    block: Block,
  ) -> bool {
    unsafe {
      let class = class_of(block.size());

      if !self.contains_in(class, block) {
        warn!(
          "block {:#x} ({} bytes) is not in free list {}",
          block.addr(),
          block.size(),
          class
        );
        return false;
      }

      let pred = block.pred();
      let succ = block.succ();

      match pred {
        Some(pred) => pred.set_succ(succ),
        None => self.heads[class] = succ,
      }

      if let Some(succ) = succ {
        succ.set_pred(pred);
      }

      true
    }
  }

  /// Whether `block` is linked in the list of its current size class.
  ///
  /// # Safety
  ///
  /// Same as [`FreeLists::remove`].
  pub unsafe fn contains(
    &self,
    block: Block,
  ) -> bool {
    unsafe { self.contains_in(class_of(block.size()), block) }
  }

  unsafe fn contains_in(
    &self,
    class: usize,
    block: Block,
  ) -> bool {
    unsafe { self.iter(class).any(|listed| listed == block) }
  }

  /// Walks one class list from head to tail.
  ///
  /// # Safety
  ///
  /// The lists must not be modified while the iterator is alive, and every
  /// linked block must stay readable.
  pub unsafe fn iter(
    &self,
    class: usize,
  ) -> ClassIter {
    ClassIter {
      current: self.heads[class],
    }
  }
}

pub(crate) struct ClassIter {
  current: Option<Block>,
}

impl Iterator for ClassIter {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.current?;
    // SAFETY: guaranteed by the caller of `FreeLists::iter`.
    self.current = unsafe { block.succ() };
    Some(block)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::ptr::NonNull;

  use super::*;
  use crate::block::WORD_SIZE;

  #[repr(C, align(16))]
  pub(crate) struct Scratch(pub [usize; 256]);

  /// Lays out free blocks of the given sizes back to back in `scratch`.
  pub(crate) unsafe fn carve(
    scratch: &mut Scratch,
    sizes: &[usize],
  ) -> Vec<Block> {
    let base = scratch.0.as_mut_ptr().cast::<u8>();
    let mut blocks = Vec::new();

    unsafe {
      let mut block = Block::from_payload(NonNull::new_unchecked(base.add(WORD_SIZE * 2)));
      for &size in sizes {
        block.set_tags(size, false);
        blocks.push(block);
        block = block.next();
      }
    }

    blocks
  }

  #[test]
  fn test_class_of() {
    assert_eq!(class_of(32), 0);
    assert_eq!(class_of(33), 1);
    assert_eq!(class_of(64), 1);
    assert_eq!(class_of(2048), 6);
    assert_eq!(class_of(2049), 7);
    assert_eq!(class_of(16384), 9);
    assert_eq!(class_of(16385), 10);
    assert_eq!(class_of(usize::MAX & !0xf), 10);
  }

  #[test]
  fn test_class_of_is_monotonic() {
    let mut last = 0;
    for size in (32..40_000).step_by(16) {
      let class = class_of(size);
      assert!(class >= last);
      last = class;
    }
  }

  #[test]
  fn test_insert_is_lifo() {
    let mut scratch = Scratch([0; 256]);
    let mut lists = FreeLists::new();

    unsafe {
      let blocks = carve(&mut scratch, &[48, 48, 64]);
      for &block in &blocks {
        lists.insert(block);
      }

      let listed: Vec<Block> = lists.iter(class_of(48)).collect();
      assert_eq!(listed, vec![blocks[2], blocks[1], blocks[0]]);
    }
  }

  #[test]
  fn test_remove() {
    let mut scratch = Scratch([0; 256]);
    let mut lists = FreeLists::new();

    unsafe {
      let blocks = carve(&mut scratch, &[48, 48, 48, 512]);
      for &block in &blocks {
        lists.insert(block);
      }

      // Middle, tail and head of the same list.
      assert!(lists.remove(blocks[1]));
      assert!(lists.remove(blocks[0]));
      assert!(lists.remove(blocks[2]));
      assert_eq!(lists.head(class_of(48)), None);

      assert!(lists.contains(blocks[3]));
      assert_eq!(lists.iter(class_of(512)).count(), 1);
    }
  }

  #[test]
  fn test_remove_missing_is_noop() {
    let mut scratch = Scratch([0; 256]);
    let mut lists = FreeLists::new();

    unsafe {
      let blocks = carve(&mut scratch, &[48, 48]);
      lists.insert(blocks[0]);

      assert!(!lists.remove(blocks[1]));
      assert_eq!(lists.iter(class_of(48)).collect::<Vec<_>>(), vec![blocks[0]]);
    }
  }
}
