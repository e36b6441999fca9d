//! Boundary-tag block layout.
//!
//! Every block starts with a header word and ends with a footer word, both
//! holding `size | allocated`. Sizes are multiples of 16, so the low four
//! bits of a tag are always free for flags; only bit 0 is used.
//!
//! ```text
//!            ┌────────────┬──────────────────────────────┬────────────┐
//!  allocated │ size  | 1  │          payload             │ size  | 1  │
//!            └────────────┴──────────────────────────────┴────────────┘
//!            ┌────────────┬──────┬──────┬────────────────┬────────────┐
//!  free      │ size  | 0  │ pred │ succ │     unused     │ size  | 0  │
//!            └────────────┴──────┴──────┴────────────────┴────────────┘
//!                         ▲
//!                         └── payload address, the block's identity
//! ```
//!
//! All raw word accesses of the allocator go through this module.

use std::ptr::{self, NonNull};

/// Width of a header, footer or link word.
pub(crate) const WORD_SIZE: usize = 8;

/// Header plus footer.
pub(crate) const OVERHEAD: usize = 2 * WORD_SIZE;

/// Header, footer and the two free-list links.
pub(crate) const MIN_BLOCK_SIZE: usize = 4 * WORD_SIZE;

const ALLOCATED_BIT: usize = 0x1;
const SIZE_MASK: usize = !0xf;

/// Packs a block size and allocated flag into a tag word.
#[inline]
pub(crate) fn pack(
  size: usize,
  allocated: bool,
) -> usize {
  size | allocated as usize
}

/// Splits a tag word back into `(size, allocated)`.
#[inline]
pub(crate) fn unpack(word: usize) -> (usize, bool) {
  (word & SIZE_MASK, word & ALLOCATED_BIT != 0)
}

#[inline]
unsafe fn get(address: *const u8) -> usize {
  unsafe { address.cast::<usize>().read() }
}

#[inline]
unsafe fn put(
  address: *mut u8,
  word: usize,
) {
  unsafe { address.cast::<usize>().write(word) }
}

/// A block, named by its payload address.
///
/// `Block` is a plain address; every accessor that touches memory is
/// `unsafe` and requires the address to be the payload of a block inside a
/// live heap region with a readable header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
  #[inline]
  pub fn from_payload(payload: NonNull<u8>) -> Self {
    Self(payload)
  }

  #[inline]
  pub fn payload(self) -> NonNull<u8> {
    self.0
  }

  #[inline]
  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  pub fn header(self) -> *mut u8 {
    self.0.as_ptr().wrapping_sub(WORD_SIZE)
  }

  /// Requires the header to be written already.
  #[inline]
  pub unsafe fn footer(self) -> *mut u8 {
    unsafe { self.0.as_ptr().add(self.size()).sub(OVERHEAD) }
  }

  #[inline]
  pub unsafe fn header_word(self) -> usize {
    unsafe { get(self.header()) }
  }

  #[inline]
  pub unsafe fn footer_word(self) -> usize {
    unsafe { get(self.footer()) }
  }

  #[inline]
  pub unsafe fn size(self) -> usize {
    unsafe { unpack(self.header_word()).0 }
  }

  #[inline]
  pub unsafe fn is_allocated(self) -> bool {
    unsafe { unpack(self.header_word()).1 }
  }

  /// Writes the header, then the footer at the position implied by `size`.
  #[inline]
  pub unsafe fn set_tags(
    self,
    size: usize,
    allocated: bool,
  ) {
    unsafe {
      put(self.header(), pack(size, allocated));
      put(self.footer(), pack(size, allocated));
    }
  }

  /// Writes only the header. Used for the zero-sized epilogue.
  #[inline]
  pub unsafe fn set_header(
    self,
    size: usize,
    allocated: bool,
  ) {
    unsafe { put(self.header(), pack(size, allocated)) }
  }

  #[inline]
  pub unsafe fn next(self) -> Block {
    unsafe { Block(self.0.add(self.size())) }
  }

  /// Tag word of the block physically before this one (its footer).
  #[inline]
  pub unsafe fn prev_footer_word(self) -> usize {
    unsafe { get(self.0.as_ptr().sub(OVERHEAD)) }
  }

  /// Only valid when the previous block's footer is maintained, which holds
  /// for every block including the prologue.
  #[inline]
  pub unsafe fn prev(self) -> Block {
    unsafe {
      let (size, _) = unpack(self.prev_footer_word());
      Block(self.0.sub(size))
    }
  }

  #[inline]
  pub unsafe fn prev_is_allocated(self) -> bool {
    unsafe { unpack(self.prev_footer_word()).1 }
  }

  // Free-list links live in the first two payload words of a free block.

  #[inline]
  pub unsafe fn pred(self) -> Option<Block> {
    unsafe { NonNull::new(self.link_slot(0).read()).map(Block) }
  }

  #[inline]
  pub unsafe fn succ(self) -> Option<Block> {
    unsafe { NonNull::new(self.link_slot(1).read()).map(Block) }
  }

  #[inline]
  pub unsafe fn set_pred(
    self,
    pred: Option<Block>,
  ) {
    unsafe { self.link_slot(0).write(link(pred)) }
  }

  #[inline]
  pub unsafe fn set_succ(
    self,
    succ: Option<Block>,
  ) {
    unsafe { self.link_slot(1).write(link(succ)) }
  }

  #[inline]
  unsafe fn link_slot(
    self,
    index: usize,
  ) -> *mut *mut u8 {
    unsafe { self.0.as_ptr().cast::<*mut u8>().add(index) }
  }
}

#[inline]
fn link(block: Option<Block>) -> *mut u8 {
  block.map_or(ptr::null_mut(), |b| b.0.as_ptr())
}
