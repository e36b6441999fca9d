use std::ptr::{self, NonNull};

use log::{debug, trace};

use crate::{
  ALIGNMENT,
  block::{Block, MIN_BLOCK_SIZE, OVERHEAD, WORD_SIZE},
  coalesce::coalesce,
  config::HeapConfig,
  error::{HeapError, HeapResult},
  free_list::FreeLists,
  region::Region,
};

/// A boundary-tag heap over one growable [`Region`].
///
/// Layout of the region right after [`Heap::new`]:
///
/// ```text
///   ┌─────┬──────────┬──────────┬──────────────────────────┬──────────┐
///   │ pad │ 16 | 1   │ 16 | 1   │   free block (chunk)     │  0 | 1   │
///   └─────┴──────────┴──────────┴──────────────────────────┴──────────┘
///          prologue header+footer                            epilogue
/// ```
///
/// `pad` is one word plus whatever is needed to bring the region start to
/// [`ALIGNMENT`], so every payload address is 16-byte aligned.
///
/// A `Heap` is single-threaded. Wrap it in [`crate::LockedHeap`] to share it.
pub struct Heap<R: Region> {
  pub(crate) region: R,
  pub(crate) lists: FreeLists,
  /// Payload address of the prologue.
  pub(crate) prologue: Block,
  pub(crate) config: HeapConfig,
}

unsafe impl<R: Region + Send> Send for Heap<R> {}

impl<R: Region> Heap<R> {
  /// Builds a heap with the default configuration.
  pub fn new(region: R) -> HeapResult<Self> {
    Self::with_config(region, HeapConfig::default())
  }

  /// Lays down the prologue and epilogue and grows the region by one chunk.
  pub fn with_config(
    mut region: R,
    config: HeapConfig,
  ) -> HeapResult<Self> {
    let pad = (ALIGNMENT - region.high() as usize % ALIGNMENT) % ALIGNMENT;
    let sentinels = 4 * WORD_SIZE;

    let start = region.grow(pad + sentinels).ok_or(HeapError::OutOfMemory {
      requested: pad + sentinels,
    })?;

    let prologue = unsafe {
      let start = start.add(pad);
      start.cast::<usize>().write(0);
      let prologue = Block::from_payload(start.add(2 * WORD_SIZE));
      prologue.set_tags(OVERHEAD, true);
      prologue.next().set_header(0, true);
      prologue
    };

    let mut heap = Self {
      region,
      lists: FreeLists::new(),
      prologue,
      config,
    };

    heap.extend(heap.config.normalized_chunk_size())?;
    heap.check_heap(line!());

    Ok(heap)
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn region(&self) -> &R {
    &self.region
  }

  /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
  ///
  /// Returns `Ok(None)` when `size` is zero.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> HeapResult<Option<NonNull<u8>>> {
    if size == 0 {
      return Ok(None);
    }

    let asize = adjusted_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;

    let block = match unsafe { self.lists.find_fit(asize) } {
      Some(block) => block,
      None => self.extend(asize.max(self.config.normalized_chunk_size()))?,
    };

    unsafe { self.place(block, asize) };
    self.check_heap(line!());

    Ok(Some(block.payload()))
  }

  /// Allocates `count * size` zeroed bytes.
  pub fn zeroed_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> HeapResult<Option<NonNull<u8>>> {
    let bytes = count
      .checked_mul(size)
      .ok_or(HeapError::SizeOverflow { count, size })?;

    let address = self.allocate(bytes)?;
    if let Some(address) = address {
      unsafe { ptr::write_bytes(address.as_ptr(), 0, bytes) };
    }

    Ok(address)
  }

  /// Returns a block to the heap. `None` is ignored.
  ///
  /// # Safety
  ///
  /// `address` must have been returned by this heap and not freed since.
  pub unsafe fn free(
    &mut self,
    address: Option<NonNull<u8>>,
  ) {
    let Some(address) = address else {
      return;
    };

    unsafe {
      let block = Block::from_payload(address);
      block.set_tags(block.size(), false);
      coalesce(&mut self.lists, block);
    }

    self.check_heap(line!());
  }

  /// Changes the size of an allocation, preserving its contents up to the
  /// smaller of the old and new sizes.
  ///
  /// A `None` address allocates; a zero `size` frees and returns `Ok(None)`.
  /// The block is resized in place when it shrinks or when its successor is
  /// free and big enough, otherwise it is moved. On error the original
  /// allocation is left untouched.
  ///
  /// # Safety
  ///
  /// Same as [`Heap::free`].
  pub unsafe fn resize(
    &mut self,
    address: Option<NonNull<u8>>,
    size: usize,
  ) -> HeapResult<Option<NonNull<u8>>> {
    let Some(address) = address else {
      return self.allocate(size);
    };

    if size == 0 {
      unsafe { self.free(Some(address)) };
      return Ok(None);
    }

    let asize = adjusted_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;
    let block = Block::from_payload(address);

    unsafe {
      let current = block.size();

      if asize <= current {
        self.trim(block, current, asize);
        self.check_heap(line!());
        return Ok(Some(address));
      }

      let next = block.next();
      if !next.is_allocated() {
        let combined = current + next.size();
        if combined >= asize {
          self.lists.remove(next);
          block.set_tags(combined, true);
          self.trim(block, combined, asize);
          self.check_heap(line!());
          return Ok(Some(address));
        }
      }

      let Some(moved) = self.allocate(size)? else {
        return Ok(None);
      };

      let count = (current - OVERHEAD).min(size);
      ptr::copy_nonoverlapping(address.as_ptr(), moved.as_ptr(), count);
      self.free(Some(address));

      Ok(Some(moved))
    }
  }

  /// Payload bytes usable through `address`.
  ///
  /// # Safety
  ///
  /// `address` must be a live allocation of this heap.
  pub unsafe fn usable_size(
    &self,
    address: NonNull<u8>,
  ) -> usize {
    unsafe { Block::from_payload(address).size() - OVERHEAD }
  }

  /// Grows the region by `bytes` and returns the resulting free block,
  /// already merged with a free block that ended at the old epilogue.
  fn extend(
    &mut self,
    bytes: usize,
  ) -> HeapResult<Block> {
    let Some(start) = self.region.grow(bytes) else {
      debug!("region refused to grow by {} bytes", bytes);
      return Err(HeapError::OutOfMemory { requested: bytes });
    };

    trace!("region grew by {} bytes at {:?}", bytes, start);

    unsafe {
      // The old epilogue header becomes the header of the new block.
      let block = Block::from_payload(start);
      block.set_tags(bytes, false);
      block.next().set_header(0, true);
      Ok(coalesce(&mut self.lists, block))
    }
  }

  /// Marks `asize` bytes of a free block allocated, returning any large
  /// enough tail to the free lists.
  unsafe fn place(
    &mut self,
    block: Block,
    asize: usize,
  ) {
    unsafe {
      let size = block.size();
      self.lists.remove(block);

      if size - asize >= MIN_BLOCK_SIZE {
        block.set_tags(asize, true);
        let rest = block.next();
        rest.set_tags(size - asize, false);
        self.lists.insert(rest);
        trace!("split {} byte block at {:#x} for {}", size, block.addr(), asize);
      } else {
        block.set_tags(size, true);
      }
    }
  }

  /// Shrinks an allocated block spanning `size` bytes to `asize`, freeing
  /// the tail when it can hold a block of its own.
  unsafe fn trim(
    &mut self,
    block: Block,
    size: usize,
    asize: usize,
  ) {
    unsafe {
      if size - asize < MIN_BLOCK_SIZE {
        return;
      }

      block.set_tags(asize, true);
      let rest = block.next();
      rest.set_tags(size - asize, false);
      coalesce(&mut self.lists, rest);
    }
  }
}

/// Block size needed for a `size` byte payload: header and footer included,
/// rounded up to [`ALIGNMENT`], never below [`MIN_BLOCK_SIZE`].
fn adjusted_size(size: usize) -> Option<usize> {
  if size <= 2 * WORD_SIZE {
    return Some(MIN_BLOCK_SIZE);
  }

  let size = size.checked_add(OVERHEAD + ALIGNMENT - 1)?;
  if size > isize::MAX as usize {
    return None;
  }
  Some(size & !(ALIGNMENT - 1))
}
