//! Growable memory regions backing a [`crate::Heap`].
//!
//! A region is a single contiguous byte range that only grows at its high
//! end, the way the program break does:
//!
//! ```text
//!   low                                   high
//!    │                                      │
//!    ▼                                      ▼
//!    ┌──────────────────────────────────────┬────────────────────┐
//!    │          bytes handed out            │   not yet grown    │
//!    └──────────────────────────────────────┴────────────────────┘
//!                                           ▲
//!                                           └── grow(n) returns this address
//!                                               and moves `high` up by n
//! ```

use std::{
  alloc::{self, Layout},
  ptr::NonNull,
};

use log::trace;

use crate::ALIGNMENT;

/// Source of heap memory.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - `grow(n)` either fails or returns the current `high()`, after which
///   `high()` is `n` bytes further up. Successive growths are contiguous.
/// - Every byte in `low()..high()` stays readable and writable, and is never
///   moved or handed out to anyone else, for as long as the region lives.
pub unsafe trait Region {
  /// Extends the region by `bytes`, returning the start of the new bytes.
  /// Their contents are unspecified.
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Option<NonNull<u8>>;

  /// First byte of the region.
  fn low(&self) -> *mut u8;

  /// One past the last byte of the region.
  fn high(&self) -> *mut u8;

  /// Current length of the region in bytes.
  fn len(&self) -> usize {
    self.high() as usize - self.low() as usize
  }

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Fixed-capacity region carved out of the global allocator.
///
/// Growth fails once `capacity` bytes have been handed out, which makes it
/// the region of choice for tests that need deterministic out-of-memory.
pub struct ArenaRegion {
  base: NonNull<u8>,
  layout: Layout,
  brk: usize,
}

impl ArenaRegion {
  pub fn new(capacity: usize) -> Self {
    let size = crate::align!(capacity.max(ALIGNMENT));
    let layout = match Layout::from_size_align(size, ALIGNMENT) {
      Ok(layout) => layout,
      Err(_) => alloc::handle_alloc_error(Layout::new::<u8>()),
    };

    let Some(base) = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }) else {
      alloc::handle_alloc_error(layout)
    };

    Self {
      base,
      layout,
      brk: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.layout.size()
  }
}

unsafe impl Region for ArenaRegion {
  fn grow(
    &mut self,
    bytes: usize,
  ) -> Option<NonNull<u8>> {
    if bytes > self.capacity() - self.brk {
      trace!(
        "arena region exhausted: {} of {} bytes used, {} requested",
        self.brk,
        self.capacity(),
        bytes
      );
      return None;
    }

    let address = unsafe { self.base.add(self.brk) };
    self.brk += bytes;
    Some(address)
  }

  fn low(&self) -> *mut u8 {
    self.base.as_ptr()
  }

  fn high(&self) -> *mut u8 {
    unsafe { self.base.as_ptr().add(self.brk) }
  }
}

impl Drop for ArenaRegion {
  fn drop(&mut self) {
    unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
  }
}

unsafe impl Send for ArenaRegion {}

#[cfg(unix)]
pub use unix::{MmapRegion, SbrkRegion};

#[cfg(unix)]
mod unix {
  use std::{io, ptr::NonNull};

  use libc::{c_void, intptr_t, sbrk};
  use log::{error, trace};

  use super::Region;
  use crate::error::HeapResult;

  /// Region reserved up front with an anonymous private mapping. Pages are
  /// committed by the kernel on first touch.
  pub struct MmapRegion {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
  }

  impl MmapRegion {
    pub fn new(capacity: usize) -> HeapResult<Self> {
      let capacity = crate::align_to!(capacity.max(1), page_size());

      let address = unsafe {
        libc::mmap(
          std::ptr::null_mut(),
          capacity,
          libc::PROT_READ | libc::PROT_WRITE,
          libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
          -1,
          0,
        )
      };

      if address == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
      }

      let Some(base) = NonNull::new(address.cast::<u8>()) else {
        return Err(io::Error::other("mmap returned a null mapping").into());
      };

      trace!("mapped {} bytes at {:?}", capacity, base);

      Ok(Self {
        base,
        capacity,
        brk: 0,
      })
    }

    pub fn capacity(&self) -> usize {
      self.capacity
    }
  }

  fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      size if size > 0 => size as usize,
      _ => 4096,
    }
  }

  unsafe impl Region for MmapRegion {
    fn grow(
      &mut self,
      bytes: usize,
    ) -> Option<NonNull<u8>> {
      if bytes > self.capacity - self.brk {
        return None;
      }

      let address = unsafe { self.base.add(self.brk) };
      self.brk += bytes;
      Some(address)
    }

    fn low(&self) -> *mut u8 {
      self.base.as_ptr()
    }

    fn high(&self) -> *mut u8 {
      unsafe { self.base.as_ptr().add(self.brk) }
    }
  }

  impl Drop for MmapRegion {
    fn drop(&mut self) {
      unsafe {
        libc::munmap(self.base.as_ptr().cast::<c_void>(), self.capacity);
      }
    }
  }

  unsafe impl Send for MmapRegion {}

  /// Region at the program break, grown with `sbrk(2)`.
  ///
  /// The break is process-wide. If anything else moves it between two
  /// growths the heap would stop being contiguous, so that growth fails.
  /// Memory handed to the heap is never given back.
  pub struct SbrkRegion {
    low: *mut u8,
    high: *mut u8,
  }

  impl SbrkRegion {
    pub const fn new() -> Self {
      Self {
        low: std::ptr::null_mut(),
        high: std::ptr::null_mut(),
      }
    }

    fn program_break() -> *mut u8 {
      unsafe { sbrk(0).cast::<u8>() }
    }
  }

  impl Default for SbrkRegion {
    fn default() -> Self {
      Self::new()
    }
  }

  unsafe impl Region for SbrkRegion {
    fn grow(
      &mut self,
      bytes: usize,
    ) -> Option<NonNull<u8>> {
      let increment = intptr_t::try_from(bytes).ok()?;

      if !self.low.is_null() {
        let current = Self::program_break();
        if current != self.high {
          error!(
            "program break moved from {:?} to {:?} behind the heap's back",
            self.high, current
          );
          return None;
        }
      }

      let address = unsafe { sbrk(increment) };
      if address == usize::MAX as *mut c_void {
        return None;
      }

      let address = address.cast::<u8>();
      if self.low.is_null() {
        self.low = address;
      }

      self.high = address.wrapping_add(bytes);
      NonNull::new(address)
    }

    fn low(&self) -> *mut u8 {
      if self.low.is_null() {
        Self::program_break()
      } else {
        self.low
      }
    }

    fn high(&self) -> *mut u8 {
      if self.high.is_null() {
        Self::program_break()
      } else {
        self.high
      }
    }
  }

  unsafe impl Send for SbrkRegion {}

  #[cfg(test)]
  mod tests {
    use super::*;

    #[test]
    fn test_mmap_region_grows_contiguously() {
      let mut region = MmapRegion::new(8192).unwrap();
      assert!(region.capacity() >= 8192);
      assert!(region.is_empty());

      let first = region.grow(32).unwrap();
      let second = region.grow(64).unwrap();
      assert_eq!(unsafe { first.add(32) }, second);
      assert_eq!(region.len(), 96);
      assert!(region.grow(region.capacity()).is_none());
      assert_eq!(region.len(), 96);
    }

    #[test]
    fn test_sbrk_region_refuses_a_moved_break() {
      let before = SbrkRegion::program_break();
      let stale = before.wrapping_sub(4096);
      let mut region = SbrkRegion {
        low: stale.wrapping_sub(4096),
        high: stale,
      };

      assert!(region.grow(64).is_none());
      assert_eq!(SbrkRegion::program_break(), before);
      assert_eq!(region.high(), stale);
      assert_eq!(region.len(), 4096);
    }
  }
}
