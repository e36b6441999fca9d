use std::{
  alloc::{GlobalAlloc, Layout, System},
  cell::Cell,
  ptr::{self, NonNull},
  sync::atomic::{AtomicUsize, Ordering},
};

use log::error;
use parking_lot::{Mutex, MutexGuard, const_mutex};

use crate::{ALIGNMENT, error::HeapResult, heap::Heap, region::Region};

thread_local! {
  static INSIDE_HEAP: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a heap operation until dropped.
struct Entered;

impl Entered {
  /// Returns `None` if the thread is already inside a heap operation.
  fn enter() -> Option<Self> {
    if INSIDE_HEAP.replace(true) {
      None
    } else {
      Some(Entered)
    }
  }
}

impl Drop for Entered {
  fn drop(&mut self) {
    INSIDE_HEAP.set(false);
  }
}

/// A [`Heap`] behind a mutex, usable as a global allocator.
///
/// Every entry point takes the lock for the whole operation. The heap is
/// built on first use from the region returned by `make_region`.
///
/// ```rust,ignore
/// use segalloc::{LockedHeap, SbrkRegion};
///
/// #[global_allocator]
/// static HEAP: LockedHeap<SbrkRegion> = LockedHeap::new(SbrkRegion::new);
/// ```
///
/// # Re-entry
///
/// A heap operation can allocate on its own thread: the installed logger
/// formats a `trace!` record, or `make_region` builds an [`ArenaRegion`]
/// buffer through the global allocator. Such nested requests are served by
/// [`System`] instead of waiting on the lock this thread already holds.
/// Addresses outside the heap's region are handed back to [`System`] on
/// `dealloc` and `realloc`. A heap address freed from inside a heap
/// operation stays allocated.
///
/// With [`SbrkRegion`] the system allocator may move the program break
/// itself, after which the heap can no longer grow.
///
/// [`ArenaRegion`]: crate::ArenaRegion
/// [`SbrkRegion`]: crate::SbrkRegion
pub struct LockedHeap<R: Region> {
  heap: Mutex<Option<Heap<R>>>,
  make_region: fn() -> R,
  low: AtomicUsize,
  high: AtomicUsize,
}

unsafe impl<R: Region + Send> Sync for LockedHeap<R> {}

impl<R: Region> LockedHeap<R> {
  pub const fn new(make_region: fn() -> R) -> Self {
    Self {
      heap: const_mutex(None),
      make_region,
      low: AtomicUsize::new(0),
      high: AtomicUsize::new(0),
    }
  }

  /// Locks the heap, building it first if needed.
  ///
  /// Allocating through this heap while the guard is alive deadlocks.
  pub fn lock(&self) -> HeapResult<MutexGuard<'_, Option<Heap<R>>>> {
    let _entered = Entered::enter();
    self.lock_built()
  }

  fn lock_built(&self) -> HeapResult<MutexGuard<'_, Option<Heap<R>>>> {
    let guard = self.heap.lock();
    if guard.is_some() {
      return Ok(guard);
    }

    drop(guard);
    let region = (self.make_region)();

    // Another thread may have built the heap meanwhile; `region` is dropped.
    let mut guard = self.heap.lock();
    if guard.is_none() {
      let heap = Heap::new(region)?;
      self.publish(&heap);
      *guard = Some(heap);
    }
    Ok(guard)
  }

  /// Records the region bounds so `owns` can be answered without the lock.
  fn publish(
    &self,
    heap: &Heap<R>,
  ) {
    self.low.store(heap.region().low() as usize, Ordering::Release);
    self.high.store(heap.region().high() as usize, Ordering::Release);
  }

  fn owns(
    &self,
    address: *mut u8,
  ) -> bool {
    let address = address.addr();
    self.low.load(Ordering::Acquire) <= address && address < self.high.load(Ordering::Acquire)
  }

  fn with_heap(
    &self,
    entered: Entered,
    op: impl FnOnce(&mut Heap<R>) -> HeapResult<Option<NonNull<u8>>>,
  ) -> *mut u8 {
    let result = self
      .lock_built()
      .and_then(|mut guard| match guard.as_mut() {
        Some(heap) => {
          let result = op(heap);
          self.publish(heap);
          result
        }
        None => Ok(None),
      });
    drop(entered);

    match result {
      Ok(address) => address.map_or(ptr::null_mut(), NonNull::as_ptr),
      Err(err) => {
        error!("allocation failed: {}", err);
        ptr::null_mut()
      }
    }
  }
}

unsafe impl<R: Region + Send> GlobalAlloc for LockedHeap<R> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }
    match Entered::enter() {
      Some(entered) => self.with_heap(entered, |heap| heap.allocate(layout.size())),
      None => unsafe { System.alloc(layout) },
    }
  }

  unsafe fn dealloc(
    &self,
    address: *mut u8,
    layout: Layout,
  ) {
    if !self.owns(address) {
      unsafe { System.dealloc(address, layout) };
      return;
    }

    let Some(_entered) = Entered::enter() else {
      return;
    };
    if let Ok(mut guard) = self.lock_built() {
      if let Some(heap) = guard.as_mut() {
        unsafe { heap.free(NonNull::new(address)) };
      }
    }
  }

  unsafe fn alloc_zeroed(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }
    match Entered::enter() {
      Some(entered) => self.with_heap(entered, |heap| heap.zeroed_allocate(1, layout.size())),
      None => unsafe { System.alloc_zeroed(layout) },
    }
  }

  unsafe fn realloc(
    &self,
    address: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }
    if !self.owns(address) {
      return unsafe { System.realloc(address, layout, new_size) };
    }
    match Entered::enter() {
      Some(entered) => {
        self.with_heap(entered, |heap| unsafe { heap.resize(NonNull::new(address), new_size) })
      }
      None => ptr::null_mut(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::mpsc, thread, time::Duration};

  use log::{LevelFilter, Log, Metadata, Record};

  use super::*;
  use crate::region::ArenaRegion;

  fn arena() -> ArenaRegion {
    ArenaRegion::new(1 << 16)
  }

  #[test]
  fn test_global_alloc_interface() {
    let heap = LockedHeap::new(arena);

    unsafe {
      let layout = Layout::array::<u64>(8).unwrap();
      let a = heap.alloc_zeroed(layout);
      assert!(!a.is_null());
      assert!((0..8).all(|i| a.cast::<u64>().add(i).read() == 0));

      for i in 0..8 {
        a.cast::<u64>().add(i).write(i as u64);
      }

      let b = heap.realloc(a, layout, 1024);
      assert!(!b.is_null());
      assert!((0..8).all(|i| b.cast::<u64>().add(i).read() == i as u64));

      heap.dealloc(b, Layout::from_size_align(1024, 8).unwrap());
    }

    let guard = heap.lock().unwrap();
    let heap = guard.as_ref().unwrap();
    assert!(heap.verify().is_ok());
    assert_eq!(heap.stats().allocated_blocks, 0);
  }

  #[test]
  fn test_refuses_large_alignment() {
    let heap = LockedHeap::new(arena);
    let layout = Layout::from_size_align(64, 64).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null());
  }

  #[test]
  fn test_out_of_memory_is_null() {
    let heap = LockedHeap::new(arena);
    let layout = Layout::from_size_align(1 << 20, 8).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null());
  }

  #[test]
  fn test_shared_between_threads() {
    static HEAP: LockedHeap<ArenaRegion> = LockedHeap::new(arena);

    let workers: Vec<_> = (0..4)
      .map(|seed| {
        thread::spawn(move || {
          let layout = Layout::from_size_align(48, 16).unwrap();
          for _ in 0..100 {
            unsafe {
              let address = HEAP.alloc(layout);
              assert!(!address.is_null());
              address.write_bytes(seed, 48);
              assert!((0..48).all(|i| address.add(i).read() == seed));
              HEAP.dealloc(address, layout);
            }
          }
        })
      })
      .collect();

    for worker in workers {
      worker.join().unwrap();
    }

    let guard = HEAP.lock().unwrap();
    assert!(guard.as_ref().unwrap().verify().is_ok());
  }

  static LOGGED: LockedHeap<ArenaRegion> = LockedHeap::new(arena);

  /// Takes a scratch buffer from `LOGGED` for every record, the way a
  /// formatting logger would when `LOGGED` is the global allocator.
  struct AllocatingLogger;

  impl Log for AllocatingLogger {
    fn enabled(
      &self,
      _metadata: &Metadata,
    ) -> bool {
      true
    }

    fn log(
      &self,
      _record: &Record,
    ) {
      let layout = Layout::from_size_align(64, 8).unwrap();
      unsafe {
        let buffer = LOGGED.alloc(layout);
        if !buffer.is_null() {
          buffer.write_bytes(0x2a, 64);
          LOGGED.dealloc(buffer, layout);
        }
      }
    }

    fn flush(&self) {}
  }

  #[test]
  fn test_logging_from_inside_the_heap() {
    static LOGGER: AllocatingLogger = AllocatingLogger;
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
      let small = Layout::from_size_align(8, 8).unwrap();
      let large = Layout::from_size_align(8192, 16).unwrap();
      unsafe {
        // The first call builds the heap and the second grows it; both log.
        let a = LOGGED.alloc(small);
        let b = LOGGED.alloc(large);
        let served = LOGGED.owns(a) && LOGGED.owns(b);
        LOGGED.dealloc(a, small);
        LOGGED.dealloc(b, large);
        done.send(served).unwrap();
      }
    });

    assert_eq!(finished.recv_timeout(Duration::from_secs(5)), Ok(true));

    let guard = LOGGED.lock().unwrap();
    assert!(guard.as_ref().unwrap().verify().is_ok());
  }

  #[test]
  fn test_foreign_addresses_go_to_the_system() {
    let heap = LockedHeap::new(arena);
    let layout = Layout::from_size_align(32, 16).unwrap();

    unsafe {
      let own = heap.alloc(layout);
      assert!(heap.owns(own));

      let foreign = System.alloc(layout);
      assert!(!heap.owns(foreign));
      foreign.write_bytes(7, 32);

      let foreign = heap.realloc(foreign, layout, 256);
      assert!(!foreign.is_null());
      assert!(!heap.owns(foreign));
      assert!((0..32).all(|i| foreign.add(i).read() == 7));
      heap.dealloc(foreign, Layout::from_size_align(256, 16).unwrap());

      heap.dealloc(own, layout);
    }

    let guard = heap.lock().unwrap();
    assert_eq!(guard.as_ref().unwrap().stats().allocated_blocks, 0);
  }
}
