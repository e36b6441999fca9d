use std::ptr::NonNull;

use segalloc::{Heap, HeapConfig, HeapResult, MmapRegion, Region};

/// Prints where an allocation landed and how far the region reaches now.
fn print_alloc(
  heap: &Heap<MmapRegion>,
  label: &str,
  size: usize,
  address: NonNull<u8>,
) {
  println!(
    "[{}] requested {} bytes, address = {:?}, usable = {}, region end = {:?}",
    label,
    size,
    address,
    unsafe { heap.usable_size(address) },
    heap.region().high(),
  );
}

fn print_stats(
  heap: &Heap<MmapRegion>,
  label: &str,
) {
  let stats = heap.stats();
  println!(
    "[{}] region = {} bytes, blocks = {} ({} allocated, {} free), free bytes = {}, largest free = {}",
    label,
    stats.region_bytes,
    stats.blocks,
    stats.allocated_blocks,
    stats.free_blocks,
    stats.free_bytes,
    stats.largest_free,
  );
}

fn main() -> HeapResult<()> {
  env_logger::init();

  // Reserve 1 MiB of address space; the heap starts with one 2 KiB chunk.
  let region = MmapRegion::new(1 << 20)?;
  let mut heap = Heap::with_config(region, HeapConfig::new().with_heap_check(true))?;
  print_stats(&heap, "start");

  unsafe {
    // --------------------------------------------------------------------
    // 1) A small allocation is rounded up to the 32 byte minimum block and
    //    split off the front of the initial chunk.
    // --------------------------------------------------------------------
    let Some(first) = heap.allocate(8)? else {
      return Ok(());
    };
    first.cast::<u64>().write(0xDEADBEEF);
    print_alloc(&heap, "1", 8, first);
    print_stats(&heap, "1");

    // --------------------------------------------------------------------
    // 2) Two neighbours, so there is something to coalesce later.
    // --------------------------------------------------------------------
    let Some(second) = heap.allocate(100)? else {
      return Ok(());
    };
    second.as_ptr().write_bytes(0xAB, 100);
    print_alloc(&heap, "2", 100, second);

    let Some(third) = heap.allocate(300)? else {
      return Ok(());
    };
    print_alloc(&heap, "2", 300, third);
    print_stats(&heap, "2");

    // --------------------------------------------------------------------
    // 3) Free the middle block, then ask for the same size again: the exact
    //    fit hands back the very same block.
    // --------------------------------------------------------------------
    heap.free(Some(second));
    let Some(again) = heap.allocate(100)? else {
      return Ok(());
    };
    println!(
      "\n[3] reused the freed block? {}",
      if again == second { "yes" } else { "no" }
    );

    // --------------------------------------------------------------------
    // 4) Free `third` and grow `again` into the space it left behind.
    // --------------------------------------------------------------------
    heap.free(Some(third));
    let grown = heap.resize(Some(again), 350)?;
    println!("\n[4] resized in place? {}", grown == Some(again));
    print_stats(&heap, "4");

    // --------------------------------------------------------------------
    // 5) Nothing fits 64 KiB, so the region grows.
    // --------------------------------------------------------------------
    let Some(big) = heap.allocate(64 * 1024)? else {
      return Ok(());
    };
    print_alloc(&heap, "5", 64 * 1024, big);
    print_stats(&heap, "5");

    // --------------------------------------------------------------------
    // 6) Free everything; the blocks collapse back into one.
    // --------------------------------------------------------------------
    heap.free(Some(big));
    heap.free(grown);
    heap.free(Some(first));
    print_stats(&heap, "6");
  }

  println!("\nheap check: {}", heap.check_heap(line!()));
  Ok(())
}
