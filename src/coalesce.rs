use crate::{block::Block, free_list::FreeLists};

/// Merges a free block with its free neighbours and links the result.
///
/// The previous neighbour is found through its footer, which every block
/// keeps up to date. The prologue and the epilogue are tagged allocated, so
/// neither is ever merged. Returns the merged block, which is the lower
/// neighbour when the previous block was free.
///
/// # Safety
///
/// `block` must be tagged free, must not be linked in `lists`, and must sit
/// between the prologue and the epilogue of a well formed heap.
pub(crate) unsafe fn coalesce(
  lists: &mut FreeLists,
  block: Block,
) -> Block {
  unsafe {
    let prev_free = !block.prev_is_allocated();
    let next = block.next();
    let next_free = !next.is_allocated();
    let mut size = block.size();

    let merged = match (prev_free, next_free) {
      (false, false) => block,
      (false, true) => {
        lists.remove(next);
        size += next.size();
        block.set_tags(size, false);
        block
      }
      (true, false) => {
        let prev = block.prev();
        lists.remove(prev);
        size += prev.size();
        prev.set_tags(size, false);
        prev
      }
      (true, true) => {
        let prev = block.prev();
        lists.remove(prev);
        lists.remove(next);
        size += prev.size() + next.size();
        prev.set_tags(size, false);
        prev
      }
    };

    lists.insert(merged);
    merged
  }
}
