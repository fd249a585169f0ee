//! Heap walking, usage statistics and invariant checking.

use thiserror::Error;

use crate::{
  allocator::Allocator,
  block::{BlockState, GRANULE, HEADER_SIZE, MIN_PAYLOAD},
  engine::Heap,
};

/// One block, as seen by an address-order walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Offset of the header from the arena base.
  pub offset: usize,
  /// Payload bytes.
  pub size: usize,
  pub free: bool,
}

/// Snapshot of arena usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
  /// Committed bytes, headers included.
  pub capacity: usize,
  pub used_blocks: usize,
  pub free_blocks: usize,
  /// Payload bytes in used blocks.
  pub used_bytes: usize,
  /// Payload bytes in free blocks.
  pub free_bytes: usize,
  /// Payload bytes of the largest free block.
  pub largest_free: usize,
  /// Number of times the arena was grown after the first reservation.
  pub growths: usize,
}

/// A violated heap invariant, reported by [`Allocator::check`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
  #[error("block at {offset:#x} has no header magic")]
  Magic { offset: usize },

  #[error("block at {offset:#x} has bad size {size}")]
  Size { offset: usize, size: usize },

  #[error("block at {offset:#x} runs past the arena end")]
  Overrun { offset: usize },

  #[error("block at {offset:#x} has a stale prev-free flag")]
  PrevFlag { offset: usize },

  #[error("free block at {offset:#x} has boundary tag {tag}, size {size}")]
  BoundaryTag { offset: usize, tag: usize, size: usize },

  #[error("free blocks at {offset:#x} and its predecessor were not coalesced")]
  AdjacentFree { offset: usize },

  #[error("block at {offset:#x} has strong count {strong} above total {total}")]
  Counts { offset: usize, strong: u32, total: u32 },

  #[error("tail flag disagrees with the last block")]
  Tail,

  #[error("free list holds {listed} blocks, the heap walk found {walked}")]
  FreeList { listed: usize, walked: usize },

  #[error("free list is broken at {offset:#x}")]
  Link { offset: usize },
}

/// Address-order iterator over all blocks.
pub struct Blocks<'a> {
  heap: &'a Heap,
  offset: usize,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let capacity = self.heap.region().capacity();
    if self.offset.saturating_add(HEADER_SIZE) > capacity {
      return None;
    }

    let block = self.heap.block_at(self.offset);
    let (size, free) = unsafe { (block.get_size(), block.get_flag()) };
    let info = BlockInfo {
      offset: self.offset,
      size,
      free,
    };

    self.offset = self.offset.saturating_add(HEADER_SIZE).saturating_add(size);
    Some(info)
  }
}

impl Heap {
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      heap: self,
      offset: 0,
    }
  }

  pub fn stats(&self) -> ArenaStats {
    let mut stats = ArenaStats {
      capacity: self.region().capacity(),
      growths: self.growths(),
      ..ArenaStats::default()
    };

    for info in self.blocks() {
      if info.free {
        stats.free_blocks += 1;
        stats.free_bytes += info.size;
        stats.largest_free = stats.largest_free.max(info.size);
      } else {
        stats.used_blocks += 1;
        stats.used_bytes += info.size;
      }
    }

    stats
  }

  pub fn check(&self) -> Result<(), Inconsistency> {
    let capacity = self.region().capacity();
    let mut prev_free = false;
    let mut last_free = None;
    let mut walked = 0;

    for info in self.blocks() {
      let offset = info.offset;
      let block = self.block_at(offset);

      unsafe {
        if !block.has_magic() {
          return Err(Inconsistency::Magic { offset });
        }
        let min = if info.free { MIN_PAYLOAD } else { GRANULE };
        if info.size < min || info.size % GRANULE != 0 {
          return Err(Inconsistency::Size {
            offset,
            size: info.size,
          });
        }
        if info.size > capacity - offset - HEADER_SIZE {
          return Err(Inconsistency::Overrun { offset });
        }
        if block.get_prev_flag() != prev_free {
          return Err(Inconsistency::PrevFlag { offset });
        }

        if info.free {
          if prev_free {
            return Err(Inconsistency::AdjacentFree { offset });
          }
          let tag = block.boundary().read();
          if tag != info.size {
            return Err(Inconsistency::BoundaryTag {
              offset,
              tag,
              size: info.size,
            });
          }
          walked += 1;
        } else if let BlockState::Used { strong, total, .. } = block.state()
          && strong > total
        {
          return Err(Inconsistency::Counts {
            offset,
            strong,
            total,
          });
        }
      }

      prev_free = info.free;
      last_free = Some(info.free);
    }

    if last_free.is_some_and(|free| free != self.tail_free()) {
      return Err(Inconsistency::Tail);
    }

    let listed = self.check_free_list(walked)?;
    if listed != walked {
      return Err(Inconsistency::FreeList { listed, walked });
    }
    Ok(())
  }

  /// Walks the circular free list from the cursor. Gives up after
  /// `walked + 1` steps so a corrupted list cannot loop forever.
  fn check_free_list(
    &self,
    walked: usize,
  ) -> Result<usize, Inconsistency> {
    let Some(start) = self.cursor() else {
      return Ok(0);
    };

    let mut listed = 0;
    let mut offset = start;
    loop {
      let block = self.block_at(offset);
      unsafe {
        if !block.has_magic() || !block.get_flag() {
          return Err(Inconsistency::Link { offset });
        }
        let next = block.get_next();
        if next >= self.region().capacity() || self.block_at(next).get_prev() != offset {
          return Err(Inconsistency::Link { offset });
        }
        offset = next;
      }

      listed += 1;
      if offset == start {
        return Ok(listed);
      }
      if listed > walked {
        return Err(Inconsistency::FreeList { listed, walked });
      }
    }
  }
}

impl Allocator {
  /// Usage counters for the arena.
  pub fn stats(&self) -> ArenaStats {
    self.heap.stats()
  }

  /// Every block in address order.
  pub fn blocks(&self) -> Blocks<'_> {
    self.heap.blocks()
  }

  /// Verifies the heap invariants: the blocks tile the arena, prev-free
  /// flags and boundary tags are accurate, no two free blocks touch, and
  /// the free list holds exactly the free blocks.
  pub fn check(&self) -> Result<(), Inconsistency> {
    self.heap.check()
  }
}
