//! Free-list management: fit search, splitting, coalescing and growth.
//!
//! The free list is circular and doubly linked through block offsets. The
//! cursor points at the most recently freed (or split) block, and searches
//! start there instead of at the arena start.
//!
//! ```text
//!   after free(B), before coalesce:
//!
//!   ┌─────┬─────┬─────┬─────────────┐
//!   │ A · │ B · │ C   │ tail ·      │     · = free
//!   └─────┴─────┴─────┴─────────────┘
//!
//!   after coalesce(B):
//!
//!   ┌───────────┬─────┬─────────────┐
//!   │ A + B   · │ C   │ tail ·      │     cursor = A
//!   └───────────┴─────┴─────────────┘
//! ```

use std::ptr::{self, NonNull};

use tracing::{debug, trace};

use crate::{
  align::checked_align_to,
  block::{Block, GRANULE, HEADER_SIZE, MIN_PAYLOAD, NIL},
  error::AllocError,
  region::{Provider, Region},
};

/// Where an address falls relative to the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
  /// Outside the arena, or no arena reserved yet.
  Unmanaged,
  /// Inside the arena but not the payload of a live block.
  Invalid,
  /// Payload of a live block.
  Live(Block),
}

pub struct Heap {
  provider: Box<dyn Provider>,
  growth_unit: usize,
  region: Region,
  cursor: Option<usize>,
  tail_free: bool,
  growths: usize,
}

impl Heap {
  /// Creates a heap without touching the provider; the arena is reserved
  /// on the first allocation.
  pub fn new(
    provider: Box<dyn Provider>,
    growth_unit: usize,
  ) -> Self {
    Self {
      provider,
      growth_unit,
      region: Region::new(NonNull::dangling(), 0),
      cursor: None,
      tail_free: false,
      growths: 0,
    }
  }

  pub fn region(&self) -> Region {
    self.region
  }

  pub fn is_reserved(&self) -> bool {
    self.region.capacity() != 0
  }

  pub fn growths(&self) -> usize {
    self.growths
  }

  pub fn cursor(&self) -> Option<usize> {
    self.cursor
  }

  /// Whether the last block in address order is free.
  pub fn tail_free(&self) -> bool {
    self.tail_free
  }

  pub fn block_at(
    &self,
    offset: usize,
  ) -> Block {
    // SAFETY: offsets handed around by the heap are block starts in the region.
    unsafe { Block::at(self.region.at(offset)) }
  }

  pub fn offset_of(
    &self,
    block: Block,
  ) -> usize {
    block.addr() as usize - self.region.base().as_ptr() as usize
  }

  pub unsafe fn has_successor(
    &self,
    block: Block,
  ) -> bool {
    unsafe { self.offset_of(block) + block.full_size() < self.region.capacity() }
  }

  /// Resolves a payload pointer to its block.
  pub fn lookup(
    &self,
    ptr: *const u8,
  ) -> Lookup {
    let Some(offset) = self.region.offset_of(ptr) else {
      return Lookup::Unmanaged;
    };
    if offset < HEADER_SIZE || offset % GRANULE != 0 {
      return Lookup::Invalid;
    }

    // SAFETY: offset >= HEADER_SIZE, so the header lies inside the region.
    let block = unsafe { Block::header_of(self.region.at(offset)) };
    unsafe {
      if !block.has_magic() || block.get_flag() {
        return Lookup::Invalid;
      }
      let end = (offset - HEADER_SIZE).checked_add(block.full_size());
      if end.is_none_or(|end| end > self.region.capacity()) {
        return Lookup::Invalid;
      }
    }
    Lookup::Live(block)
  }

  /// Carves a used block with at least `size` payload bytes. Counters are
  /// set to one and the finalizer slot is empty.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<Block, AllocError> {
    let rounded = checked_align_to(size.max(1), GRANULE).ok_or(AllocError::TooLarge { size })?;
    let block = self.find_fit(rounded)?;

    unsafe {
      self.split_or_use(block, rounded);
      block.set_ref_strong(1);
      block.set_ref_total(1);
      block.set_finalizer(ptr::null_mut());
    }

    trace!(
      offset = self.offset_of(block),
      requested = size,
      size = unsafe { block.get_size() },
      "allocated block"
    );
    Ok(block)
  }

  /// Finds a free block of at least `size` bytes, growing the arena once if
  /// the free list has nothing suitable.
  pub fn find_fit(
    &mut self,
    size: usize,
  ) -> Result<Block, AllocError> {
    if let Some(block) = self.search(size) {
      return Ok(block);
    }

    self.grow(size)?;

    self.search(size).ok_or(AllocError::CapacityExhausted {
      requested: size,
      limit: self.region.capacity(),
    })
  }

  fn search(
    &self,
    size: usize,
  ) -> Option<Block> {
    let start = self.cursor?;
    let mut offset = start;

    loop {
      let block = self.block_at(offset);
      unsafe {
        if block.get_size() >= size {
          return Some(block);
        }
        offset = block.get_next();
      }
      if offset == start {
        return None;
      }
    }
  }

  /// Doubles the arena until the new tail alone can hold `size` bytes plus a
  /// header, then turns the tail into a free block.
  fn grow(
    &mut self,
    size: usize,
  ) -> Result<(), AllocError> {
    let needed = size.checked_add(HEADER_SIZE).ok_or(AllocError::TooLarge { size })?;

    if !self.is_reserved() {
      let (base, capacity) = self.provider.reserve(needed.max(self.growth_unit))?;
      Self::check_region(base, capacity)?;
      self.region = Region::new(base, capacity);
      unsafe { self.append(0, false) };
      return Ok(());
    }

    let old = self.region.capacity();
    let mut target = old;
    while target - old < needed {
      target = target.checked_mul(2).ok_or(AllocError::TooLarge { size })?;
    }

    let (base, capacity) = self.provider.grow(self.region.base(), old, target)?;
    Self::check_region(base, capacity)?;
    if capacity < old + HEADER_SIZE + MIN_PAYLOAD {
      return Err(AllocError::CapacityExhausted {
        requested: target,
        limit: capacity,
      });
    }
    self.region = Region::new(base, capacity);
    self.growths += 1;

    debug!(from = old, to = capacity, growths = self.growths, "arena grown");

    let prev_free = self.tail_free;
    unsafe { self.append(old, prev_free) };
    Ok(())
  }

  fn check_region(
    base: NonNull<u8>,
    capacity: usize,
  ) -> Result<(), AllocError> {
    if base.as_ptr() as usize % GRANULE != 0 || capacity % GRANULE != 0 {
      return Err(AllocError::InvalidConfig {
        reason: "provider returned a misaligned region",
      });
    }
    if capacity < HEADER_SIZE + MIN_PAYLOAD {
      return Err(AllocError::InvalidConfig {
        reason: "provider returned a region too small for one block",
      });
    }
    Ok(())
  }

  /// Turns `[offset, capacity)` into a free block and merges it with a free
  /// last block.
  unsafe fn append(
    &mut self,
    offset: usize,
    prev_free: bool,
  ) {
    unsafe {
      let block = self.block_at(offset);
      block.init(self.region.capacity() - offset - HEADER_SIZE, true, prev_free);
      self.tail_free = true;
      self.link(block);
      let merged = self.coalesce(block);
      self.cursor = Some(self.offset_of(merged));
    }
  }

  /// Hands `block` out for `size` bytes. The excess becomes a new free block
  /// only when it can hold a header and a minimum payload.
  pub unsafe fn split_or_use(
    &mut self,
    block: Block,
    size: usize,
  ) {
    unsafe {
      let available = block.get_size();
      debug_assert!(available >= size);

      if available - size >= HEADER_SIZE + MIN_PAYLOAD {
        let rest = self.block_at(self.offset_of(block) + HEADER_SIZE + size);
        rest.init(available - size - HEADER_SIZE, true, false);
        self.replace(block, rest);

        block.set_flag(false, false);
        block.set_size(size);

        trace!(
          offset = self.offset_of(block),
          remainder = rest.get_size(),
          "split free block"
        );
      } else {
        self.unlink(block);
        self.mark(block, false);
      }
    }
  }

  /// Returns a used block to the free list and coalesces it. The caller has
  /// already run its finalizer.
  pub unsafe fn free(
    &mut self,
    block: Block,
  ) -> Block {
    unsafe {
      let size = block.get_size();
      self.mark(block, true);
      block.set_prev(NIL);
      block.set_next(NIL);
      block.set_size(size);
      self.link(block);

      let merged = self.coalesce(block);
      self.cursor = Some(self.offset_of(merged));

      trace!(
        offset = self.offset_of(merged),
        size = merged.get_size(),
        "freed block"
      );
      merged
    }
  }

  /// Merges `block` with free neighbours in address order. Returns the
  /// surviving block.
  pub unsafe fn coalesce(
    &mut self,
    mut block: Block,
  ) -> Block {
    unsafe {
      if self.has_successor(block) {
        let after = block.get_after();
        if after.get_flag() {
          self.unlink(after);
          block.set_size(block.get_size() + after.full_size());
          after.clear();
        }
      }

      if let Some(before) = block.get_before() {
        self.unlink(block);
        before.set_size(before.get_size() + block.full_size());
        block.clear();
        block = before;
      }

      block
    }
  }

  unsafe fn mark(
    &mut self,
    block: Block,
    free: bool,
  ) {
    unsafe {
      let has_successor = self.has_successor(block);
      block.set_flag(free, has_successor);
      if !has_successor {
        self.tail_free = free;
      }
    }
  }

  /// Inserts `block` after the cursor and makes it the cursor.
  unsafe fn link(
    &mut self,
    block: Block,
  ) {
    unsafe {
      let offset = self.offset_of(block);

      match self.cursor {
        None => {
          block.set_prev(offset);
          block.set_next(offset);
        }
        Some(cursor) => {
          let current = self.block_at(cursor);
          let next = current.get_next();
          block.set_prev(cursor);
          block.set_next(next);
          current.set_next(offset);
          self.block_at(next).set_prev(offset);
        }
      }

      self.cursor = Some(offset);
    }
  }

  unsafe fn unlink(
    &mut self,
    block: Block,
  ) {
    unsafe {
      let offset = self.offset_of(block);
      let (prev, next) = (block.get_prev(), block.get_next());

      if next == offset {
        self.cursor = None;
        return;
      }

      self.block_at(prev).set_next(next);
      self.block_at(next).set_prev(prev);
      if self.cursor == Some(offset) {
        self.cursor = Some(next);
      }
    }
  }

  /// Puts `new` in the free list where `old` was and makes it the cursor.
  unsafe fn replace(
    &mut self,
    old: Block,
    new: Block,
  ) {
    unsafe {
      let old_offset = self.offset_of(old);
      let new_offset = self.offset_of(new);
      let (prev, next) = (old.get_prev(), old.get_next());

      if next == old_offset {
        new.set_prev(new_offset);
        new.set_next(new_offset);
      } else {
        new.set_prev(prev);
        new.set_next(next);
        self.block_at(prev).set_next(new_offset);
        self.block_at(next).set_prev(new_offset);
      }

      self.cursor = Some(new_offset);
    }
  }
}
