//! Strong/total reference counting and finalization.
//!
//! Every used block carries two counters. `strong` counts stack-rooted
//! owners; `total` counts those plus weak (heap-rooted) observers. A block
//! is reclaimed when `total` reaches zero.
//!
//! ```text
//!   release ──► total == 0 ──► pending.push(block)
//!                                   │
//!        ┌──────────────────────────┘   (outermost release only)
//!        ▼
//!   while let Some(block) = pending.pop():
//!       run finalizer  ──► may release children ──► pending.push(child)
//!       free + coalesce
//! ```
//!
//! Finalizers never recurse into reclamation, so dropping a chain of any
//! length uses constant native stack.

use std::{
  panic::{self, AssertUnwindSafe},
  ptr::NonNull,
};

use tracing::{error, trace, warn};

use crate::{
  allocator::Allocator,
  block::Block,
  engine::Lookup,
  error::AllocError,
};

/// Callback run over a block's payload right before the block is reclaimed.
///
/// It receives the allocator so it can release references held inside the
/// payload. Those releases are queued and processed after it returns.
pub type Finalizer = Box<dyn FnOnce(&mut Allocator, NonNull<u8>) + Send>;

/// Outcome of a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
  /// The pointer is not managed by this allocator; nothing happened.
  Unmanaged,
  /// The counter was decremented and references remain.
  Retained,
  /// The last reference is gone. The block has been finalized and
  /// reclaimed, or queued for it when released from inside a finalizer.
  Reclaimed,
}

impl Allocator {
  fn resolve(
    &self,
    ptr: *const u8,
  ) -> Result<Option<Block>, AllocError> {
    match self.heap.lookup(ptr) {
      Lookup::Unmanaged => Ok(None),
      Lookup::Live(block) => Ok(Some(block)),
      Lookup::Invalid => {
        warn!(addr = ptr as usize, "pointer is not a live allocation");
        Err(AllocError::NotAllocated { addr: ptr as usize })
      }
    }
  }

  /// Adds a strong reference (strong and total both grow by one).
  ///
  /// Pointers outside the arena are ignored.
  pub fn acquire_strong(
    &mut self,
    ptr: *const u8,
  ) -> Result<(), AllocError> {
    let Some(block) = self.resolve(ptr)? else {
      return Ok(());
    };

    unsafe {
      let strong = block.get_ref_strong().checked_add(1);
      let total = block.get_ref_total().checked_add(1);
      let (Some(strong), Some(total)) = (strong, total) else {
        return Err(AllocError::CounterOverflow { addr: ptr as usize });
      };
      block.set_ref_strong(strong);
      block.set_ref_total(total);
    }
    Ok(())
  }

  /// Adds a weak reference (total grows by one).
  ///
  /// Pointers outside the arena are ignored.
  pub fn acquire_weak(
    &mut self,
    ptr: *const u8,
  ) -> Result<(), AllocError> {
    let Some(block) = self.resolve(ptr)? else {
      return Ok(());
    };

    unsafe {
      let total = block
        .get_ref_total()
        .checked_add(1)
        .ok_or(AllocError::CounterOverflow { addr: ptr as usize })?;
      block.set_ref_total(total);
    }
    Ok(())
  }

  /// Drops a strong reference. Reclaims the block when no references remain.
  pub fn release_strong(
    &mut self,
    ptr: *const u8,
  ) -> Result<Released, AllocError> {
    let Some(block) = self.resolve(ptr)? else {
      return Ok(Released::Unmanaged);
    };

    let total = unsafe {
      let strong = block.get_ref_strong();
      if strong == 0 {
        warn!(addr = ptr as usize, "strong release without a strong reference");
        return Err(AllocError::StrongUnderflow { addr: ptr as usize });
      }
      let total = block.get_ref_total() - 1;
      block.set_ref_strong(strong - 1);
      block.set_ref_total(total);
      total
    };

    if total == 0 { self.reclaim(block) } else { Ok(Released::Retained) }
  }

  /// Drops a weak reference. Reclaims the block when no references remain.
  pub fn release_weak(
    &mut self,
    ptr: *const u8,
  ) -> Result<Released, AllocError> {
    let Some(block) = self.resolve(ptr)? else {
      return Ok(Released::Unmanaged);
    };

    let total = unsafe {
      let total = block.get_ref_total();
      if total <= block.get_ref_strong() {
        warn!(addr = ptr as usize, "weak release without a weak reference");
        return Err(AllocError::WeakUnderflow { addr: ptr as usize });
      }
      block.set_ref_total(total - 1);
      total - 1
    };

    if total == 0 { self.reclaim(block) } else { Ok(Released::Retained) }
  }

  /// Queues `block` and, unless a reclamation is already in progress
  /// further up the stack, drains the queue.
  ///
  /// A block is queued at most once. It stays marked pending until its
  /// finalizer has returned, so a finalizer that re-acquires and releases
  /// a queued block (its own or another) does not queue it again.
  fn reclaim(
    &mut self,
    block: Block,
  ) -> Result<Released, AllocError> {
    unsafe {
      if !block.is_pending() {
        block.set_pending(true);
        self.pending.push(self.heap.offset_of(block));
      }
    }
    if self.draining {
      return Ok(Released::Reclaimed);
    }

    self.draining = true;
    let mut panicked = 0;

    while let Some(offset) = self.pending.pop() {
      let block = self.heap.block_at(offset);
      unsafe {
        if !block.has_magic() || block.get_flag() || !block.is_pending() {
          warn!(offset, "stale reclamation entry skipped");
          continue;
        }
        // Re-acquired while queued: still alive, finalizer kept.
        if block.get_ref_total() != 0 {
          block.set_pending(false);
          continue;
        }
      }

      if let Some(finalizer) = unsafe { block.take_finalizer() } {
        let payload = block.get_payload();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| finalizer(self, payload)));
        if outcome.is_err() {
          error!(offset, "finalizer panicked; reclaiming block anyway");
          panicked += 1;
        }
      }

      // The finalizer may have grown the arena.
      let block = self.heap.block_at(offset);
      unsafe {
        block.set_pending(false);
        if block.get_ref_total() != 0 {
          warn!(offset, "block resurrected by a finalizer");
          continue;
        }
        self.heap.free(block);
      }
    }

    self.draining = false;

    if panicked > 0 {
      return Err(AllocError::FinalizerPanicked { count: panicked });
    }
    trace!("reclamation drained");
    Ok(Released::Reclaimed)
  }

  /// Returns `ptr + base + offset * step` if that byte lies inside the
  /// payload `ptr` points at, `None` otherwise.
  ///
  /// When `ptr` is not the payload of a live block the check is skipped and
  /// the computed address is returned as is.
  pub fn bounds_checked_access(
    &self,
    ptr: *mut u8,
    base: isize,
    offset: isize,
    step: isize,
  ) -> Option<*mut u8> {
    let index = offset.checked_mul(step).and_then(|scaled| base.checked_add(scaled))?;

    let Lookup::Live(block) = self.heap.lookup(ptr) else {
      return Some(ptr.wrapping_offset(index));
    };

    let size = unsafe { block.get_size() };
    if index < 0 || index as usize >= size {
      trace!(addr = ptr as usize, index, size, "bounds check failed");
      return None;
    }
    Some(ptr.wrapping_add(index as usize))
  }

  /// Whether `position` lies inside the payload of the live block at `block`.
  pub fn in_block(
    &self,
    block: *const u8,
    position: *const u8,
  ) -> bool {
    let Lookup::Live(header) = self.heap.lookup(block) else {
      return false;
    };
    let size = unsafe { header.get_size() };
    (position as usize)
      .checked_sub(block as usize)
      .is_some_and(|delta| delta < size)
  }

  /// Strong count of a live block.
  pub fn strong_count(
    &self,
    ptr: *const u8,
  ) -> Option<u32> {
    match self.heap.lookup(ptr) {
      Lookup::Live(block) => Some(unsafe { block.get_ref_strong() }),
      _ => None,
    }
  }

  /// Total (strong plus weak) count of a live block.
  pub fn total_count(
    &self,
    ptr: *const u8,
  ) -> Option<u32> {
    match self.heap.lookup(ptr) {
      Lookup::Live(block) => Some(unsafe { block.get_ref_total() }),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use super::*;
  use crate::config::ArenaConfig;

  fn allocator() -> Allocator {
    Allocator::with_config(ArenaConfig::new().with_max_capacity(64 << 20))
  }

  fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
  }

  #[test]
  fn test_strong_and_weak_counts() {
    let mut alloc = allocator();
    let ptr = alloc.allocate(32, None).unwrap().as_ptr();

    alloc.acquire_strong(ptr).unwrap();
    alloc.acquire_weak(ptr).unwrap();
    assert_eq!(alloc.strong_count(ptr), Some(2));
    assert_eq!(alloc.total_count(ptr), Some(3));

    assert_eq!(alloc.release_weak(ptr).unwrap(), Released::Retained);
    assert!(matches!(alloc.release_weak(ptr), Err(AllocError::WeakUnderflow { .. })));
    assert_eq!(alloc.release_strong(ptr).unwrap(), Released::Retained);
    assert_eq!(alloc.release_strong(ptr).unwrap(), Released::Reclaimed);
    assert_eq!(alloc.strong_count(ptr), None);
  }

  #[test]
  fn test_release_after_reclaim_is_reported() {
    let mut alloc = allocator();
    let keep = alloc.allocate(16, None).unwrap();
    let ptr = alloc.allocate(32, None).unwrap().as_ptr();

    alloc.release_strong(ptr).unwrap();

    assert!(matches!(alloc.release_strong(ptr), Err(AllocError::NotAllocated { .. })));
    assert!(matches!(alloc.acquire_weak(ptr), Err(AllocError::NotAllocated { .. })));
    assert_eq!(alloc.total_count(keep.as_ptr()), Some(1));
  }

  #[test]
  fn test_unmanaged_pointers_are_ignored() {
    let mut alloc = allocator();
    alloc.allocate(16, None).unwrap();

    let mut local = 5u64;
    let foreign = &mut local as *mut u64 as *mut u8;

    alloc.acquire_strong(foreign).unwrap();
    alloc.acquire_weak(foreign).unwrap();
    assert_eq!(alloc.release_strong(foreign).unwrap(), Released::Unmanaged);
    assert_eq!(alloc.release_weak(foreign).unwrap(), Released::Unmanaged);
    assert_eq!(local, 5);
  }

  #[test]
  fn test_weak_then_strong_release_defers_finalizer() {
    let mut alloc = allocator();
    let runs = counter();
    let seen = runs.clone();
    let ptr = alloc
      .allocate_with(24, move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap()
      .as_ptr();

    alloc.acquire_weak(ptr).unwrap();
    assert_eq!(alloc.release_strong(ptr).unwrap(), Released::Retained);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(alloc.strong_count(ptr), Some(0));

    assert_eq!(alloc.release_weak(ptr).unwrap(), Released::Reclaimed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_finalizer_sees_intact_payload() {
    let mut alloc = allocator();
    let seen = counter();
    let observed = seen.clone();
    let ptr = alloc
      .allocate_with(64, move |_, payload| {
        let value = unsafe { (payload.as_ptr() as *const u64).read() };
        observed.store(value as usize, Ordering::SeqCst);
      })
      .unwrap();

    unsafe { (ptr.as_ptr() as *mut u64).write(0xFEED) };
    alloc.release_strong(ptr.as_ptr()).unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0xFEED);
  }

  #[test]
  fn test_finalizer_releases_nested_reference() {
    let mut alloc = allocator();
    let runs = counter();

    let child_runs = runs.clone();
    let child = alloc
      .allocate_with(16, move |_, _| {
        child_runs.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();

    let parent_runs = runs.clone();
    let parent = alloc
      .allocate_with(16, move |alloc, payload| {
        let child = unsafe { (payload.as_ptr() as *const *mut u8).read() };
        assert_eq!(alloc.release_weak(child).unwrap(), Released::Reclaimed);
        parent_runs.fetch_add(10, Ordering::SeqCst);
      })
      .unwrap();

    // parent holds the child through a weak reference only
    alloc.acquire_weak(child.as_ptr()).unwrap();
    alloc.release_strong(child.as_ptr()).unwrap();
    unsafe { (parent.as_ptr() as *mut *mut u8).write(child.as_ptr()) };

    assert_eq!(alloc.release_strong(parent.as_ptr()).unwrap(), Released::Reclaimed);
    assert_eq!(runs.load(Ordering::SeqCst), 11);
    assert_eq!(alloc.stats().used_blocks, 0);
    alloc.check().unwrap();
  }

  #[test]
  fn test_panicking_finalizer_still_reclaims() {
    let mut alloc = allocator();
    let before = alloc.allocate(16, None).unwrap();
    let ptr = alloc
      .allocate_with(16, |_, _| panic!("finalizer failure"))
      .unwrap();
    let after = alloc.allocate(16, None).unwrap();

    let err = alloc.release_strong(ptr.as_ptr()).unwrap_err();
    assert!(matches!(err, AllocError::FinalizerPanicked { count: 1 }));
    assert_eq!(alloc.total_count(ptr.as_ptr()), None);
    alloc.check().unwrap();

    alloc.release_strong(before.as_ptr()).unwrap();
    alloc.release_strong(after.as_ptr()).unwrap();
    assert_eq!(alloc.stats().free_blocks, 1);
    alloc.check().unwrap();
  }

  #[test]
  fn test_resurrected_block_is_not_freed() {
    let mut alloc = allocator();
    let ptr = alloc
      .allocate_with(16, |alloc, payload| {
        alloc.acquire_strong(payload.as_ptr()).unwrap();
      })
      .unwrap()
      .as_ptr();

    assert_eq!(alloc.release_strong(ptr).unwrap(), Released::Reclaimed);
    assert_eq!(alloc.strong_count(ptr), Some(1));

    // the finalizer already ran, the second reclamation just frees
    assert_eq!(alloc.release_strong(ptr).unwrap(), Released::Reclaimed);
    assert_eq!(alloc.strong_count(ptr), None);
  }

  #[test]
  fn test_reacquire_and_release_inside_own_finalizer() {
    let mut alloc = allocator();
    let _before = alloc.allocate(16, None).unwrap();
    let runs = counter();
    let seen = runs.clone();
    let ptr = alloc
      .allocate_with(32, move |alloc, payload| {
        alloc.acquire_strong(payload.as_ptr()).unwrap();
        assert_eq!(alloc.release_strong(payload.as_ptr()).unwrap(), Released::Reclaimed);
        seen.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap()
      .as_ptr();
    let _after = alloc.allocate(16, None).unwrap();

    assert_eq!(alloc.release_strong(ptr).unwrap(), Released::Reclaimed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(alloc.strong_count(ptr), None);
    assert_eq!(alloc.stats().used_blocks, 2);
    alloc.check().unwrap();

    let reused = alloc.allocate(32, None).unwrap().as_ptr();
    assert_eq!(reused, ptr);
    alloc.check().unwrap();
  }

  #[test]
  fn test_finalizer_touches_queued_siblings() {
    let mut alloc = allocator();
    let runs = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);

    let mut children = Vec::new();
    for i in 0..2 {
      let seen = runs.clone();
      let child = alloc
        .allocate_with(16, move |_, _| {
          seen[i].fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
        .as_ptr();
      alloc.acquire_weak(child).unwrap();
      alloc.release_strong(child).unwrap();
      children.push(child as usize);
    }
    let (left, right) = (children[0], children[1]);

    // Finalized first: the children are already queued and total is zero.
    let seen = runs.clone();
    let middle = alloc
      .allocate_with(16, move |alloc, _| {
        for child in [left as *const u8, right as *const u8] {
          assert_eq!(alloc.total_count(child), Some(0));
          alloc.acquire_weak(child).unwrap();
          assert_eq!(alloc.release_weak(child).unwrap(), Released::Reclaimed);
        }
        seen[2].fetch_add(1, Ordering::SeqCst);
      })
      .unwrap()
      .as_ptr();
    alloc.acquire_weak(middle).unwrap();
    alloc.release_strong(middle).unwrap();
    let middle = middle as usize;

    let root = alloc
      .allocate_with(16, move |alloc, _| {
        for addr in [left, right, middle] {
          alloc.release_weak(addr as *const u8).unwrap();
        }
      })
      .unwrap()
      .as_ptr();

    assert_eq!(alloc.release_strong(root).unwrap(), Released::Reclaimed);
    for run in runs.iter() {
      assert_eq!(run.load(Ordering::SeqCst), 1);
    }
    let stats = alloc.stats();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
    alloc.check().unwrap();
  }

  #[test]
  fn test_queued_block_reacquired_keeps_finalizer() {
    let mut alloc = allocator();
    let runs = counter();
    let seen = runs.clone();
    let child = alloc
      .allocate_with(16, move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap()
      .as_ptr();
    alloc.acquire_weak(child).unwrap();
    alloc.release_strong(child).unwrap();

    let addr = child as usize;
    let root = alloc
      .allocate_with(16, move |alloc, _| {
        alloc.release_weak(addr as *const u8).unwrap();
        alloc.acquire_strong(addr as *const u8).unwrap();
      })
      .unwrap()
      .as_ptr();

    alloc.release_strong(root).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(alloc.strong_count(child), Some(1));
    alloc.check().unwrap();

    assert_eq!(alloc.release_strong(child).unwrap(), Released::Reclaimed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    alloc.check().unwrap();
  }

  #[test]
  fn test_bounds_checked_access() {
    let mut alloc = allocator();
    let ptr = alloc.allocate(40, None).unwrap().as_ptr();
    let size = alloc.payload_size(ptr).unwrap();
    assert_eq!(size, 48);

    assert_eq!(alloc.bounds_checked_access(ptr, 0, 1, 64), None);
    assert_eq!(alloc.bounds_checked_access(ptr, 0, size as isize, 1), None);
    assert_eq!(alloc.bounds_checked_access(ptr, -1, 0, 0), None);
    assert_eq!(alloc.bounds_checked_access(ptr, 0, isize::MAX, 2), None);
    assert_eq!(
      alloc.bounds_checked_access(ptr, 0, size as isize - 1, 1),
      Some(ptr.wrapping_add(size - 1))
    );
    assert_eq!(alloc.bounds_checked_access(ptr, 8, 2, 4), Some(ptr.wrapping_add(16)));
  }

  #[test]
  fn test_bounds_check_skipped_for_foreign_pointers() {
    let alloc = allocator();
    let mut buffer = [0u8; 8];
    let ptr = buffer.as_mut_ptr();

    assert_eq!(alloc.bounds_checked_access(ptr, 0, 100, 1), Some(ptr.wrapping_add(100)));
    assert_eq!(alloc.bounds_checked_access(ptr, -4, 0, 0), Some(ptr.wrapping_sub(4)));
  }

  #[test]
  fn test_in_block() {
    let mut alloc = allocator();
    let a = alloc.allocate(32, None).unwrap().as_ptr();
    let b = alloc.allocate(32, None).unwrap().as_ptr();

    assert!(alloc.in_block(a, a));
    assert!(alloc.in_block(a, a.wrapping_add(31)));
    assert!(!alloc.in_block(a, a.wrapping_add(32)));
    assert!(!alloc.in_block(a, b));
    assert!(!alloc.in_block(a, a.wrapping_sub(1)));
  }
}
