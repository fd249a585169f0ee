//! Public entry points.
//!
//! [`Allocator`] owns one arena and is single-threaded. [`SharedAllocator`]
//! puts a whole allocator behind one lock. The free functions at the bottom
//! of this module act on a lazily created process-wide [`SharedAllocator`].

use std::{ptr::NonNull, sync::OnceLock};

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::{
  config::ArenaConfig,
  engine::{Heap, Lookup},
  error::AllocError,
  refs::{Finalizer, Released},
  region::{MmapProvider, Provider},
};

/// A reference-counting allocator over a single growable arena.
///
/// The arena is reserved on the first call to [`allocate`](Self::allocate).
pub struct Allocator {
  pub(crate) heap: Heap,
  pub(crate) pending: Vec<usize>,
  pub(crate) draining: bool,
}

impl Allocator {
  pub fn new() -> Self {
    Self::with_config(ArenaConfig::new())
  }

  pub fn with_config(config: ArenaConfig) -> Self {
    let growth_unit = config.growth_unit;
    Self::with_provider(MmapProvider::new(config), growth_unit)
  }

  /// Uses a custom memory source. `growth_unit` is the size requested on
  /// the first reservation.
  pub fn with_provider(
    provider: impl Provider + 'static,
    growth_unit: usize,
  ) -> Self {
    Self {
      heap: Heap::new(Box::new(provider), growth_unit),
      pending: Vec::new(),
      draining: false,
    }
  }

  /// Allocates at least `size` bytes. The new block starts with one strong
  /// reference (strong = total = 1).
  pub fn allocate(
    &mut self,
    size: usize,
    finalizer: Option<Finalizer>,
  ) -> Result<NonNull<u8>, AllocError> {
    let block = self.heap.allocate(size)?;

    if let Some(finalizer) = finalizer {
      unsafe { block.set_finalizer(Box::into_raw(Box::new(finalizer))) };
    }

    Ok(block.get_payload())
  }

  /// [`allocate`](Self::allocate) with a closure finalizer.
  pub fn allocate_with<F>(
    &mut self,
    size: usize,
    finalizer: F,
  ) -> Result<NonNull<u8>, AllocError>
  where
    F: FnOnce(&mut Allocator, NonNull<u8>) + Send + 'static,
  {
    self.allocate(size, Some(Box::new(finalizer)))
  }

  /// Usable payload bytes of a live block. May exceed the requested size.
  pub fn payload_size(
    &self,
    ptr: *const u8,
  ) -> Option<usize> {
    match self.heap.lookup(ptr) {
      Lookup::Live(block) => Some(unsafe { block.get_size() }),
      _ => None,
    }
  }

  /// Whether `ptr` lies inside the arena at all.
  pub fn is_managed(
    &self,
    ptr: *const u8,
  ) -> bool {
    self.heap.region().contains(ptr)
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for Allocator {
  /// Finalizers of blocks that are still live are dropped without being run.
  fn drop(&mut self) {
    let live: Vec<usize> = self
      .heap
      .blocks()
      .filter(|info| !info.free)
      .map(|info| info.offset)
      .collect();

    let mut dropped = 0;
    for offset in live {
      if unsafe { self.heap.block_at(offset).take_finalizer() }.is_some() {
        dropped += 1;
      }
    }

    trace!(dropped, "allocator dropped");
  }
}

/// An [`Allocator`] behind a single mutex.
///
/// Finalizers run while the lock is held. They must use the `&mut Allocator`
/// they are given; calling back into the same `SharedAllocator` deadlocks.
pub struct SharedAllocator {
  inner: Mutex<Allocator>,
}

impl SharedAllocator {
  pub fn new(allocator: Allocator) -> Self {
    Self {
      inner: Mutex::new(allocator),
    }
  }

  /// Locks the allocator for a sequence of operations.
  pub fn lock(&self) -> MutexGuard<'_, Allocator> {
    self.inner.lock()
  }

  pub fn allocate(
    &self,
    size: usize,
    finalizer: Option<Finalizer>,
  ) -> Result<NonNull<u8>, AllocError> {
    self.lock().allocate(size, finalizer)
  }

  pub fn acquire_strong(
    &self,
    ptr: *const u8,
  ) -> Result<(), AllocError> {
    self.lock().acquire_strong(ptr)
  }

  pub fn acquire_weak(
    &self,
    ptr: *const u8,
  ) -> Result<(), AllocError> {
    self.lock().acquire_weak(ptr)
  }

  pub fn release_strong(
    &self,
    ptr: *const u8,
  ) -> Result<Released, AllocError> {
    self.lock().release_strong(ptr)
  }

  pub fn release_weak(
    &self,
    ptr: *const u8,
  ) -> Result<Released, AllocError> {
    self.lock().release_weak(ptr)
  }

  pub fn bounds_checked_access(
    &self,
    ptr: *mut u8,
    base: isize,
    offset: isize,
    step: isize,
  ) -> Option<*mut u8> {
    self.lock().bounds_checked_access(ptr, base, offset, step)
  }
}

static GLOBAL: OnceLock<SharedAllocator> = OnceLock::new();

/// The process-wide allocator, configured from `RGCAT_*` variables on first use.
pub fn global() -> &'static SharedAllocator {
  GLOBAL.get_or_init(|| SharedAllocator::new(Allocator::with_config(ArenaConfig::from_env())))
}

/// Allocates from the process-wide allocator.
pub fn allocate(
  size: usize,
  finalizer: Option<Finalizer>,
) -> Result<NonNull<u8>, AllocError> {
  global().allocate(size, finalizer)
}

pub fn acquire_strong(ptr: *const u8) -> Result<(), AllocError> {
  global().acquire_strong(ptr)
}

pub fn acquire_weak(ptr: *const u8) -> Result<(), AllocError> {
  global().acquire_weak(ptr)
}

pub fn release_strong(ptr: *const u8) -> Result<Released, AllocError> {
  global().release_strong(ptr)
}

pub fn release_weak(ptr: *const u8) -> Result<Released, AllocError> {
  global().release_weak(ptr)
}

pub fn bounds_checked_access(
  ptr: *mut u8,
  base: isize,
  offset: isize,
  step: isize,
) -> Option<*mut u8> {
  global().bounds_checked_access(ptr, base, offset, step)
}
