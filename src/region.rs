//! The arena's backing memory.
//!
//! ```text
//!   MmapProvider reservation (guard pages enabled):
//!
//!   ┌───────┬──────────────────────────┬───────┬──────────────────────┐
//!   │ guard │   committed (RW)         │ guard │  reserved (PROT_NONE)│
//!   └───────┴──────────────────────────┴───────┴──────────────────────┘
//!           ▲                          ▲
//!          base                  base + capacity
//!
//!   grow() commits more pages in place: the base never moves and the
//!   upper guard is simply the first page past the committed range.
//! ```

use std::{io, ptr, ptr::NonNull};

use libc::{
  MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
  c_void,
};
use tracing::{debug, error};

use crate::{align_to, config::ArenaConfig, error::AllocError};

/// Source of contiguous, zero-initialised memory for an arena.
///
/// `grow` may move the base; callers must use the returned base. All
/// bookkeeping inside the arena is offset-based for that reason.
pub trait Provider: Send {
  /// Reserves at least `min_size` bytes. Returns the base and the actual size.
  fn reserve(
    &mut self,
    min_size: usize,
  ) -> Result<(NonNull<u8>, usize), AllocError>;

  /// Extends the region at `base` from `old_size` to at least `new_size`.
  /// The first `old_size` bytes are preserved, the rest are zeroed.
  fn grow(
    &mut self,
    base: NonNull<u8>,
    old_size: usize,
    new_size: usize,
  ) -> Result<(NonNull<u8>, usize), AllocError>;
}

/// The committed range of an arena, `[base, base + capacity)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
  base: NonNull<u8>,
  capacity: usize,
}

// SAFETY: a Region is only an address range; access goes through the owner.
unsafe impl Send for Region {}

impl Region {
  pub fn new(
    base: NonNull<u8>,
    capacity: usize,
  ) -> Self {
    Self { base, capacity }
  }

  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Offset of `addr` from the base, if it lies inside the range.
  ///
  /// Compares integer addresses so pointers from unrelated allocations can
  /// be tested safely.
  pub fn offset_of(
    &self,
    addr: *const u8,
  ) -> Option<usize> {
    (addr as usize)
      .checked_sub(self.base.as_ptr() as usize)
      .filter(|offset| *offset < self.capacity)
  }

  pub fn contains(
    &self,
    addr: *const u8,
  ) -> bool {
    self.offset_of(addr).is_some()
  }

  /// Address at `offset`. `offset` must be `<= capacity`.
  pub fn at(
    &self,
    offset: usize,
  ) -> *mut u8 {
    debug_assert!(offset <= self.capacity);
    // SAFETY: offset is within the mapping (or one past its committed end).
    unsafe { self.base.as_ptr().add(offset) }
  }
}

/// Queries the OS page size.
pub fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { 4096 } else { size as usize }
}

struct Mapping {
  start: *mut u8,
  len: usize,
  base: *mut u8,
  limit: usize,
}

/// Default [`Provider`]: anonymous `mmap` reservation committed with `mprotect`.
pub struct MmapProvider {
  config: ArenaConfig,
  page: usize,
  mapping: Option<Mapping>,
}

// SAFETY: the mapping is owned exclusively by this provider.
unsafe impl Send for MmapProvider {}

impl MmapProvider {
  pub fn new(config: ArenaConfig) -> Self {
    Self {
      config,
      page: page_size(),
      mapping: None,
    }
  }

  fn guard_len(&self) -> usize {
    if self.config.guard_pages { self.page } else { 0 }
  }

  unsafe fn commit(
    addr: *mut u8,
    len: usize,
  ) -> io::Result<()> {
    let rc = unsafe { libc::mprotect(addr as *mut c_void, len, PROT_READ | PROT_WRITE) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
  }
}

impl Provider for MmapProvider {
  fn reserve(
    &mut self,
    min_size: usize,
  ) -> Result<(NonNull<u8>, usize), AllocError> {
    self.config.validate()?;

    let limit = align_to!(self.config.max_capacity, self.page);
    let mut size = align_to!(self.config.growth_unit, self.page);
    while size < min_size {
      size = size.checked_mul(2).ok_or(AllocError::TooLarge { size: min_size })?;
    }
    if size > limit {
      return Err(AllocError::CapacityExhausted {
        requested: size,
        limit,
      });
    }

    let guard = self.guard_len();
    let len = limit + 2 * guard;

    let start = unsafe {
      libc::mmap(
        ptr::null_mut(),
        len,
        PROT_NONE,
        MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
        -1,
        0,
      )
    };
    if start == MAP_FAILED {
      let source = io::Error::last_os_error();
      error!(len, %source, "arena reservation failed");
      return Err(AllocError::Reserve { size: len, source });
    }

    let start = start as *mut u8;
    // SAFETY: guard < len, the reservation covers guard + limit + guard.
    let base = unsafe { start.add(guard) };

    if let Err(source) = unsafe { Self::commit(base, size) } {
      error!(size, %source, "committing initial arena failed");
      unsafe { libc::munmap(start as *mut c_void, len) };
      return Err(AllocError::Reserve { size, source });
    }

    self.mapping = Some(Mapping {
      start,
      len,
      base,
      limit,
    });

    debug!(
      base = ?base,
      size,
      limit,
      guard_pages = self.config.guard_pages,
      "reserved arena"
    );

    // SAFETY: mmap never returns null on success.
    Ok((unsafe { NonNull::new_unchecked(base) }, size))
  }

  fn grow(
    &mut self,
    base: NonNull<u8>,
    old_size: usize,
    new_size: usize,
  ) -> Result<(NonNull<u8>, usize), AllocError> {
    let page = self.page;
    let mapping = match &self.mapping {
      Some(mapping) if mapping.base == base.as_ptr() => mapping,
      _ => {
        return Err(AllocError::Grow {
          from: old_size,
          to: new_size,
          source: io::Error::new(io::ErrorKind::InvalidInput, "region not owned by this provider"),
        });
      }
    };

    let new_size = align_to!(new_size, page);
    if new_size > mapping.limit {
      return Err(AllocError::CapacityExhausted {
        requested: new_size,
        limit: mapping.limit,
      });
    }
    if new_size <= old_size {
      return Ok((base, old_size));
    }

    // SAFETY: [old_size, new_size) lies inside the reservation.
    let tail = unsafe { base.as_ptr().add(old_size) };
    if let Err(source) = unsafe { Self::commit(tail, new_size - old_size) } {
      error!(old_size, new_size, %source, "arena growth failed");
      return Err(AllocError::Grow {
        from: old_size,
        to: new_size,
        source,
      });
    }

    debug!(old_size, new_size, "grew arena in place");
    Ok((base, new_size))
  }
}

impl Drop for MmapProvider {
  fn drop(&mut self) {
    if let Some(mapping) = self.mapping.take() {
      unsafe { libc::munmap(mapping.start as *mut c_void, mapping.len) };
    }
  }
}
