//! In-arena block headers.
//!
//! ```text
//!   Free block:
//!   ┌──────┬───────┬──────┬──────┬──────────────────────────┬─────┐
//!   │ size │ flags │ prev │ next │          ....            │ tag │
//!   └──────┴───────┴──────┴──────┴──────────────────────────┴─────┘
//!
//!   Used block:
//!   ┌──────┬───────┬───────────────┬───────────┬──────────────────┐
//!   │ size │ flags │ strong, total │ finalizer │ payload ...      │
//!   └──────┴───────┴───────────────┴───────────┴──────────────────┘
//!   ◄──────────── HEADER_SIZE ────────────────►◄────── size ──────►
//! ```
//!
//! `prev`/`next` are byte offsets from the arena base. `tag` repeats `size`
//! so the following block can find this one's header.
//!
//! Accessors do no validation. Callers prove the address holds a header.

use std::{mem, ptr::NonNull};

use crate::refs::Finalizer;

/// Payload sizes and block offsets are multiples of this.
pub const GRANULE: usize = 16;

/// Bytes between a block's start and its payload.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Smallest payload a free block may have. It must hold the boundary tag.
pub const MIN_PAYLOAD: usize = GRANULE;

/// Free-list terminator.
pub const NIL: usize = usize::MAX;

const TAG_SIZE: usize = mem::size_of::<usize>();

const FREE: usize = 1 << 0;
const PREV_FREE: usize = 1 << 1;
const PENDING: usize = 1 << 2;
const MAGIC: usize = 0x6763_0000;
const MAGIC_MASK: usize = 0xFFFF_0000;

#[repr(C)]
#[derive(Clone, Copy)]
struct Links {
  prev: usize,
  next: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Users {
  strong: u32,
  total: u32,
  finalizer: *mut Finalizer,
}

#[repr(C)]
union Variant {
  free: Links,
  used: Users,
}

#[repr(C, align(16))]
pub struct Header {
  size: usize,
  flags: usize,
  variant: Variant,
}

/// Safe snapshot of a header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
  Free {
    prev: usize,
    next: usize,
  },
  Used {
    strong: u32,
    total: u32,
    has_finalizer: bool,
  },
}

/// A block header at a known address inside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block(NonNull<Header>);

impl Block {
  /// # Safety
  /// `addr` must be non-null, `GRANULE`-aligned, and have `HEADER_SIZE`
  /// mapped bytes behind it.
  pub unsafe fn at(addr: *mut u8) -> Self {
    Self(unsafe { NonNull::new_unchecked(addr as *mut Header) })
  }

  /// Header of the block whose payload starts at `payload`.
  ///
  /// # Safety
  /// `payload` must be at least `HEADER_SIZE` bytes past the arena base.
  pub unsafe fn header_of(payload: *mut u8) -> Self {
    unsafe { Self::at(payload.sub(HEADER_SIZE)) }
  }

  pub fn addr(self) -> *mut u8 {
    self.0.as_ptr() as *mut u8
  }

  fn raw(self) -> *mut Header {
    self.0.as_ptr()
  }

  pub fn get_payload(self) -> NonNull<u8> {
    // SAFETY: the payload directly follows a mapped header.
    unsafe { NonNull::new_unchecked(self.addr().add(HEADER_SIZE)) }
  }

  /// Writes a fresh header. Links and counters are cleared.
  pub unsafe fn init(
    self,
    size: usize,
    free: bool,
    prev_free: bool,
  ) {
    unsafe {
      let header = self.raw();
      let mut flags = MAGIC;
      if free {
        flags |= FREE;
      }
      if prev_free {
        flags |= PREV_FREE;
      }
      (*header).flags = flags;
      (*header).variant = if free {
        Variant {
          free: Links {
            prev: NIL,
            next: NIL,
          },
        }
      } else {
        Variant {
          used: Users {
            strong: 0,
            total: 0,
            finalizer: std::ptr::null_mut(),
          },
        }
      };
      self.set_size(size);
    }
  }

  /// Erases the magic so a stale pointer to an absorbed header no longer resolves.
  pub unsafe fn clear(self) {
    unsafe { (*self.raw()).flags = 0 };
  }

  pub unsafe fn has_magic(self) -> bool {
    unsafe { (*self.raw()).flags & MAGIC_MASK == MAGIC }
  }

  pub unsafe fn get_size(self) -> usize {
    unsafe { (*self.raw()).size }
  }

  /// Sets the payload size. A free block's boundary tag is rewritten too.
  pub unsafe fn set_size(
    self,
    size: usize,
  ) {
    unsafe {
      (*self.raw()).size = size;
      if self.get_flag() {
        self.boundary().write(size);
      }
    }
  }

  /// Address of the boundary tag: the last word of the payload.
  pub unsafe fn boundary(self) -> *mut usize {
    unsafe { self.addr().add(HEADER_SIZE + self.get_size() - TAG_SIZE) as *mut usize }
  }

  /// Header plus payload.
  pub unsafe fn full_size(self) -> usize {
    unsafe { HEADER_SIZE + self.get_size() }
  }

  /// `true` when the block is free.
  pub unsafe fn get_flag(self) -> bool {
    unsafe { (*self.raw()).flags & FREE != 0 }
  }

  /// Marks the block free or used. When the block has a successor its
  /// `PREV_FREE` bit is updated as well.
  pub unsafe fn set_flag(
    self,
    free: bool,
    has_successor: bool,
  ) {
    unsafe {
      let header = self.raw();
      if free {
        (*header).flags |= FREE;
      } else {
        (*header).flags &= !FREE;
      }

      if has_successor {
        self.get_after().set_prev_flag(free);
      }
    }
  }

  pub unsafe fn get_prev_flag(self) -> bool {
    unsafe { (*self.raw()).flags & PREV_FREE != 0 }
  }

  pub unsafe fn set_prev_flag(
    self,
    prev_free: bool,
  ) {
    unsafe {
      let header = self.raw();
      if prev_free {
        (*header).flags |= PREV_FREE;
      } else {
        (*header).flags &= !PREV_FREE;
      }
    }
  }

  /// `true` while the block is queued for reclamation or being finalized.
  pub unsafe fn is_pending(self) -> bool {
    unsafe { (*self.raw()).flags & PENDING != 0 }
  }

  pub unsafe fn set_pending(
    self,
    pending: bool,
  ) {
    unsafe {
      let header = self.raw();
      if pending {
        (*header).flags |= PENDING;
      } else {
        (*header).flags &= !PENDING;
      }
    }
  }

  pub unsafe fn get_next(self) -> usize {
    unsafe { (*self.raw()).variant.free.next }
  }

  pub unsafe fn set_next(
    self,
    next: usize,
  ) {
    unsafe { (*self.raw()).variant.free.next = next };
  }

  pub unsafe fn get_prev(self) -> usize {
    unsafe { (*self.raw()).variant.free.prev }
  }

  pub unsafe fn set_prev(
    self,
    prev: usize,
  ) {
    unsafe { (*self.raw()).variant.free.prev = prev };
  }

  pub unsafe fn get_ref_strong(self) -> u32 {
    unsafe { (*self.raw()).variant.used.strong }
  }

  pub unsafe fn set_ref_strong(
    self,
    strong: u32,
  ) {
    unsafe { (*self.raw()).variant.used.strong = strong };
  }

  pub unsafe fn get_ref_total(self) -> u32 {
    unsafe { (*self.raw()).variant.used.total }
  }

  pub unsafe fn set_ref_total(
    self,
    total: u32,
  ) {
    unsafe { (*self.raw()).variant.used.total = total };
  }

  pub unsafe fn get_finalizer(self) -> *mut Finalizer {
    unsafe { (*self.raw()).variant.used.finalizer }
  }

  pub unsafe fn set_finalizer(
    self,
    finalizer: *mut Finalizer,
  ) {
    unsafe { (*self.raw()).variant.used.finalizer = finalizer };
  }

  /// Moves the finalizer out of the header, leaving it empty.
  pub unsafe fn take_finalizer(self) -> Option<Box<Finalizer>> {
    unsafe {
      let finalizer = self.get_finalizer();
      if finalizer.is_null() {
        return None;
      }
      self.set_finalizer(std::ptr::null_mut());
      Some(Box::from_raw(finalizer))
    }
  }

  /// The next block in address order. May be one past the arena end.
  pub unsafe fn get_after(self) -> Block {
    unsafe { Self::at(self.addr().add(self.full_size())) }
  }

  /// The previous block in address order, only known when it is free.
  pub unsafe fn get_before(self) -> Option<Block> {
    unsafe {
      if !self.get_prev_flag() {
        return None;
      }
      let tag = (self.addr() as *const usize).sub(1).read();
      Some(Self::at(self.addr().sub(tag + HEADER_SIZE)))
    }
  }

  pub unsafe fn state(self) -> BlockState {
    unsafe {
      if self.get_flag() {
        BlockState::Free {
          prev: self.get_prev(),
          next: self.get_next(),
        }
      } else {
        BlockState::Used {
          strong: self.get_ref_strong(),
          total: self.get_ref_total(),
          has_finalizer: !self.get_finalizer().is_null(),
        }
      }
    }
  }
}
