//! # rgcat - A Reference-Counting Arena Allocator
//!
//! This crate provides a **free-list allocator with reference counting and
//! finalization**, meant to back the heap of a managed-language runtime.
//! Compiled client code allocates blocks, takes and drops strong (stack-rooted)
//! and weak (heap-rooted) references, and the allocator reclaims a block as
//! soon as its last reference is gone.
//!
//! ## Overview
//!
//! All blocks live in one contiguous arena obtained from the OS with `mmap`:
//!
//! ```text
//!   Arena:
//!
//!   ┌────────────────────────────────────────────────────────────────────┐
//!   │ ┌────┬────────┐┌────┬─────────────┐┌────┬──────┐┌────┬───────────┐ │
//!   │ │hdr │ used   ││hdr │ free     tag││hdr │ used ││hdr │ free   tag│ │
//!   │ └────┴────────┘└────┴─────────────┘└────┴──────┘└────┴───────────┘ │
//!   │                  ▲         │                      ▲                │
//!   │                  └─────────┼──── free list ───────┘                │
//!   └────────────────────────────────────────────────────────────────────┘
//!   ▲                                                                    ▲
//!  base                                                       base + capacity
//! ```
//!
//! - Allocation walks the free list from a rotating cursor, splits the first
//!   block that fits, and doubles the arena when nothing fits.
//! - Freeing coalesces with both neighbours immediately. The following block
//!   finds a free predecessor through its boundary tag.
//! - The header of any handed-out pointer sits exactly [`HEADER_SIZE`] bytes
//!   before it.
//!
//! ## Crate Structure
//!
//! ```text
//!   rgcat
//!   ├── align      - Granule/page rounding macros (align!, align_to!)
//!   ├── config     - ArenaConfig
//!   ├── error      - AllocError
//!   ├── region     - Provider trait, MmapProvider, Region
//!   ├── block      - In-arena header encoding (internal)
//!   ├── engine     - Fit search, split, coalesce, growth (internal)
//!   ├── refs       - Strong/weak counting, finalizers, bounds checks
//!   ├── allocator  - Allocator, SharedAllocator, global functions
//!   └── stats      - ArenaStats, heap walk, consistency check
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rgcat::{Allocator, Released};
//!
//! let mut allocator = Allocator::new();
//!
//! let ptr = allocator
//!   .allocate_with(64, |_, payload| println!("finalizing {:?}", payload))
//!   .unwrap();
//!
//! unsafe { (ptr.as_ptr() as *mut u64).write(42) };
//!
//! // A heap object starts observing the block.
//! allocator.acquire_weak(ptr.as_ptr()).unwrap();
//!
//! // The stack frame lets go; the weak reference keeps it alive.
//! assert_eq!(allocator.release_strong(ptr.as_ptr()).unwrap(), Released::Retained);
//!
//! // Last reference: the finalizer runs and the block is reclaimed.
//! assert_eq!(allocator.release_weak(ptr.as_ptr()).unwrap(), Released::Reclaimed);
//! ```
//!
//! ## Block Lifecycle
//!
//! ```text
//!   uncommitted ──grow──► Free ──allocate──► Used ──total == 0──► finalizer
//!                          ▲                                          │
//!                          └────────── free + coalesce ◄──────────────┘
//! ```
//!
//! Finalizers may release references held in the payload they finalize.
//! Those releases are queued and handled by the outermost release in a loop,
//! so long reference chains never deepen the native stack.
//!
//! ## Limitations
//!
//! - **No cycle detection**: cyclic strong references leak
//! - **Single arena**: one contiguous range, capped by `ArenaConfig::max_capacity`
//! - **Not thread-safe by itself**: wrap it in [`SharedAllocator`] to share it
//! - **Unix-only**: requires `libc` and `mmap`/`mprotect`
//!
//! ## Safety
//!
//! The API takes raw pointers so generated code can pass managed and
//! unmanaged pointers alike. Pointers outside the arena are ignored;
//! pointers inside it are checked against the header magic before use.

pub mod align;
mod allocator;
mod block;
pub mod config;
mod engine;
pub mod error;
mod refs;
pub mod region;
mod stats;

pub use allocator::{
  Allocator, SharedAllocator, acquire_strong, acquire_weak, allocate, bounds_checked_access, global,
  release_strong, release_weak,
};
pub use block::{GRANULE, HEADER_SIZE};
pub use config::ArenaConfig;
pub use error::AllocError;
pub use refs::{Finalizer, Released};
pub use region::{MmapProvider, Provider, Region};
pub use stats::{ArenaStats, BlockInfo, Blocks, Inconsistency};
