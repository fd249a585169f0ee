//! Error types for the arena and its reference-counting layer.

use std::io;

use thiserror::Error;

/// Errors reported by the allocator.
///
/// Pointers outside the arena are never an error (acquire/release on them
/// is a no-op), and a failed bounds check is `None`, not an error.
#[derive(Error, Debug)]
pub enum AllocError {
  /// The operating system refused the initial reservation.
  #[error("failed to reserve {size} bytes of arena memory: {source}")]
  Reserve {
    /// Requested size in bytes.
    size: usize,
    /// Underlying OS error.
    #[source]
    source: io::Error,
  },

  /// The operating system refused to extend the arena.
  #[error("failed to grow arena from {from} to {to} bytes: {source}")]
  Grow {
    /// Capacity before the attempt.
    from: usize,
    /// Capacity that was requested.
    to: usize,
    /// Underlying OS error.
    #[source]
    source: io::Error,
  },

  /// Growing would exceed the configured capacity limit.
  #[error("arena capacity exhausted: requested {requested} bytes, limit {limit} bytes")]
  CapacityExhausted {
    /// Capacity that would have been needed.
    requested: usize,
    /// Configured upper bound.
    limit: usize,
  },

  /// The request cannot be represented once header and rounding are added.
  #[error("allocation of {size} bytes is too large")]
  TooLarge {
    /// Requested payload size.
    size: usize,
  },

  /// The configuration is unusable.
  #[error("invalid arena configuration: {reason}")]
  InvalidConfig {
    /// What is wrong with it.
    reason: &'static str,
  },

  /// The pointer lies inside the arena but is not the payload of a live block.
  #[error("{addr:#x} is not a live allocation")]
  NotAllocated {
    /// Offending address.
    addr: usize,
  },

  /// `release_strong` on a block that has no strong references left.
  #[error("strong reference count of {addr:#x} would drop below zero")]
  StrongUnderflow {
    /// Payload address.
    addr: usize,
  },

  /// `release_weak` on a block that has no weak references left.
  #[error("weak reference count of {addr:#x} would drop below zero")]
  WeakUnderflow {
    /// Payload address.
    addr: usize,
  },

  /// A reference counter would exceed `u32::MAX`.
  #[error("reference count of {addr:#x} overflowed")]
  CounterOverflow {
    /// Payload address.
    addr: usize,
  },

  /// One or more finalizers panicked. The blocks were still reclaimed.
  #[error("{count} finalizer(s) panicked during reclamation")]
  FinalizerPanicked {
    /// Number of finalizers that panicked.
    count: usize,
  },
}
