/// Rounds a value up to the block granule (see [`GRANULE`](crate::GRANULE)).
///
/// Every payload size and every block offset in the arena is a multiple of
/// the granule, which keeps headers and boundary tags naturally aligned.
///
/// # Examples
///
/// ```rust
/// use rgcat::align;
///
/// assert_eq!(align!(1), 16);
/// assert_eq!(align!(16), 16);
/// assert_eq!(align!(17), 32);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::GRANULE)
  };
}

/// Rounds a value up to an arbitrary power-of-two boundary.
///
/// ```rust
/// use rgcat::align_to;
///
/// assert_eq!(align_to!(5000, 4096), 8192);
/// assert_eq!(align_to!(4096, 4096), 4096);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $align:expr) => {
    ($value + $align - 1) & !($align - 1)
  };
}

/// Overflow-checked version of [`align_to!`] for sizes that come from callers.
pub const fn checked_align_to(
  value: usize,
  align: usize,
) -> Option<usize> {
  match value.checked_add(align - 1) {
    Some(padded) => Some(padded & !(align - 1)),
    None => None,
  }
}
