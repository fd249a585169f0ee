//! Arena configuration.
//!
//! Values can be set programmatically or read from the environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RGCAT_GROWTH_UNIT` | Initial arena size in bytes | 65536 (64 KiB) |
//! | `RGCAT_MAX_CAPACITY` | Upper bound on arena size in bytes | 1073741824 (1 GiB) |
//! | `RGCAT_GUARD_PAGES` | Surround the arena with no-access pages ("true"/"false") | false |

use std::env;

use crate::error::AllocError;

/// Sizing and hardening parameters for one arena.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
  /// Size of the first reservation. Rounded up to the OS page size.
  /// Each growth doubles the current capacity.
  pub growth_unit: usize,

  /// The arena never grows past this many bytes. The address range is
  /// reserved up front so growth never moves the base.
  pub max_capacity: usize,

  /// Install a no-access page directly below the arena and directly above
  /// the committed range.
  pub guard_pages: bool,
}

impl ArenaConfig {
  /// Default first reservation: 64 KiB.
  pub const DEFAULT_GROWTH_UNIT: usize = 64 * 1024;

  /// Default capacity limit: 1 GiB.
  pub const DEFAULT_MAX_CAPACITY: usize = 1 << 30;

  pub fn new() -> Self {
    Self {
      growth_unit: Self::DEFAULT_GROWTH_UNIT,
      max_capacity: Self::DEFAULT_MAX_CAPACITY,
      guard_pages: false,
    }
  }

  pub fn with_growth_unit(
    mut self,
    growth_unit: usize,
  ) -> Self {
    self.growth_unit = growth_unit;
    self
  }

  pub fn with_max_capacity(
    mut self,
    max_capacity: usize,
  ) -> Self {
    self.max_capacity = max_capacity;
    self
  }

  pub fn with_guard_pages(
    mut self,
    guard_pages: bool,
  ) -> Self {
    self.guard_pages = guard_pages;
    self
  }

  /// Load from `RGCAT_*` environment variables. Missing or unparsable
  /// values keep their defaults.
  pub fn from_env() -> Self {
    let mut config = Self::new();

    if let Some(unit) = env_usize("RGCAT_GROWTH_UNIT") {
      config.growth_unit = unit;
    }
    if let Some(max) = env_usize("RGCAT_MAX_CAPACITY") {
      config.max_capacity = max;
    }
    if let Some(guard) = env::var("RGCAT_GUARD_PAGES").ok().and_then(|v| parse_bool(&v)) {
      config.guard_pages = guard;
    }

    config
  }

  /// Checks that the limits are usable.
  pub fn validate(&self) -> Result<(), AllocError> {
    if self.growth_unit == 0 {
      return Err(AllocError::InvalidConfig {
        reason: "growth unit must be non-zero",
      });
    }
    if self.max_capacity < self.growth_unit {
      return Err(AllocError::InvalidConfig {
        reason: "max capacity is smaller than the growth unit",
      });
    }
    if self.max_capacity > isize::MAX as usize {
      return Err(AllocError::InvalidConfig {
        reason: "max capacity exceeds isize::MAX",
      });
    }
    Ok(())
  }
}

impl Default for ArenaConfig {
  fn default() -> Self {
    Self::new()
  }
}

fn env_usize(name: &str) -> Option<usize> {
  env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
  match value.trim().to_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}
