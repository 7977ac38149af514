//! Process-wide configuration assembled once from the environment.
//!
//! Call sites take a [`Config`] by reference instead of reaching for
//! `std::env::var` directly, so tests can construct one without touching
//! the process environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default location of the host's minor-allocation sequence point.
const DEFAULT_MINOR_PATH: &str = "/proc/vz/ploop_minor";

/// Recognized environment variables, read once and carried as data.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PLOOP_SKIP_EXT4_EXTENTS_CHECK` — skip the extents-flag gate in
    /// [`crate::MountManager`] when set.
    pub skip_ext4_extents_check: bool,

    /// `SKIP_TOPDELTA_DESTROY` — during switch-to-snapshot, keep the
    /// current top image instead of removing it.
    pub skip_topdelta_destroy: bool,

    /// `SKIP_TOPDELTA_CREATE` — during switch-to-snapshot, promote the
    /// target snapshot to `TOP_UUID` instead of adding a fresh empty
    /// delta above it.
    pub skip_topdelta_create: bool,

    /// Path to the host's minor-allocation sequence point. Overridable so
    /// tests can point it at a scratch file instead of `/proc`.
    pub minor_path: PathBuf,
}

impl Config {
    /// Reads recognized environment variables into a `Config`. Unset
    /// variables take their documented default.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            skip_ext4_extents_check: std::env::var_os("PLOOP_SKIP_EXT4_EXTENTS_CHECK").is_some(),
            skip_topdelta_destroy: std::env::var_os("SKIP_TOPDELTA_DESTROY").is_some(),
            skip_topdelta_create: std::env::var_os("SKIP_TOPDELTA_CREATE").is_some(),
            minor_path: PathBuf::from(DEFAULT_MINOR_PATH),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skip_ext4_extents_check: false,
            skip_topdelta_destroy: false,
            skip_topdelta_create: false,
            minor_path: PathBuf::from(DEFAULT_MINOR_PATH),
        }
    }
}

/// A bounded 1 Hz retry policy for a family of control calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Retry policy for device-control calls that may return *busy*: 60
    /// attempts at 1 Hz.
    pub const BUSY: Self = Self { attempts: 60, interval: Duration::from_secs(1) };

    /// Retry policy for `umount`: 6 attempts at 1 Hz.
    pub const UMOUNT: Self = Self { attempts: 6, interval: Duration::from_secs(1) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_unset_env() {
        let cfg = Config::default();
        assert!(!cfg.skip_ext4_extents_check);
        assert_eq!(cfg.minor_path, PathBuf::from(DEFAULT_MINOR_PATH));
    }

    #[test]
    fn retry_policies_match_spec_bounds() {
        assert_eq!(RetryPolicy::BUSY.attempts, 60);
        assert_eq!(RetryPolicy::UMOUNT.attempts, 6);
    }
}
