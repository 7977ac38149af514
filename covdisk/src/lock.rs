//! Cancellation and per-descriptor locking (C8).

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

/// A process-wide cooperative cancellation flag.
///
/// Long-running loops (preallocated-delta fill, raw-delta fill, version
/// conversion, merge, live-copy phases) poll [`CancelFlag::is_set`] at
/// each cluster boundary. Consuming the flag with [`CancelFlag::take`]
/// clears it, so a single cancel request aborts exactly one operation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Creates a fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of whatever loop is currently polling this
    /// flag.
    pub fn request(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation has been requested, without
    /// consuming it.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Consumes a pending cancellation request, clearing the flag and
    /// returning whether one was pending.
    pub fn take(&self) -> bool {
        self.inner.swap(false, Ordering::SeqCst)
    }

    /// Polls the flag and returns [`Error::Cancelled`] if set, clearing
    /// it in the process. Call this at cluster boundaries in long loops.
    pub fn check(&self, op: &'static str) -> Result<()> {
        if self.take() { Err(Error::Cancelled(op)) } else { Ok(()) }
    }
}

/// An advisory exclusive lock on a descriptor's sibling lock file.
///
/// Held for the duration of every operation that mutates the descriptor
/// or the running device. Backed by `flock(2)`, so an unclean process
/// exit releases it automatically.
#[derive(Debug)]
pub struct DescriptorLock {
    _flock: Flock<File>,
}

impl DescriptorLock {
    /// Acquires the exclusive lock on `lock_path`, creating the file if
    /// it does not exist. Blocks until the lock is available.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| Error::Lock(format!("open {}: {e}", lock_path.display())))?;

        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Lock(format!("flock {}: {errno}", lock_path.display())))?;

        Ok(Self { _flock: flock })
    }

    /// Attempts to acquire the lock without blocking; returns
    /// `Error::Lock` immediately if another operation holds it.
    pub fn try_acquire(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| Error::Lock(format!("open {}: {e}", lock_path.display())))?;

        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| Error::Lock(format!("{} is locked by another operation: {errno}", lock_path.display())))?;

        Ok(Self { _flock: flock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_round_trips() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        flag.request();
        assert!(flag.is_set());
        assert!(flag.take());
        assert!(!flag.is_set());
    }

    #[test]
    fn check_clears_after_firing() {
        let flag = CancelFlag::new();
        flag.request();
        assert!(flag.check("fill").is_err());
        assert!(flag.check("fill").is_ok());
    }

    #[test]
    fn descriptor_lock_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("DiskDescriptor.lck");
        let first = DescriptorLock::acquire(&lock_path).expect("first lock");
        let second = DescriptorLock::try_acquire(&lock_path);
        assert!(second.is_err());
        drop(first);
        assert!(DescriptorLock::try_acquire(&lock_path).is_ok());
    }
}
