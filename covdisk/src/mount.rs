//! Mount sequence and filesystem freeze/thaw (C5).
//!
//! `mount_fs`'s two-step mount and the extents-flag gate are grounded
//! in §4.5; freeze/thaw via `FIFREEZE`/`FITHAW` follows the same
//! ioctl-wrapper shape as the rest of the control-surface code in
//! [`crate::device`].

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use nix::mount::{MsFlags, mount, umount2, MntFlags};

use crate::config::{Config, RetryPolicy};
use crate::error::{Error, Result};

nix::ioctl_none!(ioc_freeze, b'X', 119);
nix::ioctl_none!(ioc_thaw, b'X', 120);

/// Guards a filesystem frozen with [`MountManager::freeze`], thawing it
/// on drop regardless of the caller's success or failure path.
pub struct FreezeGuard<'a> {
    manager: &'a MountManager,
    target: PathBuf,
    active: bool,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.manager.thaw(&self.target) {
                tracing::warn!(target = %self.target.display(), error = %err, "failed to thaw filesystem on guard drop");
            }
        }
    }
}

/// Two-step mount, fsck dispatch, the extents gate, and retrying
/// unmount.
pub struct MountManager {
    config: Config,
}

impl MountManager {
    /// Creates a manager reading environment escape hatches from
    /// `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Forces the kernel to rescan `device`'s partition table (§4.5 step 1).
    pub fn rescan_partitions(&self, device: &Path) -> Result<()> {
        let file = std::fs::File::open(device)?;
        // BLKRRPART: re-read partition table. Harmless if unsupported.
        const BLKRRPART: u64 = 0x125f;
        // SAFETY: `file` stays open for the ioctl's duration; no output buffer.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
        if rc < 0 {
            let errno = nix::Error::last();
            if errno != nix::Error::EINVAL && errno != nix::Error::EBUSY {
                return Err(Error::DeviceIoctl { op: "BLKRRPART", source: std::io::Error::from(errno) });
            }
        }
        Ok(())
    }

    /// The partition device name for a ploop device (`deviceNp1`, §4.5
    /// step 2).
    #[must_use]
    pub fn partition_device(device: &Path) -> PathBuf {
        let mut name = device.as_os_str().to_os_string();
        name.push("p1");
        PathBuf::from(name)
    }

    /// Runs `e2fsck -p` on `partition` if `fstype` is an ext-family
    /// filesystem (§4.5 step 3).
    pub fn fsck_if_needed(&self, partition: &Path, fstype: &str, run: bool) -> Result<()> {
        if !run || !fstype.starts_with("ext") {
            return Ok(());
        }
        let status = Command::new("e2fsck")
            .arg("-p")
            .arg(partition)
            .status()
            .map_err(|e| Error::Fsck(format!("spawn e2fsck: {e}")))?;
        // e2fsck exit code 1 means "errors corrected", not failure.
        if !status.success() && status.code() != Some(1) {
            return Err(Error::Fsck(format!("e2fsck {} exited with {status}", partition.display())));
        }
        Ok(())
    }

    /// Two-step mount: read-only, `stat` the balloon file for its
    /// inode, then remount with `balloon_ino=<inode>` appended to
    /// `mount_data` (§4.5 step 4).
    pub fn mount_fs(&self, partition: &Path, target: &Path, fstype: &str, ro: bool, mount_data: &str) -> Result<()> {
        self.check_extents(partition, fstype)?;

        do_mount(partition, target, fstype, true, mount_data)?;

        let balloon_ino = match std::fs::metadata(target.join(".balloon-0123456789abcdef.img")) {
            Ok(meta) => {
                use std::os::unix::fs::MetadataExt;
                Some(meta.ino())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                let _ = umount2(target, MntFlags::empty());
                return Err(Error::Mount(format!("stat balloon file: {err}")));
            }
        };

        if let Err(err) = umount2(target, MntFlags::empty()) {
            return Err(Error::Mount(format!("unmount after balloon discovery: {err}")));
        }

        let data = match balloon_ino {
            Some(ino) if mount_data.is_empty() => format!("balloon_ino={ino}"),
            Some(ino) => format!("{mount_data},balloon_ino={ino}"),
            None => mount_data.to_string(),
        };
        do_mount(partition, target, fstype, ro, &data)
    }

    /// Rejects ext3/ext4 bases that lack the *extents* inode flag,
    /// unless the escape hatch environment variable is set (§4.5 step 5,
    /// §6.4).
    fn check_extents(&self, partition: &Path, fstype: &str) -> Result<()> {
        if self.config.skip_ext4_extents_check {
            return Ok(());
        }
        if fstype != "ext3" && fstype != "ext4" {
            return Ok(());
        }
        let output = Command::new("dumpe2fs")
            .arg("-h")
            .arg(partition)
            .output()
            .map_err(|e| Error::Mount(format!("spawn dumpe2fs: {e}")))?;
        if !output.status.success() {
            return Err(Error::Mount(format!("dumpe2fs {} failed", partition.display())));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let has_extents = text
            .lines()
            .find(|l| l.starts_with("Filesystem features:"))
            .is_some_and(|l| l.contains("extent"));
        if !has_extents {
            return Err(Error::Mount(format!(
                "{} lacks the extents feature; set PLOOP_SKIP_EXT4_EXTENTS_CHECK to bypass",
                partition.display()
            )));
        }
        Ok(())
    }

    /// Unmounts `target`, retrying on *busy* up to [`RetryPolicy::UMOUNT`].
    pub fn umount(&self, target: &Path) -> Result<()> {
        let policy = RetryPolicy::UMOUNT;
        let mut attempt = 0;
        loop {
            match umount2(target, MntFlags::empty()) {
                Ok(()) => return Ok(()),
                Err(nix::Error::EBUSY) if attempt + 1 < policy.attempts => {
                    tracing::warn!(target = %target.display(), attempt, "umount busy, retrying");
                    attempt += 1;
                    thread::sleep(policy.interval);
                }
                Err(errno) => return Err(Error::Umount(format!("{}: {errno}", target.display()))),
            }
        }
    }

    /// Freezes the filesystem mounted at `target` via `FIFREEZE`,
    /// returning a guard that thaws it on drop.
    pub fn freeze<'a>(&'a self, target: &Path) -> Result<FreezeGuard<'a>> {
        let file = std::fs::File::open(target)?;
        // SAFETY: `file` stays open for the ioctl's duration.
        check_ioctl("FIFREEZE", unsafe { ioc_freeze(file.as_raw_fd()) })?;
        Ok(FreezeGuard { manager: self, target: target.to_path_buf(), active: true })
    }

    fn thaw(&self, target: &Path) -> Result<()> {
        let file = std::fs::File::open(target)?;
        // SAFETY: `file` stays open for the ioctl's duration.
        check_ioctl("FITHAW", unsafe { ioc_thaw(file.as_raw_fd()) })
    }
}

impl FreezeGuard<'_> {
    /// Thaws the filesystem now instead of waiting for drop, returning
    /// any error from the thaw call.
    pub fn thaw_now(mut self) -> Result<()> {
        self.active = false;
        self.manager.thaw(&self.target)
    }
}

fn check_ioctl(op: &'static str, result: nix::Result<i32>) -> Result<()> {
    result.map(|_| ()).map_err(|errno| Error::DeviceIoctl { op, source: std::io::Error::from(errno) })
}

fn do_mount(partition: &Path, target: &Path, fstype: &str, ro: bool, data: &str) -> Result<()> {
    let mut flags = MsFlags::empty();
    if ro {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(Some(partition), target, Some(fstype), flags, Some(data))
        .map_err(|errno| Error::Mount(format!("mount {} on {}: {errno}", partition.display(), target.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_device_appends_p1() {
        assert_eq!(MountManager::partition_device(Path::new("/dev/ploop0")), PathBuf::from("/dev/ploop0p1"));
    }

    #[test]
    fn fsck_skipped_for_non_ext_fstype() {
        let mgr = MountManager::new(Config::default());
        mgr.fsck_if_needed(Path::new("/dev/null"), "vfat", true).expect("skipped, not run");
    }

    #[test]
    fn extents_check_respects_escape_hatch() {
        let mut config = Config::default();
        config.skip_ext4_extents_check = true;
        let mgr = MountManager::new(config);
        mgr.check_extents(Path::new("/dev/does-not-exist"), "ext4").expect("escape hatch skips the check");
    }
}
