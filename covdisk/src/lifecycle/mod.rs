//! The life-cycle engine (C6): create, mount, grow, resize, snapshot,
//! switch, delete, and convert operations over an image set.
//!
//! Every public operation acquires [`DescriptorLock`], validates,
//! performs the work, and releases the lock; descriptor mutations go
//! through [`Descriptor::store_atomic`]. When a device handle is
//! supplied the operation drives it through [`DeviceController`];
//! otherwise it works on the delta files directly, per §4.6's
//! running/offline split.

mod convert;
mod create;
mod delete;
mod grow;
mod snapshot;
mod switch;

pub use create::CreateOptions;

use std::path::{Path, PathBuf};

use crate::chain::{DeltaChain, check_deltas};
use crate::config::Config;
use crate::descriptor::{Descriptor, JsonCodec};
use crate::device::{AddDeltaFlags, DeltaFormat, DeviceController, StartDelta, start_sequence};
use crate::error::{Error, Result};
use crate::lock::{CancelFlag, DescriptorLock};
use crate::mount::MountManager;

/// Canonical descriptor filename, per §6.3.
pub const DESCRIPTOR_NAME: &str = "DiskDescriptor.xml";
/// Canonical descriptor lock filename, sibling to the descriptor.
pub const LOCK_NAME: &str = "DiskDescriptor.lck";

/// Default CHS geometry recorded for images with no delta header to
/// read it from (a `Raw` base). Mirrors `delta`'s own defaults.
pub(crate) const DEFAULT_HEADS: u32 = 16;
pub(crate) const DEFAULT_SECTORS_PER_TRACK: u32 = 63;

/// The life-cycle engine. Holds the process configuration and a
/// cancellation flag shared by every long-running operation it drives.
pub struct Lifecycle {
    pub(crate) config: Config,
    pub(crate) cancel: CancelFlag,
}

impl Lifecycle {
    /// Creates an engine reading environment escape hatches from
    /// `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config, cancel: CancelFlag::new() }
    }

    /// The shared cancellation flag. Call [`CancelFlag::request`] on it
    /// from another thread to abort whatever long-running fill, merge,
    /// or conversion loop is currently in progress.
    #[must_use]
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Descriptor and lock paths for the image set rooted at `dir`.
    pub(crate) fn descriptor_paths(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join(DESCRIPTOR_NAME), dir.join(LOCK_NAME))
    }

    /// Acquires the descriptor lock and loads the descriptor at `dir`.
    pub(crate) fn lock_and_load(dir: &Path) -> Result<(DescriptorLock, Descriptor, PathBuf)> {
        let (descriptor_path, lock_path) = Self::descriptor_paths(dir);
        let lock = DescriptorLock::acquire(&lock_path)?;
        let descriptor = Descriptor::load(&descriptor_path, &JsonCodec)?;
        Ok((lock, descriptor, descriptor_path))
    }

    /// Mounts an image (§4.6.2). Resolves `target_guid` (or the
    /// descriptor's current `top_guid`), refuses a read-write mount of a
    /// snapshot with children, builds and validates the delta chain,
    /// starts the device, and — if `mount_to` is given — calls
    /// [`MountManager::mount_fs`]. Rolls the device back to stopped on
    /// any failure after `START`.
    pub fn mount_image(
        &self,
        dir: &Path,
        device: &mut dyn DeviceController,
        target_guid: Option<&str>,
        read_only: bool,
        mount_to: Option<(&Path, &str, &str)>,
    ) -> Result<()> {
        let (_lock, descriptor, _path) = Self::lock_and_load(dir)?;
        let guid = target_guid.unwrap_or(&descriptor.top_guid);

        if !read_only && guid != descriptor.top_guid && descriptor.child_count(guid) > 0 {
            return Err(Error::Param(format!("cannot mount {guid} read-write: it has children")));
        }

        let chain = DeltaChain::build(&descriptor, guid)?;
        let opened = chain.open_all(dir, descriptor.mode, read_only, true)?;
        check_deltas(&opened)?;
        drop(opened);

        let cluster_log = descriptor.blocksize.trailing_zeros();
        let start_deltas: Vec<StartDelta> = chain
            .paths
            .iter()
            .enumerate()
            .map(|(i, path)| StartDelta {
                path: dir.join(path),
                read_only: read_only || i != chain.paths.len() - 1,
                cluster_log,
                format: match descriptor.mode {
                    crate::delta::DeltaMode::Raw => DeltaFormat::Raw,
                    _ => DeltaFormat::Ploop1,
                },
            })
            .collect();

        let (_minor, _lock_fd) = start_sequence(device, &start_deltas)?;

        if let Some((target, fstype, mount_data)) = mount_to {
            let mgr = MountManager::new(self.config.clone());
            if let Err(err) = mgr.mount_fs(&MountManager::partition_device(target), target, fstype, read_only, mount_data) {
                let _ = device.stop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Pushes an empty delta via `ADD_DELTA` without starting the
    /// device; used by switch/snapshot when the device is already
    /// running and a fresh top level must be introduced.
    pub(crate) fn add_running_delta(
        device: &mut dyn DeviceController,
        path: &Path,
        cluster_log: u32,
    ) -> Result<()> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        use std::os::fd::AsRawFd;
        device.add_delta(file.as_raw_fd(), AddDeltaFlags { read_only: false }, cluster_log, DeltaFormat::Ploop1)?;
        std::mem::forget(file);
        Ok(())
    }
}
