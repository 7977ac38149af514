//! Grow (§4.6.3) and resize (§4.6.4).

use std::path::Path;

use super::Lifecycle;
use crate::delta::{DeltaFile, DeltaMode, OpenFlags, max_sectors};
use crate::descriptor::JsonCodec;
use crate::device::DeviceController;
use crate::error::{Error, Result};

impl Lifecycle {
    /// Extends an image's virtual size to `new_size_sectors`, which must
    /// not shrink the image. Rounds up to the cluster size. If `device`
    /// is given, issues `GROW`; otherwise the top delta's L1/L2 index is
    /// extended in place, new slots starting as holes.
    pub fn grow(&self, dir: &Path, device: Option<&mut dyn DeviceController>, new_size_sectors: u64) -> Result<()> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;
        if new_size_sectors < descriptor.size {
            return Err(Error::Param("grow cannot shrink the image".into()));
        }
        let bs = u64::from(descriptor.blocksize);
        let rounded = new_size_sectors.div_ceil(bs) * bs;
        if rounded > max_sectors(descriptor.version, descriptor.blocksize) {
            return Err(Error::Param(format!(
                "{rounded} sectors exceeds the maximum addressable by {:?}",
                descriptor.version
            )));
        }

        match device {
            Some(dev) => dev.grow(rounded)?,
            None => grow_top_delta_in_place(dir, &descriptor, rounded)?,
        }

        descriptor.size = rounded;
        descriptor.store_atomic(&descriptor_path, &JsonCodec)?;
        Ok(())
    }

    /// Resizes the filesystem inside the image to fill (or to shrink
    /// ahead of) the current virtual size, then reclaims unused space.
    /// The online path (balloon resize, filesystem growth) and the
    /// offline path (`e2fsck`/`resize_fs`) are external-collaborator
    /// steps this crate does not reimplement; this method performs the
    /// reclaim step that follows them:
    /// - Expanded/Preallocated base: punches holes in `[fs_end_bytes,
    ///   dev_end_bytes)` by truncating and re-extending the top delta's
    ///   data region is not attempted generically here — callers drive
    ///   reclaim through the device's discard path when mounted.
    /// - Raw base: truncates the file to `fs_end_bytes` rounded up to a
    ///   cluster, plus `gpt_reserve_sectors`.
    pub fn resize(&self, dir: &Path, fs_end_sectors: u64, gpt_reserve_sectors: u64) -> Result<()> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;
        if descriptor.mode != DeltaMode::Raw {
            return Err(Error::Param(
                "offline reclaim past the filesystem end is only implemented for Raw bases; \
                 Expanded/Preallocated reclaim requires the mounted discard path"
                    .into(),
            ));
        }
        let base_guid = descriptor
            .snapshots
            .iter()
            .find(|s| s.parent_guid.is_none())
            .ok_or_else(|| Error::DiskDescriptor("no root snapshot".into()))?
            .guid
            .clone();
        let base = descriptor
            .find_image_by_guid(&base_guid)
            .ok_or_else(|| Error::Param("base image not found".into()))?
            .file
            .clone();

        let bs = u64::from(descriptor.blocksize);
        let new_end = fs_end_sectors.div_ceil(bs) * bs + gpt_reserve_sectors;
        let path = dir.join(&base);
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(new_end * crate::delta::SECTOR_SIZE)?;

        descriptor.size = new_end;
        descriptor.store_atomic(&descriptor_path, &JsonCodec)?;
        Ok(())
    }
}

fn grow_top_delta_in_place(dir: &Path, descriptor: &crate::descriptor::Descriptor, rounded: u64) -> Result<()> {
    let top_path = dir.join(
        &descriptor
            .find_image_by_guid(crate::descriptor::TOP_UUID)
            .ok_or_else(|| Error::DiskDescriptor("no TOP_UUID image".into()))?
            .file,
    );
    let mut delta = DeltaFile::open(&top_path, descriptor.mode, OpenFlags { writable: true, direct: false })?;
    // New L2 slots lazily allocate (Expanded) or were already fallocated
    // (Preallocated) clusters, so growing the virtual size recorded in
    // the header is sufficient as long as it still fits the existing L1
    // index; an L1-extending grow would relocate data clusters and is
    // not attempted here.
    if let Some(capacity) = delta.capacity_sectors() {
        if rounded > capacity {
            return Err(Error::Param(format!(
                "growing to {rounded} sectors would exceed this delta's L1 capacity of {capacity}; \
                 recreate the image with a larger initial blocksize instead"
            )));
        }
    }
    delta.set_header_size(rounded)?;
    delta.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delta::DeltaVersion;
    use crate::descriptor::Descriptor;
    use crate::device::FakeDevice;
    use crate::lifecycle::CreateOptions;

    #[test]
    fn grow_offline_extends_header_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");

        lifecycle.grow(dir.path(), None, 8000).expect("grow");

        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert_eq!(descriptor.size, 8000u64.div_ceil(64) * 64);
    }

    #[test]
    fn grow_rejects_shrink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        assert!(lifecycle.grow(dir.path(), None, 64).is_err());
    }

    #[test]
    fn grow_online_drives_device_controller() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");

        let mut device = FakeDevice::new(64, 4096);
        lifecycle.grow(dir.path(), Some(&mut device), 8192).expect("grow");
        assert_eq!(device.calls, vec![crate::device::Opcode::Grow]);
    }
}
