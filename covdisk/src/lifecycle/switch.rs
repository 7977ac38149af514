//! Switch to snapshot (§4.6.6).

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::Lifecycle;
use crate::delta::{DeltaFile, DeltaMode};
use crate::descriptor::{JsonCodec, TOP_UUID};
use crate::device::DeviceController;
use crate::error::{Error, Result};

impl Lifecycle {
    /// Switches the writable leaf to `guid`, which must name an
    /// existing snapshot other than the current top. Unless
    /// `Config::skip_topdelta_destroy` is set, `device` (if any) must
    /// report stopped. Unless `Config::skip_topdelta_create` is set, a
    /// fresh empty delta becomes the new `TOP_UUID`, parented at `guid`;
    /// otherwise `guid` itself is promoted to `TOP_UUID` directly. The
    /// previous top delta file is unlinked only after the descriptor
    /// rename commits.
    pub fn switch_to_snapshot(&self, dir: &Path, device: Option<&mut dyn DeviceController>, guid: &str) -> Result<()> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;
        if guid == descriptor.top_guid {
            return Err(Error::Param("already at top_guid".into()));
        }
        if descriptor.find_snapshot_by_guid(guid).is_none() {
            return Err(Error::DiskDescriptor(format!("snapshot {guid} not found")));
        }

        if !self.config.skip_topdelta_destroy {
            if let Some(dev) = device {
                if dev.attributes()?.running {
                    return Err(Error::Param(
                        "switching snapshots requires the device stopped (or SKIP_TOPDELTA_DESTROY set)".into(),
                    ));
                }
            }
        }

        let old_top_file = descriptor
            .find_image_by_guid(TOP_UUID)
            .ok_or_else(|| Error::DiskDescriptor("no TOP_UUID image".into()))?
            .file
            .clone();
        descriptor.remove_image(TOP_UUID, false, dir)?;

        if self.config.skip_topdelta_create {
            descriptor.change_guid(guid, TOP_UUID)?;
        } else {
            let file_guid = Uuid::new_v4().to_string();
            let base_guid = descriptor
                .snapshots
                .iter()
                .find(|s| s.parent_guid.is_none())
                .ok_or_else(|| Error::DiskDescriptor("no root snapshot".into()))?
                .guid
                .clone();
            let base_stem = descriptor
                .find_image_by_guid(&base_guid)
                .ok_or_else(|| Error::DiskDescriptor("base image not found".into()))?
                .file
                .clone();
            let new_filename = PathBuf::from(format!("{}.{file_guid}", base_stem.display()));
            let new_path = dir.join(&new_filename);
            let create_result = match descriptor.mode {
                DeltaMode::Raw => DeltaFile::create_raw(&new_path, descriptor.size, &self.cancel).map(|d| d.close()),
                DeltaMode::Expanded => {
                    DeltaFile::create_expanded(&new_path, descriptor.size, descriptor.blocksize, descriptor.version)
                        .map(|d| d.close())
                }
                DeltaMode::Preallocated => DeltaFile::create_preallocated(
                    &new_path,
                    descriptor.size,
                    descriptor.blocksize,
                    descriptor.version,
                    &self.cancel,
                )
                .map(|d| d.close()),
            };
            if let Err(err) = create_result.and_then(|r| r) {
                let _ = std::fs::remove_file(&new_path);
                return Err(err);
            }
            descriptor.add_image(new_filename, TOP_UUID.to_string(), Some(guid.to_string()));
        }
        descriptor.top_guid = TOP_UUID.to_string();

        descriptor.store_atomic(&descriptor_path, &JsonCodec)?;
        std::fs::remove_file(dir.join(&old_top_file))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delta::DeltaVersion;
    use crate::descriptor::Descriptor;
    use crate::lifecycle::CreateOptions;

    #[test]
    fn switch_promotes_target_when_skip_topdelta_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let mut config = Config::default();
        config.skip_topdelta_create = true;
        let lifecycle = Lifecycle::new(config);
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        let (snap_guid, _) = lifecycle.snapshot(dir.path(), None).expect("snapshot");

        lifecycle.switch_to_snapshot(dir.path(), None, &snap_guid).expect("switch");

        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert_eq!(descriptor.images.len(), 1);
        assert_eq!(descriptor.find_image_by_guid(TOP_UUID).expect("top").guid, TOP_UUID);
    }

    #[test]
    fn switch_adds_fresh_leaf_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        let (snap_guid, _) = lifecycle.snapshot(dir.path(), None).expect("snapshot");

        lifecycle.switch_to_snapshot(dir.path(), None, &snap_guid).expect("switch");

        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert_eq!(descriptor.images.len(), 2);
        let top_snapshot = descriptor.find_snapshot_by_guid(TOP_UUID).expect("top");
        assert_eq!(top_snapshot.parent_guid.as_deref(), Some(snap_guid.as_str()));
    }

    #[test]
    fn switch_rejects_current_top() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        assert!(lifecycle.switch_to_snapshot(dir.path(), None, TOP_UUID).is_err());
    }
}
