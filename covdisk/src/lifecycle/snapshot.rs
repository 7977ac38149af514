//! Snapshot creation (§4.6.5).

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::Lifecycle;
use crate::delta::DeltaFile;
use crate::descriptor::{JsonCodec, TOP_UUID};
use crate::device::DeviceController;
use crate::error::{Error, Result};

/// A device stacks at most 128 levels; one is the base and one is held
/// in reserve, so user-visible snapshots are capped at 126 (§4.6.5
/// step 1).
const MAX_SNAPSHOTS: usize = 126;

impl Lifecycle {
    /// Creates a snapshot of the current top delta, returning the fresh
    /// `(snap_guid, file_guid)` pair. The existing top image is
    /// relabeled to `snap_guid`; a new empty delta becomes the
    /// `TOP_UUID` leaf, parented at `snap_guid`. If `device` is given,
    /// the new delta is pushed via `SNAPSHOT` (with the FS-sync flag)
    /// instead of being added offline.
    pub fn snapshot(&self, dir: &Path, device: Option<&mut dyn DeviceController>) -> Result<(String, String)> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;
        if descriptor.snapshots.len() > MAX_SNAPSHOTS {
            return Err(Error::Param(format!("snapshot count is already at the {MAX_SNAPSHOTS} limit")));
        }

        let snap_guid = Uuid::new_v4().to_string();
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
            crate::delta::DeltaMode::Raw => {
                DeltaFile::create_raw(&new_path, descriptor.size, &self.cancel).map(|d| d.close())
            }
            crate::delta::DeltaMode::Expanded => {
                DeltaFile::create_expanded(&new_path, descriptor.size, descriptor.blocksize, descriptor.version)
                    .map(|d| d.close())
            }
            crate::delta::DeltaMode::Preallocated => DeltaFile::create_preallocated(
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

        if let Some(dev) = device {
            let new_file = std::fs::OpenOptions::new().read(true).write(true).open(&new_path)?;
            use std::os::fd::AsRawFd;
            if let Err(err) = dev.snapshot(new_file.as_raw_fd(), true) {
                drop(new_file);
                let _ = std::fs::remove_file(&new_path);
                return Err(err);
            }
            std::mem::forget(new_file);
        }

        descriptor.change_guid(TOP_UUID, &snap_guid)?;
        descriptor.add_image(new_filename, TOP_UUID.to_string(), Some(snap_guid.clone()));
        descriptor.top_guid = TOP_UUID.to_string();

        if let Err(err) = descriptor.store_atomic(&descriptor_path, &JsonCodec) {
            let _ = std::fs::remove_file(&new_path);
            return Err(err);
        }

        Ok((snap_guid, file_guid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delta::{DeltaMode, DeltaVersion};
    use crate::descriptor::Descriptor;
    use crate::lifecycle::CreateOptions;

    #[test]
    fn snapshot_relabels_top_and_adds_fresh_leaf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");

        let (snap_guid, _file_guid) = lifecycle.snapshot(dir.path(), None).expect("snapshot");

        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert_eq!(descriptor.images.len(), 2);
        assert_eq!(descriptor.top_guid, TOP_UUID);
        assert!(descriptor.find_image_by_guid(&snap_guid).is_some());
        let top_snapshot = descriptor.find_snapshot_by_guid(TOP_UUID).expect("top snapshot");
        assert_eq!(top_snapshot.parent_guid.as_deref(), Some(snap_guid.as_str()));
    }

    #[test]
    fn snapshot_count_is_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 64, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        for _ in 0..MAX_SNAPSHOTS {
            lifecycle.snapshot(dir.path(), None).expect("snapshot");
        }
        assert!(lifecycle.snapshot(dir.path(), None).is_err());
    }
}
