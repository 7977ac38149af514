//! Delete snapshot (§4.6.7).

use std::path::Path;

use super::Lifecycle;
use crate::descriptor::JsonCodec;
use crate::error::{Error, Result};

impl Lifecycle {
    /// Deletes the snapshot named `guid`. Refuses the active top and
    /// the base. A snapshot with no children is unlinked outright; one
    /// with exactly one child would be merged into it, which is an
    /// external-collaborator operation (§1) this crate does not
    /// reimplement; two or more children is unsupported.
    pub fn delete_snapshot(&self, dir: &Path, guid: &str) -> Result<()> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;

        if guid == descriptor.top_guid {
            return Err(Error::Param("cannot delete the active top".into()));
        }
        let snapshot = descriptor
            .find_snapshot_by_guid(guid)
            .ok_or_else(|| Error::DiskDescriptor(format!("snapshot {guid} not found")))?;
        if snapshot.parent_guid.is_none() {
            return Err(Error::Param("cannot delete the base snapshot".into()));
        }

        match descriptor.child_count(guid) {
            0 => {
                descriptor.remove_image(guid, true, dir)?;
                descriptor.store_atomic(&descriptor_path, &JsonCodec)?;
                Ok(())
            }
            1 => Err(Error::Param(
                "deleting a snapshot with one child requires merging it into that child, \
                 which this crate treats as an external-collaborator operation"
                    .into(),
            )),
            _ => Err(Error::Param("cannot delete a snapshot with more than one child".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delta::{DeltaMode, DeltaVersion};
    use crate::descriptor::{Descriptor, TOP_UUID};
    use crate::lifecycle::{CreateOptions, Lifecycle};

    fn setup_with_two_snapshots() -> (tempfile::TempDir, Lifecycle, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        let (snap_guid, _) = lifecycle.snapshot(dir.path(), None).expect("snapshot");
        (dir, lifecycle, snap_guid)
    }

    #[test]
    fn delete_leaf_snapshot_removes_it() {
        let (dir, lifecycle, snap_guid) = setup_with_two_snapshots();
        let (leaf_guid, _) = lifecycle.snapshot(dir.path(), None).expect("second snapshot");

        lifecycle.delete_snapshot(dir.path(), &leaf_guid).expect("delete");

        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert!(descriptor.find_image_by_guid(&leaf_guid).is_none());
        assert!(descriptor.find_image_by_guid(&snap_guid).is_some());
    }

    #[test]
    fn delete_rejects_active_top() {
        let (dir, lifecycle, _snap_guid) = setup_with_two_snapshots();
        assert!(lifecycle.delete_snapshot(dir.path(), TOP_UUID).is_err());
    }

    #[test]
    fn delete_rejects_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        let descriptor = lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        let base_guid = descriptor.snapshots.iter().find(|s| s.parent_guid.is_none()).unwrap().guid.clone();
        assert!(lifecycle.delete_snapshot(dir.path(), &base_guid).is_err());
    }

    #[test]
    fn delete_refuses_snapshot_with_one_child() {
        let (dir, lifecycle, snap_guid) = setup_with_two_snapshots();
        assert!(lifecycle.delete_snapshot(dir.path(), &snap_guid).is_err());
    }
}
