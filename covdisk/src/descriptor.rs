//! The persistent snapshot tree and image inventory (C3).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel identifier marking the writable leaf image among `images`.
///
/// Exactly one [`ImageEntry`] carries this string as its `guid`; the
/// descriptor's `top_guid` field then names which *snapshot* is
/// currently mounted as that leaf.
pub const TOP_UUID: &str = "TOP_UUID";

/// An on-disk image file and the identifier that names it in the
/// snapshot tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Path to the delta file, relative to the descriptor's directory.
    pub file: PathBuf,
    /// Stable identifier for this image. Equal to [`TOP_UUID`] for
    /// exactly one entry: the currently writable top delta.
    pub guid: String,
}

/// A node in the snapshot tree: a named state referencing a fixed
/// delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    /// This node's identifier, shared with its [`ImageEntry::guid`].
    pub guid: String,
    /// Parent snapshot's identifier. `None` marks the base.
    pub parent_guid: Option<String>,
}

/// Persistent record of an image set: geometry, image inventory, and
/// snapshot tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// Cluster size, in sectors.
    pub blocksize: u32,
    /// Delta file backing mode shared by every image in the set.
    pub mode: crate::delta::DeltaMode,
    /// On-disk format version shared by every image in the set.
    pub version: crate::delta::DeltaVersion,
    /// Virtual disk size, in sectors.
    pub size: u64,
    /// CHS geometry: heads.
    pub heads: u32,
    /// CHS geometry: cylinders.
    pub cylinders: u32,
    /// CHS geometry: sectors per track.
    pub sectors_per_track: u32,
    /// Every image file in the set.
    pub images: Vec<ImageEntry>,
    /// Every snapshot node in the set.
    pub snapshots: Vec<SnapshotNode>,
    /// The snapshot currently mounted as the top delta.
    pub top_guid: String,
}

/// Encodes and decodes a [`Descriptor`] to and from its on-disk
/// representation.
///
/// The canonical format (an XML document, per the host tooling's
/// `DiskDescriptor.xml` convention) is an out-of-scope external
/// collaborator; this trait is the seam a real XML codec would plug
/// into. [`JsonCodec`] is the default, in-crate implementation.
pub trait DescriptorCodec {
    /// Serializes `descriptor` to bytes.
    fn encode(&self, descriptor: &Descriptor) -> Result<Vec<u8>>;
    /// Parses bytes previously produced by [`Self::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<Descriptor>;
}

/// The default [`DescriptorCodec`]: pretty-printed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl DescriptorCodec for JsonCodec {
    fn encode(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(descriptor)
            .map_err(|e| Error::DiskDescriptor(format!("encode: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Descriptor> {
        serde_json::from_slice(bytes).map_err(|e| Error::DiskDescriptor(format!("decode: {e}")))
    }
}

impl Descriptor {
    /// Loads and parses a descriptor from `path` using `codec`.
    pub fn load(path: &Path, codec: &dyn DescriptorCodec) -> Result<Self> {
        let bytes = fs::read(path).map_err(Error::Io)?;
        let descriptor = codec.decode(&bytes)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks the invariants of §3.3: image/snapshot counts match,
    /// exactly one root and one `TOP_UUID`, and no dangling references.
    pub fn validate(&self) -> Result<()> {
        if self.images.len() != self.snapshots.len() {
            return Err(Error::DiskDescriptor(format!(
                "images ({}) and snapshots ({}) counts differ",
                self.images.len(),
                self.snapshots.len()
            )));
        }
        let roots = self.snapshots.iter().filter(|s| s.parent_guid.is_none()).count();
        if roots != 1 {
            return Err(Error::DiskDescriptor(format!("expected exactly one root snapshot, found {roots}")));
        }
        let tops = self.images.iter().filter(|i| i.guid == TOP_UUID).count();
        if tops != 1 {
            return Err(Error::DiskDescriptor(format!("expected exactly one TOP_UUID image, found {tops}")));
        }
        for snap in &self.snapshots {
            if let Some(parent) = &snap.parent_guid {
                if self.find_snapshot_by_guid(parent).is_none() {
                    return Err(Error::DiskDescriptor(format!(
                        "snapshot {} references missing parent {parent}",
                        snap.guid
                    )));
                }
            }
        }
        let chain_len = self.images_list(&self.top_guid, false)?.len();
        if chain_len != self.images.len() {
            return Err(Error::DiskDescriptor(format!(
                "chain from top_guid has {chain_len} steps, expected {}",
                self.images.len()
            )));
        }
        Ok(())
    }

    /// Writes `self` to `path` using the write-tmp/fsync/rename
    /// discipline: a reader always observes either the pre- or
    /// post-image, never a partial write.
    pub fn store_atomic(&self, path: &Path, codec: &dyn DescriptorCodec) -> Result<()> {
        let bytes = codec.encode(self)?;
        let tmp_path = tmp_path_for(path);
        let write_result = (|| -> Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
            Ok(())
        })();
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, path).map_err(Error::Io)
    }

    /// Returns the image entry with the given `guid`, if any.
    #[must_use]
    pub fn find_image_by_guid(&self, guid: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|i| i.guid == guid)
    }

    /// Returns the snapshot node with the given `guid`, if any.
    #[must_use]
    pub fn find_snapshot_by_guid(&self, guid: &str) -> Option<&SnapshotNode> {
        self.snapshots.iter().find(|s| s.guid == guid)
    }

    /// Counts snapshots whose `parent_guid` is `guid`.
    #[must_use]
    pub fn child_count(&self, guid: &str) -> usize {
        self.snapshots.iter().filter(|s| s.parent_guid.as_deref() == Some(guid)).count()
    }

    /// Walks from `from_guid` to the base, returning image filenames.
    /// Base-to-top order unless `reversed`, in which case top-to-base
    /// (the walk's natural direction). Fails with `Error::DiskDescriptor`
    /// if the walk does not terminate at the root within `|images|`
    /// steps.
    pub fn images_list(&self, from_guid: &str, reversed: bool) -> Result<Vec<PathBuf>> {
        let mut guid = from_guid.to_string();
        let mut files = Vec::new();
        loop {
            let image = self
                .find_image_by_guid(&guid)
                .ok_or_else(|| Error::DiskDescriptor(format!("image {guid} not found")))?;
            let snap = self
                .find_snapshot_by_guid(&guid)
                .ok_or_else(|| Error::DiskDescriptor(format!("snapshot {guid} not found")))?;
            files.push(image.file.clone());
            if files.len() > self.images.len() {
                return Err(Error::DiskDescriptor("delta chain walk exceeded image count".into()));
            }
            match &snap.parent_guid {
                None => break,
                Some(parent) => guid = parent.clone(),
            }
        }
        if !reversed {
            files.reverse();
        }
        Ok(files)
    }

    /// Adds a fresh image/snapshot pair. The caller is responsible for
    /// persisting via [`Self::store_atomic`] afterward.
    pub fn add_image(&mut self, file: PathBuf, guid: String, parent_guid: Option<String>) {
        self.images.push(ImageEntry { file, guid: guid.clone() });
        self.snapshots.push(SnapshotNode { guid, parent_guid });
    }

    /// Removes an image/snapshot pair by `guid`. If `also_delete` is
    /// set, also unlinks the backing file; errors from the unlink are
    /// propagated after the in-memory removal has already happened, so
    /// callers should persist the descriptor first when that ordering
    /// matters.
    pub fn remove_image(&mut self, guid: &str, also_delete: bool, base_dir: &Path) -> Result<()> {
        let Some(pos) = self.images.iter().position(|i| i.guid == guid) else {
            return Err(Error::DiskDescriptor(format!("image {guid} not found")));
        };
        let removed = self.images.remove(pos);
        self.snapshots.retain(|s| s.guid != guid);
        if also_delete {
            fs::remove_file(base_dir.join(&removed.file)).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Renames an image/snapshot identifier throughout the descriptor,
    /// including any snapshot that names it as `parent_guid` and
    /// `top_guid` if it referenced `old`.
    pub fn change_guid(&mut self, old: &str, new: &str) -> Result<()> {
        if self.find_image_by_guid(old).is_none() {
            return Err(Error::DiskDescriptor(format!("image {old} not found")));
        }
        for image in &mut self.images {
            if image.guid == old {
                image.guid = new.to_string();
            }
        }
        for snap in &mut self.snapshots {
            if snap.guid == old {
                snap.guid = new.to_string();
            }
            if snap.parent_guid.as_deref() == Some(old) {
                snap.parent_guid = Some(new.to_string());
            }
        }
        if self.top_guid == old {
            self.top_guid = new.to_string();
        }
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaMode, DeltaVersion};

    fn sample() -> Descriptor {
        let mut d = Descriptor {
            blocksize: 2048,
            mode: DeltaMode::Expanded,
            version: DeltaVersion::V2,
            size: 1_048_576,
            heads: 16,
            cylinders: 1024,
            sectors_per_track: 63,
            images: Vec::new(),
            snapshots: Vec::new(),
            top_guid: String::new(),
        };
        d.add_image(PathBuf::from("disk.hdd"), "base".into(), None);
        d.add_image(PathBuf::from("disk.hdd.top"), TOP_UUID.into(), Some("base".into()));
        d.top_guid = TOP_UUID.into();
        d
    }

    #[test]
    fn sample_descriptor_validates() {
        sample().validate().expect("valid");
    }

    #[test]
    fn images_list_reaches_base_in_expected_steps() {
        let d = sample();
        let chain = d.images_list(&d.top_guid, false).expect("chain");
        assert_eq!(chain, vec![PathBuf::from("disk.hdd"), PathBuf::from("disk.hdd.top")]);
    }

    #[test]
    fn store_atomic_round_trips_through_json_codec() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("DiskDescriptor.xml");
        let d = sample();
        d.store_atomic(&path, &JsonCodec).expect("store");
        assert!(!tmp_path_for(&path).exists());
        let loaded = Descriptor::load(&path, &JsonCodec).expect("load");
        assert_eq!(loaded.top_guid, d.top_guid);
        assert_eq!(loaded.images.len(), 2);
    }

    #[test]
    fn change_guid_updates_every_reference() {
        let mut d = sample();
        d.change_guid("base", "base2").expect("rename");
        assert!(d.find_image_by_guid("base2").is_some());
        assert_eq!(d.snapshots.iter().find(|s| s.guid == TOP_UUID).unwrap().parent_guid.as_deref(), Some("base2"));
    }

    #[test]
    fn detects_missing_top_uuid() {
        let mut d = sample();
        for image in &mut d.images {
            image.guid = "base".into();
        }
        assert!(d.validate().is_err());
    }
}
