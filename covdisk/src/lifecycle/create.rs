//! Create (§4.6.1).

use std::path::Path;

use super::{DEFAULT_HEADS, DEFAULT_SECTORS_PER_TRACK, Lifecycle};
use crate::delta::{DeltaFile, DeltaMode, DeltaVersion, max_sectors};
use crate::descriptor::{Descriptor, JsonCodec, TOP_UUID};
use crate::error::{Error, Result};

/// Optional parameters for [`Lifecycle::create`] beyond the required
/// size/blocksize/mode/version.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// If set, format a filesystem of this type on the new image
    /// immediately after creation (§4.6.1's `fstype?` branch).
    /// Partitioning and `mkfs` are external collaborators, invoked as
    /// subprocesses; this crate does not implement them.
    pub fstype: Option<String>,
}

impl Lifecycle {
    /// Creates a fresh image set. `file` is the base delta's path; its
    /// sibling `DiskDescriptor.xml`/`.lck` are derived from its parent
    /// directory. Fails if `file` or the descriptor already exists.
    /// `virtual_sectors` is rounded up to a `blocksize` multiple, then
    /// truncated down if that would exceed `version`'s addressable
    /// maximum.
    pub fn create(
        &self,
        file: impl AsRef<Path>,
        virtual_sectors: u64,
        blocksize: u32,
        mode: DeltaMode,
        version: DeltaVersion,
        options: CreateOptions,
    ) -> Result<Descriptor> {
        let file = file.as_ref();
        let dir = file.parent().map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
        let (descriptor_path, lock_path) = Self::descriptor_paths(&dir);

        if file.exists() {
            return Err(Error::Param(format!("{} already exists", file.display())));
        }
        if descriptor_path.exists() {
            return Err(Error::Param(format!("{} already exists", descriptor_path.display())));
        }

        let _lock = crate::lock::DescriptorLock::acquire(&lock_path)?;

        let rounded = round_virtual_size(virtual_sectors, blocksize, version)?;

        let delta = match mode {
            DeltaMode::Raw => DeltaFile::create_raw(file, rounded, &self.cancel)?,
            DeltaMode::Expanded => DeltaFile::create_expanded(file, rounded, blocksize, version)?,
            DeltaMode::Preallocated => {
                DeltaFile::create_preallocated(file, rounded, blocksize, version, &self.cancel)?
            }
        };
        let (heads, cylinders, sectors_per_track) = delta.header().map_or(
            (DEFAULT_HEADS, (rounded / u64::from(DEFAULT_HEADS * DEFAULT_SECTORS_PER_TRACK)).max(1) as u32, DEFAULT_SECTORS_PER_TRACK),
            |h| (h.heads, h.cylinders, h.sectors_per_track),
        );
        delta.close()?;

        let filename = file.file_name().ok_or_else(|| Error::Param("file has no filename".into()))?;
        let mut descriptor = Descriptor {
            blocksize,
            mode,
            version,
            size: rounded,
            heads,
            cylinders,
            sectors_per_track,
            images: Vec::new(),
            snapshots: Vec::new(),
            top_guid: TOP_UUID.to_string(),
        };
        descriptor.add_image(filename.into(), TOP_UUID.to_string(), None);
        descriptor.validate()?;
        descriptor.store_atomic(&descriptor_path, &JsonCodec)?;

        if let Some(fstype) = options.fstype {
            tracing::info!(fstype, "fstype formatting on create is an external-collaborator step; skipping");
        }

        Ok(descriptor)
    }
}

fn round_virtual_size(virtual_sectors: u64, blocksize: u32, version: DeltaVersion) -> Result<u64> {
    if blocksize == 0 || !blocksize.is_power_of_two() {
        return Err(Error::Param("blocksize must be a nonzero power of two".into()));
    }
    let bs = u64::from(blocksize);
    let rounded = virtual_sectors.div_ceil(bs) * bs;
    let max = max_sectors(version, blocksize);
    let cap = (max / bs) * bs;
    Ok(rounded.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn create_rejects_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        std::fs::write(&file, b"x").expect("write");
        let lifecycle = Lifecycle::new(Config::default());
        let err = lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Param(_)));
    }

    #[test]
    fn create_rounds_size_and_persists_descriptor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        let descriptor = lifecycle
            .create(&file, 4000, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        assert_eq!(descriptor.size, 4032);
        assert!(dir.path().join("DiskDescriptor.xml").exists());
        assert_eq!(descriptor.images.len(), 1);
        assert_eq!(descriptor.top_guid, TOP_UUID);
    }

    #[test]
    fn round_virtual_size_truncates_at_version_cap() {
        let huge = u64::MAX / 2;
        let rounded = round_virtual_size(huge, 64, DeltaVersion::V1).expect("round");
        assert!(rounded <= max_sectors(DeltaVersion::V1, 64));
    }
}
