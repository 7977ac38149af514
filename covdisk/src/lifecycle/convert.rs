//! On-disk format conversion: mode (§4.6.8) and version (§4.6.9).
//!
//! Both kinds of conversion are implemented for the common case of a
//! single-image set (the state a freshly [`Lifecycle::create`]d image
//! is in, and the case most hosts actually convert): a multi-delta
//! chain's per-file conversion is a straightforward repetition of the
//! same per-file algorithm, but is not wired up generically here.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::Lifecycle;
use crate::delta::{DeltaFile, DeltaMode, DeltaVersion, OpenFlags, SECTOR_SIZE, max_sectors};
use crate::descriptor::JsonCodec;
use crate::device::DeviceController;
use crate::error::{Error, Result};

impl Lifecycle {
    /// Converts the image set's backing mode. Only `Expanded -> Raw`
    /// (flatten) and `Expanded -> Preallocated` (resolve every hole) are
    /// implemented; any other pair is rejected. Requires a single-image
    /// set.
    pub fn convert_mode(&self, dir: &Path, target_mode: DeltaMode) -> Result<()> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;
        if descriptor.mode == target_mode {
            return Ok(());
        }
        if descriptor.images.len() != 1 {
            return Err(Error::Param("mode conversion is only implemented for a single-image set".into()));
        }
        let image_path = descriptor.images[0].file.clone();
        let full_path = dir.join(&image_path);

        match (descriptor.mode, target_mode) {
            (DeltaMode::Expanded, DeltaMode::Raw) => flatten_to_raw(&full_path, descriptor.blocksize)?,
            (DeltaMode::Expanded, DeltaMode::Preallocated) => {
                let mut delta =
                    DeltaFile::open(&full_path, DeltaMode::Expanded, OpenFlags { writable: true, direct: false })?;
                delta.fill_holes(&self.cancel)?;
                delta.close()?;
            }
            _ => {
                return Err(Error::Param(format!(
                    "conversion from {:?} to {target_mode:?} is not supported",
                    descriptor.mode
                )));
            }
        }

        descriptor.mode = target_mode;
        descriptor.store_atomic(&descriptor_path, &JsonCodec)?;
        Ok(())
    }

    /// Converts every delta's on-disk index encoding between V1 and V2
    /// (§4.6.9). Refuses if the image set has more than one delta (see
    /// module docs), exceeds the target version's addressable range, or
    /// `device` (if any) reports running — both before the rewrite
    /// starts and again immediately before the descriptor commit, so a
    /// mount racing in between the two checks is still caught.
    pub fn convert_version(
        &self,
        dir: &Path,
        device: Option<&mut dyn DeviceController>,
        target_version: DeltaVersion,
    ) -> Result<()> {
        let (_lock, mut descriptor, descriptor_path) = Self::lock_and_load(dir)?;
        if descriptor.version == target_version {
            return Ok(());
        }
        if descriptor.images.len() != 1 {
            return Err(Error::Param("version conversion is only implemented for a single-image set".into()));
        }
        if descriptor.size > max_sectors(target_version, descriptor.blocksize) {
            return Err(Error::Param(format!(
                "image size {} exceeds {target_version:?}'s addressable range at blocksize {}",
                descriptor.size, descriptor.blocksize
            )));
        }
        if let Some(ref mut dev) = device {
            if dev.attributes()?.running {
                return Err(Error::Param("version conversion requires the device stopped".into()));
            }
        }

        let image_path = descriptor.images[0].file.clone();
        let full_path = dir.join(&image_path);
        convert_index_version(&full_path, descriptor.blocksize, target_version, &self.cancel)?;

        if let Some(dev) = device {
            if dev.attributes()?.running {
                return Err(Error::Param(
                    "device started mid-conversion; refusing to commit the version change".into(),
                ));
            }
        }

        descriptor.version = target_version;
        descriptor.store_atomic(&descriptor_path, &JsonCodec)?;
        Ok(())
    }
}

/// Streams every logical cluster of an EXPANDED delta at `src_path`
/// into a freshly written flat file, then renames it over the
/// original (§4.6.8, EXPANDED → RAW).
fn flatten_to_raw(src_path: &Path, blocksize: u32) -> Result<()> {
    let mut src = DeltaFile::open(src_path, DeltaMode::Expanded, OpenFlags { writable: false, direct: false })?;
    let size = src.header().ok_or_else(|| Error::Corrupt("expanded delta has no header".into()))?.size;
    let cluster_bytes = blocksize as usize * SECTOR_SIZE as usize;
    let l2_size = size / u64::from(blocksize);

    let tmp_path = tmp_path_for(src_path);
    let out = OpenOptions::new().read(true).write(true).create_new(true).open(&tmp_path)?;
    let mut buf = vec![0u8; cluster_bytes];
    for cluster in 0..l2_size {
        let off = cluster * cluster_bytes as u64;
        src.pread(off, &mut buf)?;
        out.write_at(&buf, off)?;
    }
    out.sync_all()?;
    drop(out);
    std::fs::rename(&tmp_path, src_path)?;
    Ok(())
}

/// Rewrites `path`'s L1/L2 index in place to `target_version`'s
/// encoding, following §4.6.9's dirty/converting-flag discipline. A
/// crash mid-conversion leaves `FLAG_CONVERTING` set and an `.idx`
/// backup of the pre-conversion L1 block beside the delta, from which a
/// recovery tool can restore the original encoding.
fn convert_index_version(
    path: &Path,
    _blocksize: u32,
    target_version: DeltaVersion,
    cancel: &crate::lock::CancelFlag,
) -> Result<()> {
    use crate::delta::FLAG_CONVERTING;

    let idx_path = tmp_path_with_suffix(path, "idx");

    let mut delta = DeltaFile::open(path, DeltaMode::Expanded, OpenFlags { writable: true, direct: false })?;
    let flags = delta.header().ok_or_else(|| Error::Corrupt("delta has no header".into()))?.flags;

    delta.backup_l1_index(&idx_path)?;
    delta.set_dirty(true)?;
    delta.set_header_flags(flags | FLAG_CONVERTING)?;

    delta.reencode_index_version(target_version, cancel)?;
    delta.set_header_version(target_version)?;

    delta.set_header_flags(flags & !FLAG_CONVERTING)?;
    delta.set_dirty(false)?;
    delta.close()?;

    std::fs::remove_file(&idx_path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    tmp_path_with_suffix(path, "tmp")
}

fn tmp_path_with_suffix(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(suffix);
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::descriptor::Descriptor;
    use crate::lifecycle::{CreateOptions, Lifecycle};

    #[test]
    fn convert_expanded_to_raw_preserves_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");

        {
            let mut delta =
                DeltaFile::open(&file, DeltaMode::Expanded, OpenFlags { writable: true, direct: false })
                    .expect("open");
            let cluster_bytes = 64 * SECTOR_SIZE as usize;
            delta.pwrite(0, &vec![0xAB; cluster_bytes]).expect("pwrite");
            delta.close().expect("close");
        }

        lifecycle.convert_mode(dir.path(), DeltaMode::Raw).expect("convert");

        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert_eq!(descriptor.mode, DeltaMode::Raw);
        let bytes = std::fs::read(&file).expect("read flattened file");
        assert_eq!(bytes.len(), 4096 * SECTOR_SIZE as usize);
        assert!(bytes[..64 * SECTOR_SIZE as usize].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn convert_version_round_trips_v2_to_v1_and_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");
        {
            let mut delta =
                DeltaFile::open(&file, DeltaMode::Expanded, OpenFlags { writable: true, direct: false })
                    .expect("open");
            let cluster_bytes = 64 * SECTOR_SIZE as usize;
            delta.pwrite(0, &vec![0x5A; cluster_bytes]).expect("pwrite");
            delta.close().expect("close");
        }

        lifecycle.convert_version(dir.path(), None, DeltaVersion::V1).expect("convert to v1");
        lifecycle.convert_version(dir.path(), None, DeltaVersion::V2).expect("convert back to v2");

        let mut delta = DeltaFile::open(&file, DeltaMode::Expanded, OpenFlags { writable: false, direct: false })
            .expect("reopen");
        let cluster_bytes = 64 * SECTOR_SIZE as usize;
        let mut buf = vec![0u8; cluster_bytes];
        delta.pread(0, &mut buf).expect("pread");
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn convert_version_refuses_running_device() {
        use crate::device::FakeDevice;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("disk.hdd");
        let lifecycle = Lifecycle::new(Config::default());
        lifecycle
            .create(&file, 4096, 64, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
            .expect("create");

        let mut device = FakeDevice::new(64, 4096);
        device.start().expect("start");

        assert!(lifecycle.convert_version(dir.path(), Some(&mut device), DeltaVersion::V1).is_err());
        let descriptor = Descriptor::load(&dir.path().join("DiskDescriptor.xml"), &JsonCodec).expect("load");
        assert_eq!(descriptor.version, DeltaVersion::V2);
    }
}
