//! The ordered delta chain (C2): base…top, resolved top-down.

use std::path::{Path, PathBuf};

use crate::delta::{DeltaFile, DeltaMode, DeltaVersion, OpenFlags};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

/// An ordered sequence of delta file paths, base first and top last,
/// as built from a descriptor's snapshot tree.
#[derive(Debug, Clone)]
pub struct DeltaChain {
    /// Delta file paths, base-to-top order.
    pub paths: Vec<PathBuf>,
}

impl DeltaChain {
    /// Builds a chain by walking parent links from `target_guid` to the
    /// base and reversing, per §4.2.
    pub fn build(descriptor: &Descriptor, target_guid: &str) -> Result<Self> {
        let paths = descriptor.images_list(target_guid, false)?;
        Ok(Self { paths })
    }

    /// The topmost delta's path (the writable leaf unless mounted
    /// read-only).
    #[must_use]
    pub fn top(&self) -> Option<&Path> {
        self.paths.last().map(PathBuf::as_path)
    }

    /// Opens every delta in the chain. Every delta but the last opens
    /// read-only; the last opens read-write unless `force_readonly`.
    /// `direct` selects `O_DIRECT`; production start sequences set it,
    /// tests against a scratch filesystem typically do not.
    pub fn open_all(
        &self,
        base_dir: &Path,
        mode: DeltaMode,
        force_readonly: bool,
        direct: bool,
    ) -> Result<Vec<DeltaFile>> {
        let mut deltas = Vec::with_capacity(self.paths.len());
        for (i, path) in self.paths.iter().enumerate() {
            let writable = !force_readonly && i == self.paths.len() - 1;
            let flags = OpenFlags { writable, direct };
            deltas.push(DeltaFile::open(base_dir.join(path), mode, flags)?);
        }
        Ok(deltas)
    }
}

/// Checks that every delta in an already-opened chain shares a common
/// `blocksize` and that versions are not mixed. `Raw` deltas carry no
/// header and are skipped (their geometry is taken from the
/// descriptor instead).
pub fn check_deltas(deltas: &[DeltaFile]) -> Result<()> {
    let mut blocksize = None;
    let mut version: Option<DeltaVersion> = None;
    for delta in deltas {
        let Some(header) = delta.header() else { continue };
        match blocksize {
            None => blocksize = Some(header.blocksize),
            Some(b) if b != header.blocksize => {
                return Err(Error::Corrupt(format!(
                    "blocksize mismatch in delta chain: {b} vs {}",
                    header.blocksize
                )));
            }
            Some(_) => {}
        }
        match version {
            None => version = Some(header.version),
            Some(v) if v != header.version => {
                return Err(Error::Corrupt(format!(
                    "mixed {v:?}/{:?} deltas are not supported in one chain",
                    header.version
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaVersion;
    use crate::descriptor::TOP_UUID;

    fn sample_descriptor() -> Descriptor {
        let mut d = Descriptor {
            blocksize: 64,
            mode: DeltaMode::Expanded,
            version: DeltaVersion::V2,
            size: 4096,
            heads: 16,
            cylinders: 4,
            sectors_per_track: 63,
            images: Vec::new(),
            snapshots: Vec::new(),
            top_guid: String::new(),
        };
        d.add_image(PathBuf::from("base.hdd"), "base".into(), None);
        d.add_image(PathBuf::from("top.hdd"), TOP_UUID.into(), Some("base".into()));
        d.top_guid = TOP_UUID.into();
        d
    }

    #[test]
    fn build_walks_base_to_top() {
        let d = sample_descriptor();
        let chain = DeltaChain::build(&d, &d.top_guid).expect("build");
        assert_eq!(chain.paths, vec![PathBuf::from("base.hdd"), PathBuf::from("top.hdd")]);
        assert_eq!(chain.top(), Some(Path::new("top.hdd")));
    }

    #[test]
    fn open_all_creates_and_validates_a_real_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        DeltaFile::create_expanded(dir.path().join("base.hdd"), 2048, 64, DeltaVersion::V2)
            .expect("base")
            .close()
            .expect("close base");
        DeltaFile::create_expanded(dir.path().join("top.hdd"), 4096, 64, DeltaVersion::V2)
            .expect("top")
            .close()
            .expect("close top");

        let chain = DeltaChain { paths: vec![PathBuf::from("base.hdd"), PathBuf::from("top.hdd")] };
        let deltas = chain.open_all(dir.path(), DeltaMode::Expanded, true, false).expect("open_all");
        check_deltas(&deltas).expect("check_deltas");
    }
}
