//! The sparse delta image file (C1): header, L2 index, data clusters.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{FallocateFlags, fallocate};

use crate::error::{Error, Result};
use crate::lock::CancelFlag;

/// Bytes per sector, the format's smallest addressable unit.
pub const SECTOR_SIZE: u64 = 512;

/// Bytes occupied by the on-disk header (one sector).
const HEADER_SIZE: usize = 512;

/// Bytes per L2 slot (a 32-bit cluster offset/index).
const SLOT_SIZE: usize = 4;

/// 16-byte on-disk magic identifying a delta file.
const MAGIC: [u8; 16] = *b"covdisk-delta1\0\0";

/// Header flag: the delta was just created and carries no data yet.
pub const FLAG_EMPTY: u32 = 1 << 0;

/// Header flag: the delta is mid on-disk-version conversion; a sibling
/// `.idx` backup of its pre-conversion L2 table exists.
pub const FLAG_CONVERTING: u32 = 1 << 1;

/// Default cluster size (sectors) used when filling a RAW delta.
const DEFAULT_CLUSTER_SECTORS: u64 = 2048;

/// Default CHS geometry, matching the values most host drivers assume
/// when none is supplied.
const DEFAULT_HEADS: u32 = 16;
const DEFAULT_SECTORS_PER_TRACK: u32 = 63;

/// Number of L2 slots the header's one-sector reservation displaces.
/// spec.md names this reservation `MAP_OFFSET = 1`, meaning one
/// header-sized unit rather than one 4-byte word — see `DESIGN.md`'s
/// first Open Question.
pub const MAP_OFFSET: u32 = 1;

fn header_slots() -> u32 {
    (HEADER_SIZE / SLOT_SIZE) as u32 * MAP_OFFSET
}

/// On-disk format version, controlling how an L2 entry encodes a
/// cluster's physical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DeltaVersion {
    /// Entry = byte offset of the cluster, in sectors. Must be a
    /// multiple of `blocksize`; caps addressable size near 4 GiB.
    V1,
    /// Entry = cluster index (byte offset / cluster size). Lifts the
    /// V1 cap.
    V2,
}

/// Delta file backing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DeltaMode {
    /// No header; the file is a flat image.
    Raw,
    /// Grows as clusters are first written.
    Expanded,
    /// Fully allocated up front; every L2 entry already points at a
    /// reserved position.
    Preallocated,
}

/// Flags controlling how a delta file is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading and writing rather than read-only.
    pub writable: bool,
    /// Use `O_DIRECT`, bypassing the host page cache. Production
    /// call sites (the device controller's start sequence, the
    /// live-copy sender) set this; tests against a scratch directory
    /// typically leave it off, since many test filesystems reject
    /// `O_DIRECT`.
    pub direct: bool,
}

/// The on-disk header of an EXPANDED or PREALLOCATED delta.
#[derive(Debug, Clone, Copy)]
pub struct DeltaHeader {
    /// On-disk encoding version.
    pub version: DeltaVersion,
    /// Virtual disk size, in sectors.
    pub size: u64,
    /// CHS geometry: heads.
    pub heads: u32,
    /// CHS geometry: cylinders.
    pub cylinders: u32,
    /// CHS geometry: sectors per track.
    pub sectors_per_track: u32,
    /// Cluster size, in sectors. Must be a power of two.
    pub blocksize: u32,
    /// Sector at which data cluster 0 begins; equal to the L1 index's
    /// footprint in sectors.
    pub first_block_offset: u64,
    /// Header flags (`FLAG_EMPTY`, `FLAG_CONVERTING`, ...).
    pub flags: u32,
    /// Dirty bit: set while a writer holds the delta open.
    pub disk_in_use: bool,
}

impl DeltaHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(&MAGIC);
        buf[16..20].copy_from_slice(&u32::from(matches!(self.version, DeltaVersion::V2)).to_le_bytes());
        buf[20..28].copy_from_slice(&self.size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.heads.to_le_bytes());
        buf[32..36].copy_from_slice(&self.cylinders.to_le_bytes());
        buf[36..40].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        buf[40..44].copy_from_slice(&self.blocksize.to_le_bytes());
        buf[44..52].copy_from_slice(&self.first_block_offset.to_le_bytes());
        buf[52..56].copy_from_slice(&self.flags.to_le_bytes());
        buf[56..60].copy_from_slice(&u32::from(self.disk_in_use).to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE || buf[0..16] != MAGIC {
            return Err(Error::Corrupt("bad delta header magic".into()));
        }
        let version = if u32::from_le_bytes(buf[16..20].try_into().expect("slice len")) != 0 {
            DeltaVersion::V2
        } else {
            DeltaVersion::V1
        };
        Ok(Self {
            version,
            size: u64::from_le_bytes(buf[20..28].try_into().expect("slice len")),
            heads: u32::from_le_bytes(buf[28..32].try_into().expect("slice len")),
            cylinders: u32::from_le_bytes(buf[32..36].try_into().expect("slice len")),
            sectors_per_track: u32::from_le_bytes(buf[36..40].try_into().expect("slice len")),
            blocksize: u32::from_le_bytes(buf[40..44].try_into().expect("slice len")),
            first_block_offset: u64::from_le_bytes(buf[44..52].try_into().expect("slice len")),
            flags: u32::from_le_bytes(buf[52..56].try_into().expect("slice len")),
            disk_in_use: u32::from_le_bytes(buf[56..60].try_into().expect("slice len")) != 0,
        })
    }
}

/// The maximum virtual size, in sectors, addressable by `version` at the
/// given `blocksize`.
#[must_use]
pub fn max_sectors(version: DeltaVersion, blocksize: u32) -> u64 {
    match version {
        DeltaVersion::V1 => u64::from(u32::MAX),
        DeltaVersion::V2 => u64::from(u32::MAX) * u64::from(blocksize),
    }
}

/// Encodes a cluster's sector offset into an L2 slot for `version`.
fn encode_slot(version: DeltaVersion, sector_offset: u64, blocksize: u32) -> Result<u32> {
    match version {
        DeltaVersion::V1 => {
            if sector_offset % u64::from(blocksize) != 0 {
                return Err(Error::Corrupt(format!(
                    "V1 offset {sector_offset} is not a multiple of blocksize {blocksize}"
                )));
            }
            u32::try_from(sector_offset)
                .map_err(|_| Error::Param("offset exceeds V1's 32-bit addressable range".into()))
        }
        DeltaVersion::V2 => {
            let cluster_index = sector_offset / u64::from(blocksize);
            u32::try_from(cluster_index)
                .map_err(|_| Error::Param("offset exceeds V2's addressable range".into()))
        }
    }
}

/// Decodes an L2 slot into a cluster's sector offset. `0` is reserved by
/// the caller to mean "hole" and is never passed here.
fn decode_slot(version: DeltaVersion, entry: u32, blocksize: u32) -> Result<u64> {
    match version {
        DeltaVersion::V1 => {
            if u64::from(entry) % u64::from(blocksize) != 0 {
                return Err(Error::Corrupt(format!(
                    "V1 index entry {entry} is not blocksize-aligned"
                )));
            }
            Ok(u64::from(entry))
        }
        DeltaVersion::V2 => Ok(u64::from(entry) * u64::from(blocksize)),
    }
}

/// The single cached L1 (index) cluster: the most recently touched L2
/// cluster, held in memory until a different one is needed.
struct L2Cache {
    /// Index of the cached L1 cluster, or `None` if nothing is cached.
    cluster: Option<u32>,
    /// Whether the cached slots have been modified since they were last
    /// written back.
    dirty: bool,
    /// Flat 32-bit slots of the cached cluster.
    slots: Vec<u32>,
}

impl L2Cache {
    const fn empty() -> Self {
        Self { cluster: None, dirty: false, slots: Vec::new() }
    }
}

/// A single delta file: one sparse image, or a flat RAW image.
pub struct DeltaFile {
    file: File,
    path: PathBuf,
    mode: DeltaMode,
    header: Option<DeltaHeader>,
    writable: bool,
    l2_cache: L2Cache,
}

impl DeltaFile {
    fn cluster_bytes(&self) -> usize {
        let blocksize = self.header.as_ref().map_or(DEFAULT_CLUSTER_SECTORS as u32, |h| h.blocksize);
        blocksize as usize * SECTOR_SIZE as usize
    }

    /// Opens an existing delta file. For `Raw` deltas no header is read.
    /// For `Expanded`/`Preallocated` deltas the header sector is read
    /// and validated, and — if `flags.writable` — the `disk_in_use`
    /// dirty bit is set immediately (cleared again on [`Self::close`]).
    pub fn open(path: impl AsRef<Path>, mode: DeltaMode, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true).write(flags.writable);
        if flags.direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(&path)?;

        let header = if mode == DeltaMode::Raw {
            None
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let n = file.read_at(&mut buf, 0)?;
            if n != HEADER_SIZE {
                return Err(Error::IoShort { op: "read", offset: 0, expected: HEADER_SIZE, got: n });
            }
            let header = DeltaHeader::from_bytes(&buf)?;
            if header.disk_in_use {
                tracing::warn!(path = %path.display(), "delta has disk_in_use set at open");
            }
            Some(header)
        };

        let mut delta =
            Self { file, path, mode, header, writable: flags.writable, l2_cache: L2Cache::empty() };
        if flags.writable && delta.header.is_some() {
            delta.set_dirty(true)?;
        }
        Ok(delta)
    }

    /// Reads `buf.len()` bytes starting at virtual byte offset `off`.
    /// `off` must be cluster-aligned and `buf.len()` a multiple of a
    /// sector. Holes read as zeroes.
    pub fn pread(&mut self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.validate_io(off, buf.len())?;
        let cluster_bytes = self.cluster_bytes() as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let cur_off = off + done as u64;
            let virt_cluster = u32::try_from(cur_off / cluster_bytes)
                .map_err(|_| Error::Param("offset exceeds addressable range".into()))?;
            let chunk = (buf.len() - done).min(cluster_bytes as usize);
            match self.mode {
                DeltaMode::Raw => {
                    let n = self.file.read_at(&mut buf[done..done + chunk], cur_off)?;
                    if n != chunk {
                        return Err(Error::IoShort { op: "read", offset: cur_off, expected: chunk, got: n });
                    }
                }
                DeltaMode::Expanded | DeltaMode::Preallocated => {
                    match self.resolve_cluster(virt_cluster, false)? {
                        Some(base) => {
                            let n = self.file.read_at(&mut buf[done..done + chunk], base)?;
                            if n != chunk {
                                return Err(Error::IoShort {
                                    op: "read",
                                    offset: base,
                                    expected: chunk,
                                    got: n,
                                });
                            }
                        }
                        None => buf[done..done + chunk].fill(0),
                    }
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Writes `buf` starting at virtual byte offset `off`. Allocates a
    /// fresh data cluster on first write to a hole in `Expanded` mode;
    /// `Preallocated`/`Raw` clusters are already backed by real storage.
    pub fn pwrite(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        self.validate_io(off, buf.len())?;
        let cluster_bytes = self.cluster_bytes() as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let cur_off = off + done as u64;
            let virt_cluster = u32::try_from(cur_off / cluster_bytes)
                .map_err(|_| Error::Param("offset exceeds addressable range".into()))?;
            let chunk = (buf.len() - done).min(cluster_bytes as usize);
            let base = match self.mode {
                DeltaMode::Raw => cur_off,
                DeltaMode::Expanded | DeltaMode::Preallocated => self
                    .resolve_cluster(virt_cluster, true)?
                    .expect("resolve_cluster(_, true) always returns a location"),
            };
            let n = self.file.write_at(&buf[done..done + chunk], base)?;
            if n != chunk {
                return Err(Error::IoShort { op: "write", offset: base, expected: chunk, got: n });
            }
            done += chunk;
        }
        Ok(())
    }

    fn validate_io(&self, off: u64, len: usize) -> Result<()> {
        let cluster_bytes = self.cluster_bytes() as u64;
        if off % cluster_bytes != 0 {
            return Err(Error::Param(format!("offset {off} is not cluster-aligned")));
        }
        if u64::try_from(len).unwrap_or(u64::MAX) % SECTOR_SIZE != 0 {
            return Err(Error::Param(format!("length {len} is not a sector multiple")));
        }
        Ok(())
    }

    /// Resolves the physical byte offset backing virtual cluster
    /// `virt_cluster`. Returns `None` for a hole unless `allocate` is
    /// set, in which case a fresh cluster is appended to the file (valid
    /// only in `Expanded` mode).
    fn resolve_cluster(&mut self, virt_cluster: u32, allocate: bool) -> Result<Option<u64>> {
        let header = self.header.ok_or_else(|| Error::Param("delta has no L2 index".into()))?;
        let cluster_bytes = u64::from(header.blocksize) * SECTOR_SIZE;
        let slot_number = u64::from(header_slots()) + u64::from(virt_cluster);
        let byte_pos = slot_number * SLOT_SIZE as u64;
        let l1_cluster = u32::try_from(byte_pos / cluster_bytes)
            .map_err(|_| Error::Param("virtual cluster exceeds addressable range".into()))?;
        let slot_idx = usize::try_from((byte_pos % cluster_bytes) / SLOT_SIZE as u64).expect("fits usize");

        self.load_l2_cluster(l1_cluster)?;
        let entry = self.l2_cache.slots[slot_idx];

        if entry != 0 {
            let sector_off = decode_slot(header.version, entry, header.blocksize)?;
            return Ok(Some(sector_off * SECTOR_SIZE));
        }
        if !allocate {
            return Ok(None);
        }
        if self.mode != DeltaMode::Expanded {
            return Err(Error::Corrupt("non-expanded delta has an unresolved hole".into()));
        }

        let file_len = self.file.metadata()?.len();
        if file_len % cluster_bytes != 0 {
            return Err(Error::Corrupt("file length is not cluster-aligned".into()));
        }
        let new_sector_off = file_len / SECTOR_SIZE;
        let encoded = encode_slot(header.version, new_sector_off, header.blocksize)?;
        self.file.set_len(file_len + cluster_bytes)?;
        self.l2_cache.slots[slot_idx] = encoded;
        self.l2_cache.dirty = true;
        self.writeback_l2_cache()?;
        Ok(Some(file_len))
    }

    fn load_l2_cluster(&mut self, l1_cluster: u32) -> Result<()> {
        if self.l2_cache.cluster == Some(l1_cluster) {
            return Ok(());
        }
        self.writeback_l2_cache()?;
        let cluster_bytes = self.cluster_bytes();
        let mut raw = vec![0u8; cluster_bytes];
        let base = u64::from(l1_cluster) * cluster_bytes as u64;
        let n = self.file.read_at(&mut raw, base)?;
        if n != cluster_bytes {
            return Err(Error::IoShort { op: "read", offset: base, expected: cluster_bytes, got: n });
        }
        let slots = raw.chunks_exact(SLOT_SIZE).map(|c| u32::from_le_bytes(c.try_into().expect("4 bytes"))).collect();
        self.l2_cache = L2Cache { cluster: Some(l1_cluster), dirty: false, slots };
        Ok(())
    }

    /// Flushes the cached L1 cluster if dirty. Cluster 0 holds the
    /// header in its first `HEADER_SIZE` bytes, so writeback of that
    /// cluster skips that prefix to avoid clobbering it.
    fn writeback_l2_cache(&mut self) -> Result<()> {
        if !self.l2_cache.dirty {
            return Ok(());
        }
        let Some(l1_cluster) = self.l2_cache.cluster else { return Ok(()) };
        let cluster_bytes = self.cluster_bytes();
        let mut raw = Vec::with_capacity(cluster_bytes);
        for slot in &self.l2_cache.slots {
            raw.extend_from_slice(&slot.to_le_bytes());
        }
        let skip = if l1_cluster == 0 { HEADER_SIZE } else { 0 };
        let base = u64::from(l1_cluster) * cluster_bytes as u64 + skip as u64;
        let n = self.file.write_at(&raw[skip..], base)?;
        if n != raw.len() - skip {
            return Err(Error::IoShort { op: "write", offset: base, expected: raw.len() - skip, got: n });
        }
        self.l2_cache.dirty = false;
        Ok(())
    }

    /// Replaces the header's `flags` field and persists it immediately.
    pub fn set_header_flags(&mut self, flags: u32) -> Result<()> {
        let header = self.header.as_mut().ok_or_else(|| Error::Param("raw delta has no header".into()))?;
        header.flags = flags;
        self.write_header()
    }

    /// Replaces the header's virtual `size` field and persists it
    /// immediately. Does not extend the L1 index; callers growing a
    /// delta whose new L2 slots would not fit the current L1 footprint
    /// must recreate the delta instead (see the offline-grow note in
    /// the lifecycle engine).
    pub fn set_header_size(&mut self, size: u64) -> Result<()> {
        let header = self.header.as_mut().ok_or_else(|| Error::Param("raw delta has no header".into()))?;
        header.size = size;
        self.write_header()
    }

    /// Sets or clears the `disk_in_use` dirty bit and persists it
    /// immediately.
    pub fn set_dirty(&mut self, dirty: bool) -> Result<()> {
        let header = self.header.as_mut().ok_or_else(|| Error::Param("raw delta has no header".into()))?;
        header.disk_in_use = dirty;
        self.write_header()
    }

    /// Replaces the header's on-disk encoding `version` and persists it
    /// immediately. Does not touch a single L2 entry; callers must run
    /// [`Self::reencode_index_version`] first so existing entries stay
    /// readable under the new encoding.
    pub fn set_header_version(&mut self, version: DeltaVersion) -> Result<()> {
        let header = self.header.as_mut().ok_or_else(|| Error::Param("raw delta has no header".into()))?;
        header.version = version;
        self.write_header()
    }

    /// Copies the whole L1 index to `backup_path`, for the lifecycle
    /// engine's version-conversion recovery point (§4.6.9).
    pub fn backup_l1_index(&mut self, backup_path: &Path) -> Result<()> {
        let header = self.header.ok_or_else(|| Error::Param("delta has no L2 index".into()))?;
        let l1_bytes = header.first_block_offset * SECTOR_SIZE;
        let mut buf = vec![0u8; usize::try_from(l1_bytes).map_err(|_| Error::Param("index too large".into()))?];
        let n = self.file.read_at(&mut buf, 0)?;
        if n != buf.len() {
            return Err(Error::IoShort { op: "read", offset: 0, expected: buf.len(), got: n });
        }
        std::fs::write(backup_path, &buf)?;
        Ok(())
    }

    /// Rewrites every non-hole L2 entry from the delta's current
    /// version to `target`, cluster by cluster, checking `cancel` once
    /// per L1 cluster (§4.6.9). The header-sized prefix of L1 cluster 0
    /// is left untouched, matching [`Self::writeback_l2_cache`]'s
    /// reservation.
    pub fn reencode_index_version(&mut self, target: DeltaVersion, cancel: &CancelFlag) -> Result<()> {
        let header = self.header.ok_or_else(|| Error::Param("delta has no L2 index".into()))?;
        let source = header.version;
        if source == target {
            return Ok(());
        }
        let cluster_bytes = self.cluster_bytes();
        let slots_per_cluster = cluster_bytes / SLOT_SIZE;
        let l2_size = header.size / u64::from(header.blocksize);
        let total_slots = u64::from(header_slots()) + l2_size;
        let l1_clusters = total_slots.div_ceil(slots_per_cluster as u64);

        for l1_cluster in 0..l1_clusters {
            let l1_cluster = u32::try_from(l1_cluster).map_err(|_| Error::Param("image too large".into()))?;
            self.load_l2_cluster(l1_cluster)?;
            let start = if l1_cluster == 0 { header_slots() as usize } else { 0 };
            for slot in self.l2_cache.slots.iter_mut().skip(start) {
                if *slot != 0 {
                    let sector_off = decode_slot(source, *slot, header.blocksize)?;
                    *slot = encode_slot(target, sector_off, header.blocksize)?;
                }
            }
            self.l2_cache.dirty = true;
            self.writeback_l2_cache()?;
            cancel.check("version-convert")?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = *self.header.as_ref().expect("checked by caller");
        let bytes = header.to_bytes();
        let n = self.file.write_at(&bytes, 0)?;
        if n != bytes.len() {
            return Err(Error::IoShort { op: "write", offset: 0, expected: bytes.len(), got: n });
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Returns the parsed header, if this delta has one (`Raw` deltas
    /// do not).
    #[must_use]
    pub const fn header(&self) -> Option<&DeltaHeader> {
        self.header.as_ref()
    }

    /// Encodes the header sector with `disk_in_use` forced clear,
    /// without persisting the change: the live-copy sender's final
    /// resend of sector 0 should not hand the destination a dirty bit
    /// that only meant "a writer has this file open on the source".
    #[must_use]
    pub fn header_sector_clean(&self) -> Option<[u8; HEADER_SIZE]> {
        let mut header = self.header?;
        header.disk_in_use = false;
        Some(header.to_bytes())
    }

    /// The largest virtual size, in sectors, this delta can grow to
    /// without extending its L1 index (i.e. without relocating data
    /// clusters). `None` for a `Raw` delta, which has no index to bound
    /// it.
    #[must_use]
    pub fn capacity_sectors(&self) -> Option<u64> {
        let header = self.header.as_ref()?;
        let cluster_bytes = u64::from(header.blocksize) * SECTOR_SIZE;
        let l1_size = header.first_block_offset / u64::from(header.blocksize);
        let total_slots = l1_size * (cluster_bytes / SLOT_SIZE as u64);
        let max_l2_size = total_slots.saturating_sub(u64::from(header_slots()));
        Some(max_l2_size * u64::from(header.blocksize))
    }

    /// Returns the path this delta was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes any dirty L2 cache and clears the dirty bit on a clean
    /// close. A delta dropped without calling `close` leaves
    /// `disk_in_use` set, matching an unclean process exit.
    pub fn close(mut self) -> Result<()> {
        if self.writable {
            self.writeback_l2_cache()?;
            if self.header.is_some() {
                self.set_dirty(false)?;
            }
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Builds a fresh header for a new delta of `mode`/`version` sized
    /// for `virtual_sectors` at the given `blocksize`.
    fn new_header(mode: DeltaMode, version: DeltaVersion, virtual_sectors: u64, blocksize: u32) -> Result<(DeltaHeader, u32)> {
        if virtual_sectors > max_sectors(version, blocksize) {
            return Err(Error::Param(format!(
                "{virtual_sectors} sectors exceeds the maximum addressable by {version:?} at blocksize {blocksize}"
            )));
        }
        if virtual_sectors % u64::from(blocksize) != 0 {
            return Err(Error::Param("virtual size must be a blocksize multiple".into()));
        }
        let l2_size = virtual_sectors / u64::from(blocksize);
        let total_slots = u64::from(header_slots()) + l2_size;
        let cluster_bytes = u64::from(blocksize) * SECTOR_SIZE;
        let l1_size = total_slots.div_ceil(cluster_bytes / SLOT_SIZE as u64);
        let l1_size = u32::try_from(l1_size).map_err(|_| Error::Param("image too large".into()))?;
        let first_block_offset = u64::from(l1_size) * u64::from(blocksize);

        let cylinders = (virtual_sectors / u64::from(DEFAULT_HEADS * DEFAULT_SECTORS_PER_TRACK)).max(1);
        let cylinders = u32::try_from(cylinders).unwrap_or(u32::MAX);

        let flags = if mode == DeltaMode::Expanded { FLAG_EMPTY } else { 0 };
        Ok((
            DeltaHeader {
                version,
                size: virtual_sectors,
                heads: DEFAULT_HEADS,
                cylinders,
                sectors_per_track: DEFAULT_SECTORS_PER_TRACK,
                blocksize,
                first_block_offset,
                flags,
                disk_in_use: true,
            },
            l1_size,
        ))
    }

    /// Creates an EXPANDED delta: writes the header cluster plus enough
    /// zeroed clusters to cover the L1 index, then `fsync`s.
    pub fn create_expanded(
        path: impl AsRef<Path>,
        virtual_sectors: u64,
        blocksize: u32,
        version: DeltaVersion,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (header, l1_size) = Self::new_header(DeltaMode::Expanded, version, virtual_sectors, blocksize)?;
        let cluster_bytes = header.blocksize as usize * SECTOR_SIZE as usize;

        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;

        let mut cluster0 = vec![0u8; cluster_bytes];
        cluster0[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        file.write_at(&cluster0, 0)?;
        let zero_cluster = vec![0u8; cluster_bytes];
        for i in 1..l1_size {
            file.write_at(&zero_cluster, u64::from(i) * cluster_bytes as u64)?;
        }
        file.sync_all()?;

        Ok(Self { file, path, mode: DeltaMode::Expanded, header: Some(header), writable: true, l2_cache: L2Cache::empty() })
    }

    /// Creates a PREALLOCATED delta: `fallocate`s the full file, then
    /// fills every L2 entry to point at its reserved cluster, checking
    /// cancellation once per index cluster. Unlinks the file and
    /// returns `Error::Cancelled` if cancellation fires mid-fill.
    pub fn create_preallocated(
        path: impl AsRef<Path>,
        virtual_sectors: u64,
        blocksize: u32,
        version: DeltaVersion,
        cancel: &CancelFlag,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (header, _l1_size) =
            Self::new_header(DeltaMode::Preallocated, version, virtual_sectors, blocksize)?;
        let cluster_bytes = header.blocksize as u64 * SECTOR_SIZE;
        let file_bytes = (header.first_block_offset + virtual_sectors) * SECTOR_SIZE;

        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        if let Err(err) = fallocate(&file, FallocateFlags::empty(), 0, i64::try_from(file_bytes).unwrap_or(i64::MAX)) {
            if err != nix::Error::EOPNOTSUPP {
                let _ = std::fs::remove_file(&path);
                return Err(Error::Sys(format!("fallocate: {err}")));
            }
            file.set_len(file_bytes)?;
        }

        let l2_size = virtual_sectors / u64::from(blocksize);
        let mut delta = Self {
            file,
            path: path.clone(),
            mode: DeltaMode::Preallocated,
            header: Some(header),
            writable: true,
            l2_cache: L2Cache::empty(),
        };
        delta.write_header_cluster0(header)?;

        let slots_per_cluster = cluster_bytes as usize / SLOT_SIZE;
        let mut virt = 0u64;
        while virt < l2_size {
            let l1_cluster = u32::try_from((u64::from(header_slots()) + virt) / slots_per_cluster as u64)
                .map_err(|_| Error::Param("image too large".into()))?;
            delta.load_l2_cluster(l1_cluster)?;
            while virt < l2_size {
                let slot_number = u64::from(header_slots()) + virt;
                if slot_number / slots_per_cluster as u64 != u64::from(l1_cluster) {
                    break;
                }
                let slot_idx = usize::try_from(slot_number % slots_per_cluster as u64).expect("fits usize");
                let cluster_sector = header.first_block_offset + virt * u64::from(blocksize);
                delta.l2_cache.slots[slot_idx] = encode_slot(version, cluster_sector, blocksize)?;
                delta.l2_cache.dirty = true;
                virt += 1;
            }
            delta.writeback_l2_cache()?;
            if cancel.check("preallocated-fill").is_err() {
                drop(delta.file);
                let _ = std::fs::remove_file(&path);
                return Err(Error::Cancelled("preallocated-fill"));
            }
        }
        delta.file.sync_all()?;
        Ok(delta)
    }

    /// Resolves every hole cluster to a freshly appended, zero-filled
    /// data cluster (§4.6.8's EXPANDED→PREALLOCATED conversion: every L2
    /// entry ends up non-zero, which is exactly what distinguishes a
    /// PREALLOCATED delta from an EXPANDED one at the L2 level). Checks
    /// `cancel` once per cluster.
    pub fn fill_holes(&mut self, cancel: &CancelFlag) -> Result<()> {
        let header = self.header.ok_or_else(|| Error::Param("delta has no L2 index".into()))?;
        if self.mode != DeltaMode::Expanded {
            return Err(Error::Param("fill_holes only applies to an Expanded delta".into()));
        }
        let l2_size = header.size / u64::from(header.blocksize);
        for virt in 0..l2_size {
            let virt = u32::try_from(virt).map_err(|_| Error::Param("image too large".into()))?;
            self.resolve_cluster(virt, true)?;
            cancel.check("fill-holes")?;
        }
        Ok(())
    }

    fn write_header_cluster0(&mut self, header: DeltaHeader) -> Result<()> {
        self.file.write_at(&header.to_bytes(), 0)?;
        Ok(())
    }

    /// Creates a RAW delta: a flat zero-filled file of `virtual_sectors`
    /// sectors, written one default-sized cluster at a time.
    pub fn create_raw(path: impl AsRef<Path>, virtual_sectors: u64, cancel: &CancelFlag) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        let zero_cluster = vec![0u8; (DEFAULT_CLUSTER_SECTORS * SECTOR_SIZE) as usize];
        let total_bytes = virtual_sectors * SECTOR_SIZE;
        let mut written = 0u64;
        while written < total_bytes {
            let chunk = zero_cluster.len().min((total_bytes - written) as usize);
            file.write_at(&zero_cluster[..chunk], written)?;
            written += chunk as u64;
            if cancel.check("raw-fill").is_err() {
                drop(file);
                let _ = std::fs::remove_file(&path);
                return Err(Error::Cancelled("raw-fill"));
            }
        }
        file.sync_all()?;
        Ok(Self { file, path, mode: DeltaMode::Raw, header: None, writable: true, l2_cache: L2Cache::empty() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel_flag() -> CancelFlag {
        CancelFlag::new()
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let (header, _) = DeltaFile::new_header(DeltaMode::Expanded, DeltaVersion::V2, 4096, 64).expect("header");
        let bytes = header.to_bytes();
        let parsed = DeltaHeader::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.version, DeltaVersion::V2);
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.blocksize, 64);
    }

    #[test]
    fn v1_v2_slot_encoding_round_trips() {
        let blocksize = 64u32;
        let sector_off = 3 * u64::from(blocksize);
        let v1 = encode_slot(DeltaVersion::V1, sector_off, blocksize).expect("encode v1");
        assert_eq!(decode_slot(DeltaVersion::V1, v1, blocksize).expect("decode v1"), sector_off);
        let v2 = encode_slot(DeltaVersion::V2, sector_off, blocksize).expect("encode v2");
        assert_eq!(decode_slot(DeltaVersion::V2, v2, blocksize).expect("decode v2"), sector_off);
    }

    #[test]
    fn v1_rejects_unaligned_offset() {
        assert!(encode_slot(DeltaVersion::V1, 7, 64).is_err());
    }

    #[test]
    fn expanded_delta_reads_hole_as_zero_then_round_trips_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.hdd");
        let mut delta =
            DeltaFile::create_expanded(&path, 4096, 64, DeltaVersion::V2).expect("create expanded");

        let cluster_bytes = 64 * SECTOR_SIZE as usize;
        let mut buf = vec![0xFFu8; cluster_bytes];
        delta.pread(0, &mut buf).expect("pread hole");
        assert!(buf.iter().all(|&b| b == 0));

        let payload = vec![0xA5u8; cluster_bytes];
        delta.pwrite(0, &payload).expect("pwrite");
        let mut readback = vec![0u8; cluster_bytes];
        delta.pread(0, &mut readback).expect("pread");
        assert_eq!(readback, payload);

        delta.close().expect("close clears dirty bit");

        let mut reopened =
            DeltaFile::open(&path, DeltaMode::Expanded, OpenFlags { writable: false, direct: false })
                .expect("reopen");
        assert!(!reopened.header().expect("header").disk_in_use);
        let mut readback2 = vec![0u8; cluster_bytes];
        reopened.pread(0, &mut readback2).expect("pread after reopen");
        assert_eq!(readback2, payload);
    }

    #[test]
    fn preallocated_delta_has_every_slot_filled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.hdd");
        let cancel = cancel_flag();
        let mut delta = DeltaFile::create_preallocated(&path, 256, 64, DeltaVersion::V2, &cancel)
            .expect("create preallocated");
        let cluster_bytes = 64 * SECTOR_SIZE as usize;
        let mut buf = vec![0xFFu8; cluster_bytes];
        delta.pread(0, &mut buf).expect("pread preallocated cluster");
        assert!(buf.iter().all(|&b| b == 0), "preallocated clusters start zeroed, but are not holes");
    }

    #[test]
    fn fill_holes_resolves_every_cluster() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.hdd");
        let cancel = cancel_flag();
        let mut delta = DeltaFile::create_expanded(&path, 256, 64, DeltaVersion::V2).expect("create expanded");
        delta.fill_holes(&cancel).expect("fill_holes");
        let cluster_bytes = 64 * SECTOR_SIZE as usize;
        let mut buf = vec![0xFFu8; cluster_bytes];
        delta.pread(cluster_bytes as u64, &mut buf).expect("pread");
        assert!(buf.iter().all(|&b| b == 0), "filled holes must read back as zero");
    }

    #[test]
    fn create_raw_produces_exact_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.raw");
        let cancel = cancel_flag();
        let delta = DeltaFile::create_raw(&path, 2048, &cancel).expect("create raw");
        let metadata = std::fs::metadata(delta.path()).expect("metadata");
        assert_eq!(metadata.len(), 2048 * SECTOR_SIZE);
    }

    #[test]
    fn cancellation_unlinks_partial_raw_delta() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.raw");
        let cancel = cancel_flag();
        cancel.request();
        let result = DeltaFile::create_raw(&path, 1 << 20, &cancel);
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert!(!path.exists());
    }
}
