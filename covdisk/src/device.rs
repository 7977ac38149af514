//! The host block-device control surface (C4).
//!
//! The kernel driver's ioctl ABI is itself an out-of-scope external
//! collaborator (§1); only the *opcodes* are depended on. [`LinuxDevice`]
//! wraps them the way `bux`'s FFI layer wraps `libkrun`: one thin
//! `check`-style call per opcode, all `unsafe` confined to this module.
//! The request-code numbers below mirror the public OpenVZ `ploop`
//! kernel driver header (`PLOOPCTLTYPE = 'P'`); the request *structs*
//! are this crate's own, since the real kernel struct layouts are not
//! part of the specification this crate implements.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, RetryPolicy};
use crate::error::{Error, Result};

/// Semantic names for the host driver's control-surface opcodes (§6.2).
/// The ABI each maps to is host-defined; this enum exists for logging
/// and for `FakeDevice`'s call log in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Opcode {
    /// Reserve a fresh minor.
    AllocateMinor,
    /// Push a delta onto the active stack.
    AddDelta,
    /// Activate the stacked deltas as a block device.
    Start,
    /// Deactivate the block device.
    Stop,
    /// Forget the stacked deltas.
    Clear,
    /// Pop a delta at a specific level.
    DelDelta,
    /// Extend the virtual size.
    Grow,
    /// Flush dirty driver data to storage.
    Sync,
    /// Atomically push a fresh empty top delta over a running device.
    Snapshot,
    /// Start write-tracking.
    TrackInit,
    /// Advance the write-tracker's cursor.
    TrackSetPos,
    /// Read one dirtied extent since the cursor.
    TrackRead,
    /// Stop write-tracking cleanly.
    TrackStop,
    /// Abort write-tracking without draining.
    TrackAbort,
}

/// `ADD_DELTA`'s on-disk format argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaFormat {
    /// Flat image, no header.
    Raw,
    /// This crate's delta format (header + L1/L2 + clusters).
    Ploop1,
}

/// Flags accompanying `ADD_DELTA`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddDeltaFlags {
    /// Whether this delta is pushed read-only.
    pub read_only: bool,
}

/// Attributes readable from a running device (§3.4).
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttributes {
    /// Topmost stacked level index.
    pub top: u32,
    /// Cluster size, in sectors.
    pub block_size: u32,
    /// On-disk format version of the top delta.
    pub fmt_version: u32,
    /// Whether the device is active.
    pub running: bool,
    /// Current virtual size, in sectors.
    pub size: u64,
}

/// A dirtied byte extent reported by `TRACK_READ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Start offset, in bytes.
    pub start: u64,
    /// End offset (exclusive), in bytes.
    pub end: u64,
}

/// Wraps the host block-device control surface (§4.4, §6.2).
pub trait DeviceController {
    /// `ALLOCATE_MINOR`: returns a fresh minor and a lock file that must
    /// stay open until [`Self::start`].
    fn allocate_minor(&mut self) -> Result<(u32, File)>;

    /// `ADD_DELTA`: pushes a delta onto the active stack.
    fn add_delta(&mut self, delta_fd: RawFd, flags: AddDeltaFlags, cluster_log: u32, format: DeltaFormat) -> Result<()>;

    /// `START`: activates the stacked deltas as a block device.
    fn start(&mut self) -> Result<()>;

    /// `STOP`: deactivates the block device.
    fn stop(&mut self) -> Result<()>;

    /// `CLEAR`: forgets the stacked deltas.
    fn clear(&mut self) -> Result<()>;

    /// `DEL_DELTA`: pops the delta at `level`.
    fn del_delta(&mut self, level: u32) -> Result<()>;

    /// `GROW`: extends the virtual size, in sectors.
    fn grow(&mut self, new_size_sectors: u64) -> Result<()>;

    /// `SYNC`: flushes dirty driver data to storage.
    fn sync(&mut self) -> Result<()>;

    /// `SNAPSHOT`: atomically pushes a fresh empty top delta.
    fn snapshot(&mut self, new_delta_fd: RawFd, fs_sync: bool) -> Result<()>;

    /// `TRACK_INIT`: starts write-tracking, returning `(start, end)`.
    fn track_init(&mut self) -> Result<(u64, u64)>;

    /// `TRACK_SETPOS`: advances the tracker's cursor.
    fn track_setpos(&mut self, pos: u64) -> Result<()>;

    /// `TRACK_READ`: reads the next dirtied extent, or `None` if there
    /// is none pending (the host's *no data* / `EAGAIN` response).
    fn track_read(&mut self) -> Result<Option<Extent>>;

    /// `TRACK_STOP`: stops write-tracking cleanly.
    fn track_stop(&mut self) -> Result<()>;

    /// `TRACK_ABORT`: aborts write-tracking without draining.
    fn track_abort(&mut self) -> Result<()>;

    /// Reads the device's current attributes.
    fn attributes(&self) -> Result<DeviceAttributes>;
}

/// One entry in each delta to be pushed during [`start_sequence`].
pub struct StartDelta {
    /// Path to the delta file.
    pub path: PathBuf,
    /// Whether this delta should be opened read-only. The topmost
    /// unlocked delta opens read-write; every delta below it opens
    /// read-only.
    pub read_only: bool,
    /// Cluster size, in the log2-of-sectors form the control surface
    /// expects.
    pub cluster_log: u32,
    /// On-disk format.
    pub format: DeltaFormat,
}

/// Runs §4.4's cold-start sequence: reserve a minor, open every delta
/// `O_DIRECT`, push each with `ADD_DELTA`, then `START`. On any failure
/// the already-added deltas are popped in reverse and the stack is
/// cleared before the error propagates.
pub fn start_sequence(device: &mut dyn DeviceController, deltas: &[StartDelta]) -> Result<(u32, File)> {
    let (minor, lock_fd) = device.allocate_minor()?;
    let mut pushed = 0u32;

    let result = (|| -> Result<()> {
        for delta in deltas {
            let mut open_opts = OpenOptions::new();
            open_opts.read(true).write(!delta.read_only);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                open_opts.custom_flags(libc::O_DIRECT);
            }
            let file = open_opts.open(&delta.path)?;
            device.add_delta(
                file.as_raw_fd(),
                AddDeltaFlags { read_only: delta.read_only },
                delta.cluster_log,
                delta.format,
            )?;
            pushed += 1;
            // `file` is intentionally leaked from this function's view: the
            // driver now owns the fd's lifetime via ADD_DELTA. A real
            // deployment dup()s or otherwise keeps this alive per host ABI
            // convention; tracked here only to know how many levels to pop.
            std::mem::forget(file);
        }
        device.start()
    })();

    if let Err(err) = result {
        for level in (0..pushed).rev() {
            if let Err(pop_err) = device.del_delta(level) {
                tracing::warn!(level, error = %pop_err, "failed to pop delta during start-sequence rollback");
            }
        }
        if let Err(clear_err) = device.clear() {
            tracing::warn!(error = %clear_err, "failed to clear stack during start-sequence rollback");
        }
        return Err(err);
    }

    Ok((minor, lock_fd))
}

/// Retries `f` while it returns `Error::Device`-with-*busy* semantics,
/// per `policy`. Any other error propagates immediately.
pub fn retrying<T>(policy: RetryPolicy, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(Error::Device(msg)) if attempt + 1 < policy.attempts && msg.contains("busy") => {
                attempt += 1;
                std::thread::sleep(policy.interval);
            }
            Err(err) => return Err(err),
        }
    }
}

const PLOOPCTLTYPE: u8 = b'P';

#[repr(C)]
struct DeltaCtl {
    fd: i32,
    flags: u32,
    cluster_log: u32,
    format: u32,
}

#[repr(C)]
struct GrowCtl {
    new_size_sectors: u64,
}

#[repr(C)]
struct SnapshotCtl {
    fd: i32,
    fs_sync: u32,
}

#[repr(C)]
#[derive(Default)]
struct TrackExtentRaw {
    start: u64,
    end: u64,
    has_data: u32,
}

nix::ioctl_write_ptr!(ioc_add_delta, PLOOPCTLTYPE, 0, DeltaCtl);
nix::ioctl_write_int!(ioc_del_delta, PLOOPCTLTYPE, 1);
nix::ioctl_none!(ioc_start, PLOOPCTLTYPE, 2);
nix::ioctl_none!(ioc_stop, PLOOPCTLTYPE, 3);
nix::ioctl_none!(ioc_clear, PLOOPCTLTYPE, 5);
nix::ioctl_readwrite!(ioc_grow, PLOOPCTLTYPE, 7, GrowCtl);
nix::ioctl_write_ptr!(ioc_snapshot, PLOOPCTLTYPE, 10, SnapshotCtl);
nix::ioctl_none!(ioc_sync, PLOOPCTLTYPE, 14);
nix::ioctl_readwrite!(ioc_track_init, PLOOPCTLTYPE, 20, TrackExtentRaw);
nix::ioctl_write_ptr!(ioc_track_setpos, PLOOPCTLTYPE, 21, u64);
nix::ioctl_readwrite!(ioc_track_read, PLOOPCTLTYPE, 22, TrackExtentRaw);
nix::ioctl_none!(ioc_track_stop, PLOOPCTLTYPE, 23);
nix::ioctl_none!(ioc_track_abort, PLOOPCTLTYPE, 24);

fn check(op: &'static str, result: nix::Result<i32>) -> Result<()> {
    result.map(|_| ()).map_err(|errno| Error::DeviceIoctl { op, source: std::io::Error::from(errno) })
}

/// A real device, backed by an open `/dev/ploopN` control file
/// descriptor.
pub struct LinuxDevice {
    ctl: File,
    dev_path: PathBuf,
    minor_path: PathBuf,
}

impl LinuxDevice {
    /// Opens the control device for `minor` under `dev_dir` (normally
    /// `/dev`), reading the host's minor-allocation sequence point from
    /// `config.minor_path`.
    pub fn open(dev_dir: &Path, minor: u32, config: &Config) -> Result<Self> {
        let dev_path = dev_dir.join(format!("ploop{minor}"));
        let ctl = OpenOptions::new().read(true).write(true).open(&dev_path)?;
        Ok(Self { ctl, dev_path, minor_path: config.minor_path.clone() })
    }
}

impl DeviceController for LinuxDevice {
    fn allocate_minor(&mut self) -> Result<(u32, File)> {
        // The minor sequence point is a special file: opening and reading
        // it yields a fresh minor as decimal text, and the open fd itself
        // is the advisory lock that must stay held until `start`.
        let mut file = OpenOptions::new().read(true).open(&self.minor_path)?;
        let mut buf = [0u8; 64];
        let n = file.read(&mut buf)?;
        let text = std::str::from_utf8(&buf[..n])
            .map_err(|_| Error::Sysfs(format!("non-utf8 minor read from {}", self.minor_path.display())))?;
        let minor: u32 = text
            .trim()
            .parse()
            .map_err(|_| Error::Sysfs(format!("can't parse minor '{}' from {}", text.trim(), self.minor_path.display())))?;
        Ok((minor, file))
    }

    fn add_delta(&mut self, delta_fd: RawFd, flags: AddDeltaFlags, cluster_log: u32, format: DeltaFormat) -> Result<()> {
        let ctl = DeltaCtl {
            fd: delta_fd,
            flags: u32::from(flags.read_only),
            cluster_log,
            format: format as u32,
        };
        // SAFETY: `ctl` outlives the ioctl call and the control fd is open.
        check("ADD_DELTA", unsafe { ioc_add_delta(self.ctl.as_raw_fd(), &ctl) })
    }

    fn start(&mut self) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("START", unsafe { ioc_start(self.ctl.as_raw_fd()) })
    }

    fn stop(&mut self) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("STOP", unsafe { ioc_stop(self.ctl.as_raw_fd()) })
    }

    fn clear(&mut self) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("CLEAR", unsafe { ioc_clear(self.ctl.as_raw_fd()) })
    }

    fn del_delta(&mut self, level: u32) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("DEL_DELTA", unsafe { ioc_del_delta(self.ctl.as_raw_fd(), level as nix::sys::ioctl::ioctl_param_type) })
    }

    fn grow(&mut self, new_size_sectors: u64) -> Result<()> {
        let mut ctl = GrowCtl { new_size_sectors };
        // SAFETY: `ctl` outlives the ioctl call and the control fd is open.
        check("GROW", unsafe { ioc_grow(self.ctl.as_raw_fd(), &mut ctl) })
    }

    fn sync(&mut self) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("SYNC", unsafe { ioc_sync(self.ctl.as_raw_fd()) })
    }

    fn snapshot(&mut self, new_delta_fd: RawFd, fs_sync: bool) -> Result<()> {
        let ctl = SnapshotCtl { fd: new_delta_fd, fs_sync: u32::from(fs_sync) };
        // SAFETY: `ctl` outlives the ioctl call and the control fd is open.
        check("SNAPSHOT", unsafe { ioc_snapshot(self.ctl.as_raw_fd(), &ctl) })
    }

    fn track_init(&mut self) -> Result<(u64, u64)> {
        let mut raw = TrackExtentRaw::default();
        // SAFETY: `raw` outlives the ioctl call and the control fd is open.
        check("TRACK_INIT", unsafe { ioc_track_init(self.ctl.as_raw_fd(), &mut raw) })?;
        Ok((raw.start, raw.end))
    }

    fn track_setpos(&mut self, pos: u64) -> Result<()> {
        // SAFETY: `pos` outlives the ioctl call and the control fd is open.
        check("TRACK_SETPOS", unsafe { ioc_track_setpos(self.ctl.as_raw_fd(), &pos) })
    }

    fn track_read(&mut self) -> Result<Option<Extent>> {
        let mut raw = TrackExtentRaw::default();
        // SAFETY: `raw` outlives the ioctl call and the control fd is open.
        let rc = unsafe { ioc_track_read(self.ctl.as_raw_fd(), &mut raw) };
        match rc {
            Ok(_) if raw.has_data != 0 => Ok(Some(Extent { start: raw.start, end: raw.end })),
            Ok(_) => Ok(None),
            Err(nix::Error::EAGAIN) => Ok(None),
            Err(errno) => Err(Error::DeviceIoctl { op: "TRACK_READ", source: std::io::Error::from(errno) }),
        }
    }

    fn track_stop(&mut self) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("TRACK_STOP", unsafe { ioc_track_stop(self.ctl.as_raw_fd()) })
    }

    fn track_abort(&mut self) -> Result<()> {
        // SAFETY: the control fd is open for the lifetime of this call.
        check("TRACK_ABORT", unsafe { ioc_track_abort(self.ctl.as_raw_fd()) })
    }

    fn attributes(&self) -> Result<DeviceAttributes> {
        let name = self
            .dev_path
            .file_name()
            .ok_or_else(|| Error::Sysfs(format!("device path {} has no file name", self.dev_path.display())))?;
        let sys_dir = PathBuf::from("/sys/block").join(name);
        Ok(DeviceAttributes {
            top: read_sysfs_attr(&sys_dir, "top")?,
            block_size: read_sysfs_attr(&sys_dir, "block_size")?,
            fmt_version: read_sysfs_attr(&sys_dir, "fmt_version")?,
            running: read_sysfs_attr::<u32>(&sys_dir, "running")? != 0,
            size: read_sysfs_attr(&sys_dir, "size")?,
        })
    }
}

/// Reads and parses a single-integer sysfs attribute file, the same
/// `/sys/block/<dev>/<attr>` shape the host driver exposes `top`,
/// `block_size`, `fmt_version`, `running`, and `size` through.
fn read_sysfs_attr<T: std::str::FromStr>(dir: &Path, attr: &str) -> Result<T> {
    let path = dir.join(attr);
    let text = std::fs::read_to_string(&path).map_err(Error::Io)?;
    text.trim()
        .parse()
        .map_err(|_| Error::Sysfs(format!("can't parse attribute {} from {}: {text:?}", attr, path.display())))
}

/// An in-process fake implementing [`DeviceController`] for tests, per
/// SPEC_FULL §10.5: exercises lifecycle and live-copy logic without
/// `/dev` access or root.
#[derive(Debug, Default)]
pub struct FakeDevice {
    /// Opcodes invoked, in order, for assertions in tests.
    pub calls: Vec<Opcode>,
    stack: Vec<AddDeltaFlags>,
    running: bool,
    size_sectors: u64,
    block_size: u32,
    tracking: bool,
    track_pos: u64,
    track_end: u64,
    pending_extents: std::collections::VecDeque<Extent>,
    next_minor: u32,
}

impl FakeDevice {
    /// Creates a fake device reporting `block_size` and `size_sectors`.
    #[must_use]
    pub fn new(block_size: u32, size_sectors: u64) -> Self {
        Self { block_size, size_sectors, ..Self::default() }
    }

    /// Queues an extent for the next [`DeviceController::track_read`]
    /// calls to return, simulating a concurrent writer.
    pub fn queue_dirty_extent(&mut self, start: u64, end: u64) {
        self.pending_extents.push_back(Extent { start, end });
    }
}

impl DeviceController for FakeDevice {
    fn allocate_minor(&mut self) -> Result<(u32, File)> {
        self.calls.push(Opcode::AllocateMinor);
        self.next_minor += 1;
        // No real minor sequence point to hold a lock on; `/dev/null` gives
        // callers something to keep open without allocating scratch files.
        let lock_fd = File::open("/dev/null").map_err(Error::Io)?;
        Ok((self.next_minor, lock_fd))
    }

    fn add_delta(&mut self, _delta_fd: RawFd, flags: AddDeltaFlags, _cluster_log: u32, _format: DeltaFormat) -> Result<()> {
        self.calls.push(Opcode::AddDelta);
        self.stack.push(flags);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.calls.push(Opcode::Start);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.calls.push(Opcode::Stop);
        self.running = false;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.calls.push(Opcode::Clear);
        self.stack.clear();
        Ok(())
    }

    fn del_delta(&mut self, level: u32) -> Result<()> {
        self.calls.push(Opcode::DelDelta);
        if (level as usize) < self.stack.len() {
            self.stack.remove(level as usize);
        }
        Ok(())
    }

    fn grow(&mut self, new_size_sectors: u64) -> Result<()> {
        self.calls.push(Opcode::Grow);
        if new_size_sectors < self.size_sectors {
            return Err(Error::Param("GROW cannot shrink the device".into()));
        }
        self.size_sectors = new_size_sectors;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.calls.push(Opcode::Sync);
        Ok(())
    }

    fn snapshot(&mut self, _new_delta_fd: RawFd, _fs_sync: bool) -> Result<()> {
        self.calls.push(Opcode::Snapshot);
        self.stack.push(AddDeltaFlags { read_only: false });
        Ok(())
    }

    fn track_init(&mut self) -> Result<(u64, u64)> {
        self.calls.push(Opcode::TrackInit);
        self.tracking = true;
        self.track_pos = 0;
        self.track_end = self.size_sectors * 512;
        Ok((0, self.track_end))
    }

    fn track_setpos(&mut self, pos: u64) -> Result<()> {
        self.calls.push(Opcode::TrackSetPos);
        self.track_pos = pos;
        Ok(())
    }

    fn track_read(&mut self) -> Result<Option<Extent>> {
        self.calls.push(Opcode::TrackRead);
        Ok(self.pending_extents.pop_front())
    }

    fn track_stop(&mut self) -> Result<()> {
        self.calls.push(Opcode::TrackStop);
        self.tracking = false;
        Ok(())
    }

    fn track_abort(&mut self) -> Result<()> {
        self.calls.push(Opcode::TrackAbort);
        self.tracking = false;
        Ok(())
    }

    fn attributes(&self) -> Result<DeviceAttributes> {
        Ok(DeviceAttributes {
            top: self.stack.len().saturating_sub(1) as u32,
            block_size: self.block_size,
            fmt_version: 2,
            running: self.running,
            size: self.size_sectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_device_tracks_call_order() {
        let mut dev = FakeDevice::new(64, 4096);
        let (_minor, _lock) = dev.allocate_minor().expect("allocate_minor");
        dev.add_delta(0, AddDeltaFlags::default(), 6, DeltaFormat::Ploop1).expect("add_delta");
        dev.start().expect("start");
        assert_eq!(dev.calls, vec![Opcode::AllocateMinor, Opcode::AddDelta, Opcode::Start]);
        assert!(dev.attributes().expect("attributes").running);
    }

    #[test]
    fn grow_rejects_shrink() {
        let mut dev = FakeDevice::new(64, 4096);
        assert!(dev.grow(2048).is_err());
        assert!(dev.grow(8192).is_ok());
    }

    #[test]
    fn linux_device_allocate_minor_reads_configured_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let minor_path = dir.path().join("ploop_minor");
        std::fs::write(&minor_path, "7\n").expect("write scratch minor file");
        let ctl_path = dir.path().join("ploop7");
        std::fs::write(&ctl_path, []).expect("write scratch control file");

        let config = Config { minor_path, ..Config::default() };
        let ctl = OpenOptions::new().read(true).write(true).open(&ctl_path).expect("open scratch control file");
        let mut dev = LinuxDevice { ctl, dev_path: ctl_path, minor_path: config.minor_path.clone() };

        let (minor, _lock) = dev.allocate_minor().expect("allocate_minor");
        assert_eq!(minor, 7);
    }

    #[test]
    fn track_read_drains_queued_extents_then_returns_none() {
        let mut dev = FakeDevice::new(64, 4096);
        dev.track_init().expect("track_init");
        dev.queue_dirty_extent(0, 4096);
        assert_eq!(dev.track_read().expect("read"), Some(Extent { start: 0, end: 4096 }));
        assert_eq!(dev.track_read().expect("read"), None);
    }
}
