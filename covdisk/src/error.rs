//! Error types for covdisk operations.

/// Alias for `Result<T, covdisk::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by covdisk operations.
///
/// Variants group by the kind of failure, not by the numeric exit-code
/// taxonomy a host-driver ABI might expose; callers that need the latter
/// can match on the variant and re-derive a code.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller supplied an out-of-range size, unknown version/mode, or a
    /// colliding identifier.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// A delta or descriptor violated an on-disk invariant.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// An I/O error from an open/read/write/fsync/rename/... syscall.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A pread/pwrite returned fewer bytes than requested.
    #[error("short {op} at offset {offset}: expected {expected} bytes, got {got}")]
    IoShort {
        /// `"read"` or `"write"`.
        op: &'static str,
        /// Byte offset the operation targeted.
        offset: u64,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually transferred.
        got: usize,
    },

    /// The host block device is missing or in an unexpected state.
    #[error("device error: {0}")]
    Device(String),

    /// A device control-surface call failed.
    #[error("device ioctl {op} failed: {source}")]
    DeviceIoctl {
        /// The opcode that was attempted.
        op: &'static str,
        /// The underlying errno.
        #[source]
        source: std::io::Error,
    },

    /// An operation that requires a running device found none mounted.
    #[error("device not mounted")]
    DevNotMounted,

    /// `mount(2)` (or the two-step mount sequence) failed.
    #[error("mount failed: {0}")]
    Mount(String),

    /// `umount(2)` failed after exhausting retries.
    #[error("umount failed: {0}")]
    Umount(String),

    /// An external filesystem-check invocation failed or reported damage.
    #[error("fsck failed: {0}")]
    Fsck(String),

    /// The live-copy wire stream violated its framing contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A loop failed to converge within its iteration bound.
    #[error("non-convergent loop: {0}")]
    Loop(String),

    /// The descriptor or delta advisory lock could not be acquired.
    #[error("lock error: {0}")]
    Lock(String),

    /// The descriptor document is missing, unparsable, or inconsistent.
    #[error("descriptor error: {0}")]
    DiskDescriptor(String),

    /// A sysfs/procfs read required to drive the host failed.
    #[error("sysfs error: {0}")]
    Sysfs(String),

    /// Any other environment failure (missing driver, unsupported host).
    #[error("system error: {0}")]
    Sys(String),

    /// A long-running loop observed the cooperative cancellation flag.
    #[error("operation cancelled: {0}")]
    Cancelled(&'static str),
}
