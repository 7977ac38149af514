//! A copy-on-write block-device image format, backed by ordinary files on
//! a host filesystem and presented to the kernel through a host driver.
//!
//! `covdisk` is the user-space half of that driver: it owns the on-disk
//! sparse delta layout ([`delta`]), the chain of deltas that forms a
//! snapshot tree ([`chain`], [`descriptor`]), the life-cycle operations
//! that create, resize, convert, snapshot, and tear images down
//! ([`lifecycle`]), the wrapper around the host driver's control surface
//! ([`device`]) and the mount sequence that exposes a device as a live
//! filesystem ([`mount`]), and the live-copy protocol that streams a
//! running image to a peer ([`livecopy`]).
//!
//! The control surface, mount sequence, and `O_DIRECT` I/O path are all
//! Linux-specific; this crate does not attempt to be portable beyond it.
//!
//! # Quick start — create and mount an image
//!
//! ```no_run
//! use covdisk::{CreateOptions, DeltaMode, DeltaVersion, Lifecycle};
//!
//! let lifecycle = Lifecycle::new(Default::default());
//! let descriptor = lifecycle
//!     .create("/images/disk.hdd", 1_048_576, 2048, DeltaMode::Expanded, DeltaVersion::V2, CreateOptions::default())
//!     .expect("failed to create image");
//! let _ = descriptor;
//! ```

mod chain;
mod config;
mod delta;
mod descriptor;
mod device;
mod error;
mod lifecycle;
mod livecopy;
mod lock;
mod mount;

pub use chain::{DeltaChain, check_deltas};
pub use config::{Config, RetryPolicy};
pub use delta::{DeltaFile, DeltaHeader, DeltaMode, DeltaVersion, OpenFlags};
pub use descriptor::{Descriptor, DescriptorCodec, ImageEntry, JsonCodec, SnapshotNode, TOP_UUID};
pub use device::{
    AddDeltaFlags, DeltaFormat, DeviceAttributes, DeviceController, Extent, FakeDevice, LinuxDevice, Opcode,
    StartDelta, retrying, start_sequence,
};
pub use error::{Error, Result};
pub use lifecycle::{CreateOptions, Lifecycle};
pub use livecopy::{FrameSink, LocalSink, Receiver, RemoteSink, Sender};
pub use lock::{CancelFlag, DescriptorLock};
pub use mount::MountManager;
