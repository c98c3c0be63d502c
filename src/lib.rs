//! A pure-userland volume manager, binary-compatible with the on-disk
//! layout used by Linux LVM2.
//!
//! The crate is layered bottom-up: [`config`] parses and emits the LVM2
//! textual metadata format, [`header`] and [`pv`] handle the binary label
//! and metadata-area structures on each physical volume, [`allocation`]
//! and [`segment`] model free space and the logical-to-physical extent
//! map, [`metadata`] is the pure volume-group engine, [`redo_log`]
//! journals metadata mutations into a dedicated LV, and [`vg`] /
//! [`volume`] tie everything to actual block devices.

use snafu::Snafu;

pub mod allocation;
pub mod block;
pub mod config;
pub mod header;
pub mod lv;
pub mod metadata;
pub mod pv;
pub mod redo_log;
pub mod segment;
pub mod uuid;
pub mod vg;
pub mod volume;

pub use allocation::{Allocation, ExtentInterval, PvName};
pub use block::{Block, BlockInfo, FileBlock, MemBlock};
pub use header::Magic;
pub use lv::{Lv, LvStatus, Tag};
pub use metadata::op::Op;
pub use metadata::{Metadata, VgStatus};
pub use uuid::Uuid;
pub use vg::{Clock, ConnectOpts, Mode, SystemClock, Vg};
pub use volume::Volume;

/// A sector is always 512 bytes on the wire, whatever the device reports.
pub const SECTOR_SIZE: u64 = 512;
/// Default extent size in sectors (4 MiB).
pub const DEFAULT_EXTENT_SIZE: u64 = 8192;
/// Byte offset of the metadata area on a freshly formatted PV.
pub const MDA_START: u64 = 4096;
/// Size of the metadata area reserved at format time.
pub const MDA_SIZE: u64 = 4 * 1024 * 1024;
/// Upper bound on a single metadata text.
pub const MAX_METADATA_SIZE: u64 = 1024 * 1024;
/// Name of the LV holding the redo log in journalled volume groups.
pub const REDO_LOG_LV: &str = "mirage_block_volume_redo_log";
/// On-disk size of the redo log LV.
pub const REDO_LOG_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },
    #[snafu(display("not an LVM PV"))]
    WrongMagic,
    #[snafu(display("parse error at {path}: {error}"))]
    Parse { path: String, error: String },
    #[snafu(display("unknown LV {name}"))]
    UnknownLv { name: String },
    #[snafu(display("duplicate LV {name}"))]
    DuplicateLv { name: String },
    #[snafu(display("only {available} extents free, {needed} needed"))]
    OnlyThisMuchFree { needed: u64, available: u64 },
    #[snafu(display("volume is disconnected"))]
    Disconnected,
    #[snafu(display("{msg}"))]
    Msg { msg: String },
}

impl Error {
    pub(crate) fn msg(msg: impl Into<String>) -> Self {
        Error::Msg { msg: msg.into() }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
