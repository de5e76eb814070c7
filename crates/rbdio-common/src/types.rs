//! Core value types shared across rbdio

use bitflags::bitflags;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Snapshot identifier
pub type SnapId = u64;

/// Snapshot id of the writable image head (not a snapshot)
pub const NOSNAP: SnapId = u64::MAX - 1;

/// A contiguous byte range of an image or object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Extent {
    /// Starting byte offset
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl Extent {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte of the extent
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl From<(u64, u64)> for Extent {
    fn from((offset, length): (u64, u64)) -> Self {
        Self { offset, length }
    }
}

/// Ordered list of extents as issued by the caller
pub type Extents = Vec<Extent>;

/// Sum of all extent lengths
pub fn total_length(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}

/// Addressable area of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageArea {
    /// User-visible data area
    #[default]
    Data,
    /// Encryption header area preceding the data area
    CryptoHeader,
}

bitflags! {
    /// Operation kinds, used for QoS exclusion masks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoOperations: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DISCARD = 1 << 2;
        const WRITE_SAME = 1 << 3;
        const COMPARE_AND_WRITE = 1 << 4;
    }
}

impl IoOperations {
    /// Parse operation names ("read", "write", "discard", "write_same",
    /// "compare_and_write")
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut ops = Self::empty();
        for name in names {
            ops |= match name.as_ref().trim() {
                "read" => Self::READ,
                "write" => Self::WRITE,
                "discard" => Self::DISCARD,
                "write_same" | "writesame" => Self::WRITE_SAME,
                "compare_and_write" | "compareandwrite" => Self::COMPARE_AND_WRITE,
                other => {
                    return Err(Error::invalid_argument(format!(
                        "unknown io operation: {other}"
                    )));
                }
            };
        }
        Ok(ops)
    }
}

bitflags! {
    /// QoS throttle selectors
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QosFlags: u64 {
        const IOPS = 1 << 0;
        const BPS = 1 << 1;
        const READ_IOPS = 1 << 2;
        const WRITE_IOPS = 1 << 3;
        const READ_BPS = 1 << 4;
        const WRITE_BPS = 1 << 5;
    }
}

impl QosFlags {
    /// Throttles that charge bytes instead of operations
    pub const BYTE_THROTTLES: Self = Self::BPS.union(Self::READ_BPS).union(Self::WRITE_BPS);

    /// Throttles that apply to reads
    pub const READ_THROTTLES: Self = Self::IOPS
        .union(Self::BPS)
        .union(Self::READ_IOPS)
        .union(Self::READ_BPS);

    /// Throttles that apply to writes
    pub const WRITE_THROTTLES: Self = Self::IOPS
        .union(Self::BPS)
        .union(Self::WRITE_IOPS)
        .union(Self::WRITE_BPS);
}

/// State of a changed range in a snapshot delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotExtentState {
    /// Range holds data in the later snapshot
    Data,
    /// Range reads back as zeros in the later snapshot
    Zeroed,
}

/// A changed range reported by a snapshot diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotExtent {
    pub offset: u64,
    pub length: u64,
    pub state: SnapshotExtentState,
}

/// Changed ranges keyed by (from snapshot, to snapshot)
pub type SnapshotDelta = BTreeMap<(SnapId, SnapId), Vec<SnapshotExtent>>;
