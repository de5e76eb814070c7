//! Object operations issued by the image pipeline

use bytes::Bytes;
use rbdio_common::{Extent, SnapId, SnapshotDelta};

/// A single operation against one backend object
#[derive(Debug, Clone)]
pub enum ObjectOp {
    /// Read `length` bytes at `offset`, as of `snap_id`
    Read {
        oid: String,
        offset: u64,
        length: u64,
        snap_id: SnapId,
    },
    /// Write `data` at `offset`, extending the object as needed
    Write { oid: String, offset: u64, data: Bytes },
    /// Deallocate a range; a range reaching the object end truncates it
    Discard {
        oid: String,
        offset: u64,
        length: u64,
    },
    /// Write `data` only if the current content equals `cmp`
    CompareAndWrite {
        oid: String,
        offset: u64,
        cmp: Bytes,
        data: Bytes,
    },
    /// Report ranges that changed between consecutive snapshots
    ListSnaps {
        oid: String,
        extents: Vec<Extent>,
        snap_ids: Vec<SnapId>,
    },
}

impl ObjectOp {
    /// Target object name
    pub fn oid(&self) -> &str {
        match self {
            Self::Read { oid, .. }
            | Self::Write { oid, .. }
            | Self::Discard { oid, .. }
            | Self::CompareAndWrite { oid, .. }
            | Self::ListSnaps { oid, .. } => oid,
        }
    }

    /// Short operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Discard { .. } => "discard",
            Self::CompareAndWrite { .. } => "cmpext+write",
            Self::ListSnaps { .. } => "list_snaps",
        }
    }

    /// Check if the operation mutates the object
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Write { .. } | Self::Discard { .. } | Self::CompareAndWrite { .. }
        )
    }
}

/// Payload returned with an operation's status
#[derive(Debug, Clone, Default)]
pub struct OpReply {
    /// Data returned by reads (may be shorter than requested)
    pub data: Bytes,
    /// Object offset of the first mismatching byte of a failed compare
    pub mismatch_offset: Option<u64>,
    /// Changed ranges for list-snaps, in object offsets
    pub snapshot_delta: SnapshotDelta,
}

/// Completion of an object operation: status (0 or negated errno) and reply
pub type OpCompletion = Box<dyn FnOnce(i32, OpReply) + Send>;
