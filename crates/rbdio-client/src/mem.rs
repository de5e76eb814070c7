//! In-memory object store
//!
//! Implements [`ObjectBackend`] over a map of byte vectors. Snapshots capture
//! the head content of every object at creation time. Completions run inline
//! unless the store is paused, in which case they are held until [`MemStore::resume`].

use crate::backend::{BackendError, ObjectBackend};
use crate::op::{ObjectOp, OpCompletion, OpReply};
use bytes::Bytes;
use parking_lot::Mutex;
use rbdio_common::{Extent, NOSNAP, SnapId, SnapshotDelta, SnapshotExtent, SnapshotExtentState};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, trace};

/// Content history of a single object
#[derive(Default)]
struct ObjectHistory {
    /// Current content, `None` once removed
    head: Option<Vec<u8>>,
    /// Content captured at each snapshot taken while the object existed
    snaps: BTreeMap<SnapId, Option<Vec<u8>>>,
}

impl ObjectHistory {
    fn data_at(&self, snap_id: SnapId) -> Option<&[u8]> {
        if snap_id == NOSNAP {
            self.head.as_deref()
        } else {
            self.snaps.get(&snap_id).and_then(|d| d.as_deref())
        }
    }
}

struct HeldCompletion {
    on_finish: OpCompletion,
    r: i32,
    reply: OpReply,
}

#[derive(Default)]
struct MemState {
    objects: HashMap<String, ObjectHistory>,
    snaps: BTreeSet<SnapId>,
    paused: bool,
    held: VecDeque<HeldCompletion>,
    /// Errors returned by the next operations, in order
    injected: VecDeque<i32>,
    ops: u64,
    write_ops: u64,
}

/// In-memory [`ObjectBackend`]
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current content of every object under `snap_id`
    pub fn snap_create(&self, snap_id: SnapId) {
        let mut state = self.state.lock();
        for history in state.objects.values_mut() {
            let head = history.head.clone();
            history.snaps.insert(snap_id, head);
        }
        state.snaps.insert(snap_id);
        debug!("Created backend snapshot {}", snap_id);
    }

    /// Hold completions until [`MemStore::resume`]
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Deliver held completions in submission order and stop holding
    pub fn resume(&self) {
        let held = {
            let mut state = self.state.lock();
            state.paused = false;
            std::mem::take(&mut state.held)
        };
        for h in held {
            (h.on_finish)(h.r, h.reply);
        }
    }

    /// Number of completions currently held
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Fail the next operation with `errno` without applying it
    pub fn inject_error(&self, errno: i32) {
        self.state.lock().injected.push_back(-errno.abs());
    }

    /// Total operations received
    pub fn op_count(&self) -> u64 {
        self.state.lock().ops
    }

    /// Mutating operations received
    pub fn write_op_count(&self) -> u64 {
        self.state.lock().write_ops
    }

    /// Current head content of an object
    pub fn object_data(&self, oid: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(oid)
            .and_then(|h| h.head.clone())
    }

    /// Names of objects that currently exist
    pub fn object_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .objects
            .iter()
            .filter(|(_, h)| h.head.is_some())
            .map(|(oid, _)| oid.clone())
            .collect();
        names.sort();
        names
    }

    fn execute(state: &mut MemState, op: ObjectOp) -> Result<OpReply, (BackendError, OpReply)> {
        match op {
            ObjectOp::Read {
                oid,
                offset,
                length,
                snap_id,
            } => {
                if snap_id != NOSNAP && !state.snaps.contains(&snap_id) {
                    return Err((BackendError::ObjectNotFound(oid), OpReply::default()));
                }
                let data = state
                    .objects
                    .get(&oid)
                    .and_then(|h| h.data_at(snap_id))
                    .ok_or_else(|| {
                        (BackendError::ObjectNotFound(oid.clone()), OpReply::default())
                    })?;
                let start = (offset as usize).min(data.len());
                let end = (offset.saturating_add(length) as usize).min(data.len());
                Ok(OpReply {
                    data: Bytes::copy_from_slice(&data[start..end]),
                    ..OpReply::default()
                })
            }
            ObjectOp::Write { oid, offset, data } => {
                Self::write_head(state, &oid, offset, &data);
                Ok(OpReply::default())
            }
            ObjectOp::Discard {
                oid,
                offset,
                length,
            } => {
                let Some(head) = state.objects.get_mut(&oid).and_then(|h| h.head.as_mut())
                else {
                    return Ok(OpReply::default());
                };
                let len = head.len() as u64;
                if offset >= len {
                    // nothing allocated there
                } else if offset + length >= len {
                    if offset == 0 {
                        if let Some(history) = state.objects.get_mut(&oid) {
                            history.head = None;
                        }
                    } else {
                        head.truncate(offset as usize);
                    }
                } else {
                    head[offset as usize..(offset + length) as usize].fill(0);
                }
                Ok(OpReply::default())
            }
            ObjectOp::CompareAndWrite {
                oid,
                offset,
                cmp,
                data,
            } => {
                let current = state.objects.get(&oid).and_then(|h| h.head.as_deref());
                for (i, expected) in cmp.iter().enumerate() {
                    let actual = current
                        .and_then(|c| c.get(offset as usize + i))
                        .copied()
                        .unwrap_or(0);
                    if actual != *expected {
                        let mismatch = offset + i as u64;
                        return Err((
                            BackendError::Mismatch {
                                oid,
                                offset: mismatch,
                            },
                            OpReply {
                                mismatch_offset: Some(mismatch),
                                ..OpReply::default()
                            },
                        ));
                    }
                }
                Self::write_head(state, &oid, offset, &data);
                Ok(OpReply::default())
            }
            ObjectOp::ListSnaps {
                oid,
                extents,
                snap_ids,
            } => {
                if snap_ids.is_empty() {
                    return Err((
                        BackendError::InvalidOp("empty snapshot list".into()),
                        OpReply::default(),
                    ));
                }
                let history = state.objects.get(&oid);
                let mut delta = SnapshotDelta::new();
                let mut from: SnapId = 0;
                for &to in &snap_ids {
                    let old = if from == 0 {
                        None
                    } else {
                        history.and_then(|h| h.data_at(from))
                    };
                    let new = history.and_then(|h| h.data_at(to));
                    let changed = diff_extents(old, new, &extents);
                    if !changed.is_empty() {
                        delta.insert((from, to), changed);
                    }
                    from = to;
                }
                Ok(OpReply {
                    snapshot_delta: delta,
                    ..OpReply::default()
                })
            }
        }
    }

    fn write_head(state: &mut MemState, oid: &str, offset: u64, data: &[u8]) {
        let history = state.objects.entry(oid.to_string()).or_default();
        let head = history.head.get_or_insert_with(Vec::new);
        let end = offset as usize + data.len();
        if head.len() < end {
            head.resize(end, 0);
        }
        head[offset as usize..end].copy_from_slice(data);
    }
}

/// Ranges within `extents` whose content differs between two versions
fn diff_extents(old: Option<&[u8]>, new: Option<&[u8]>, extents: &[Extent]) -> Vec<SnapshotExtent> {
    let byte = |v: Option<&[u8]>, i: u64| v.and_then(|d| d.get(i as usize)).copied();
    let mut out: Vec<SnapshotExtent> = Vec::new();
    for extent in extents {
        for i in extent.offset..extent.end() {
            let (o, n) = (byte(old, i), byte(new, i));
            if o.unwrap_or(0) == n.unwrap_or(0) && o.is_some() == n.is_some() {
                continue;
            }
            let state = if n.is_some() {
                SnapshotExtentState::Data
            } else {
                SnapshotExtentState::Zeroed
            };
            match out.last_mut() {
                Some(last) if last.offset + last.length == i && last.state == state => {
                    last.length += 1;
                }
                _ => out.push(SnapshotExtent {
                    offset: i,
                    length: 1,
                    state,
                }),
            }
        }
    }
    out
}

impl ObjectBackend for MemStore {
    fn aio_operate(&self, op: ObjectOp, on_finish: OpCompletion) {
        let (r, reply) = {
            let mut state = self.state.lock();
            state.ops += 1;
            if op.is_write() {
                state.write_ops += 1;
            }
            trace!("{} {}", op.name(), op.oid());

            let (r, reply) = match state.injected.pop_front() {
                Some(r) => (r, OpReply::default()),
                None => match Self::execute(&mut state, op) {
                    Ok(reply) => (0, reply),
                    Err((e, reply)) => (e.errno(), reply),
                },
            };
            if state.paused {
                state.held.push_back(HeldCompletion {
                    on_finish,
                    r,
                    reply,
                });
                return;
            }
            (r, reply)
        };
        on_finish(r, reply);
    }
}
