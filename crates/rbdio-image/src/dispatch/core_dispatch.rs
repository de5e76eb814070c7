//! Terminal stage: image requests to backend object operations
//!
//! Maps the request's area extents onto objects, registers the request in
//! the image's active-operation list and issues one backend operation per
//! object extent. The request completes once every object operation has
//! reported; the first error wins.

use super::{Dispatch, DispatchLayer, ImageDispatch, ImageDispatchSpec, Request};
use crate::aio_completion::AioCompletion;
use crate::completion::Context;
use crate::image_ctx::ImageCtx;
use crate::striper::ObjectExtent;

use bytes::{Bytes, BytesMut};
use rbdio_client::{ObjectOp, OpCompletion};
use rbdio_common::{Error, Result, SnapId, SnapshotDelta, SnapshotExtent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct CoreImageDispatch {
    ictx: Arc<ImageCtx>,
}

impl CoreImageDispatch {
    pub fn new(ictx: Arc<ImageCtx>) -> Arc<Self> {
        Arc::new(Self { ictx })
    }

    /// Object extents of the request and the snapshot it addresses
    fn map_extents(&self, spec: &ImageDispatchSpec) -> Result<(Vec<ObjectExtent>, SnapId)> {
        let state = self.ictx.image_lock.read();
        let base = state.area_base(spec.area());
        let extents = self
            .ictx
            .striper
            .extents_to_objects(base, &spec.image_extents)?;
        Ok((extents, state.snap_id))
    }

    fn issue(&self, op: ObjectOp, on_finish: OpCompletion) {
        trace!(op = op.name(), oid = op.oid(), "Issuing object operation");
        self.ictx.backend.aio_operate(op, on_finish);
    }

    /// Issue one write-class operation per object extent
    fn issue_writes(
        &self,
        aio_comp: &Arc<AioCompletion>,
        extents: Vec<ObjectExtent>,
        build: impl Fn(String, &ObjectExtent) -> ObjectOp,
    ) {
        aio_comp.set_request_count(extents.len());
        for extent in extents {
            let op = build(self.ictx.object_name(extent.object_no), &extent);
            let comp = aio_comp.clone();
            self.issue(
                op,
                Box::new(move |r, _| comp.complete_request(i64::from(r.min(0)))),
            );
        }
    }
}

impl ImageDispatch for CoreImageDispatch {
    fn layer(&self) -> DispatchLayer {
        DispatchLayer::Core
    }

    fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let (extents, snap_id) = match self.map_extents(&spec) {
            Ok(mapped) => mapped,
            Err(e) => return fail_unmapped(spec, &e),
        };
        let aio_comp = spec.aio_comp.clone();
        aio_comp.start_op();
        aio_comp.init_read_buffer(spec.total_length() as usize);
        aio_comp.set_request_count(extents.len());
        for extent in extents {
            let comp = aio_comp.clone();
            let length = extent.length;
            let buffer_offset = extent.buffer_offset as usize;
            self.issue(
                ObjectOp::Read {
                    oid: self.ictx.object_name(extent.object_no),
                    offset: extent.offset,
                    length,
                    snap_id,
                },
                Box::new(move |r, reply| {
                    if r >= 0 {
                        comp.copy_read_data(buffer_offset, &reply.data);
                        comp.complete_request(length as i64);
                    } else if r == -libc::ENOENT {
                        // never written: reads back as zeros
                        comp.complete_request(length as i64);
                    } else {
                        comp.complete_request(i64::from(r));
                    }
                }),
            );
        }
        Dispatch::Handled
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let (extents, _) = match self.map_extents(&spec) {
            Ok(mapped) => mapped,
            Err(e) => return fail_unmapped(spec, &e),
        };
        let Request::Write { data } = &spec.request else {
            return Dispatch::Continue(spec);
        };
        spec.aio_comp.start_op();
        self.issue_writes(&spec.aio_comp, extents, |oid, extent| {
            let start = extent.buffer_offset as usize;
            ObjectOp::Write {
                oid,
                offset: extent.offset,
                data: data.slice(start..start + extent.length as usize),
            }
        });
        Dispatch::Handled
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let Request::Discard {
            discard_granularity,
        } = spec.request
        else {
            return Dispatch::Continue(spec);
        };
        let (extents, _) = match self.map_extents(&spec) {
            Ok(mapped) => mapped,
            Err(e) => return fail_unmapped(spec, &e),
        };
        spec.aio_comp.start_op();
        let extents = prune_discard_extents(extents, u64::from(discard_granularity));
        if extents.is_empty() {
            debug!(tid = spec.tid, "Discard smaller than granularity");
        }
        self.issue_writes(&spec.aio_comp, extents, |oid, extent| ObjectOp::Discard {
            oid,
            offset: extent.offset,
            length: extent.length,
        });
        Dispatch::Handled
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let (extents, _) = match self.map_extents(&spec) {
            Ok(mapped) => mapped,
            Err(e) => return fail_unmapped(spec, &e),
        };
        let Request::WriteSame { data } = &spec.request else {
            return Dispatch::Continue(spec);
        };
        spec.aio_comp.start_op();
        self.issue_writes(&spec.aio_comp, extents, |oid, extent| ObjectOp::Write {
            oid,
            offset: extent.offset,
            data: expand_pattern(data, extent.buffer_offset, extent.length),
        });
        Dispatch::Handled
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let (extents, _) = match self.map_extents(&spec) {
            Ok(mapped) => mapped,
            Err(e) => return fail_unmapped(spec, &e),
        };
        let Request::CompareAndWrite { cmp_data, data } = &spec.request else {
            return Dispatch::Continue(spec);
        };
        let [extent] = extents.as_slice() else {
            debug!(
                tid = spec.tid,
                objects = extents.len(),
                "Compare-and-write spans objects"
            );
            spec.fail(-libc::EINVAL);
            return Dispatch::Handled;
        };

        let aio_comp = spec.aio_comp.clone();
        aio_comp.start_op();
        aio_comp.set_request_count(1);
        let object_offset = extent.offset;
        let image_offset = extent.image_offset;
        self.issue(
            ObjectOp::CompareAndWrite {
                oid: self.ictx.object_name(extent.object_no),
                offset: extent.offset,
                cmp: cmp_data.clone(),
                data: data.clone(),
            },
            Box::new(move |r, reply| {
                if r == -libc::EILSEQ
                    && let Some(mismatch) = reply.mismatch_offset
                {
                    aio_comp.set_mismatch_offset(image_offset + (mismatch - object_offset));
                }
                aio_comp.complete_request(i64::from(r.min(0)));
            }),
        );
        Dispatch::Handled
    }

    fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let aio_comp = spec.aio_comp.clone();
        aio_comp.start_op();
        aio_comp.set_request_count(1);
        let comp = aio_comp.clone();
        aio_comp.flush_async_op(Context::new(move |r| comp.complete_request(i64::from(r))));
        Dispatch::Handled
    }

    fn list_snaps(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let Request::ListSnaps { snap_ids } = &spec.request else {
            return Dispatch::Continue(spec);
        };
        if snap_ids.is_empty() {
            spec.fail(-libc::EINVAL);
            return Dispatch::Handled;
        }

        let (extents, _) = match self.map_extents(&spec) {
            Ok(mapped) => mapped,
            Err(e) => return fail_unmapped(spec, &e),
        };
        let aio_comp = spec.aio_comp.clone();
        aio_comp.start_op();
        let mut per_object: BTreeMap<u64, Vec<ObjectExtent>> = BTreeMap::new();
        for extent in extents {
            per_object.entry(extent.object_no).or_default().push(extent);
        }

        aio_comp.set_request_count(per_object.len());
        for (object_no, extents) in per_object {
            let comp = aio_comp.clone();
            self.issue(
                ObjectOp::ListSnaps {
                    oid: self.ictx.object_name(object_no),
                    extents: extents
                        .iter()
                        .map(|e| rbdio_common::Extent::new(e.offset, e.length))
                        .collect(),
                    snap_ids: snap_ids.clone(),
                },
                Box::new(move |r, reply| {
                    if r >= 0 || r == -libc::ENOENT {
                        comp.merge_snapshot_delta(to_image_delta(reply.snapshot_delta, &extents));
                        comp.complete_request(0);
                    } else {
                        comp.complete_request(i64::from(r));
                    }
                }),
            );
        }
        Dispatch::Handled
    }
}

/// Shrink object extents to whole multiples of the discard granularity,
/// dropping those that hold none
/// Complete a request whose extents cannot be mapped onto objects
fn fail_unmapped(spec: Box<ImageDispatchSpec>, e: &Error) -> Dispatch {
    debug!(tid = spec.tid, op = spec.request.name(), error = %e, "Request not mappable");
    spec.fail(e.errno());
    Dispatch::Handled
}
fn prune_discard_extents(extents: Vec<ObjectExtent>, granularity: u64) -> Vec<ObjectExtent> {
    if granularity <= 1 {
        return extents;
    }
    extents
        .into_iter()
        .filter_map(|mut extent| {
            let start = extent.offset.next_multiple_of(granularity);
            let end = (extent.offset + extent.length) / granularity * granularity;
            if start >= end {
                return None;
            }
            let shift = start - extent.offset;
            extent.image_offset += shift;
            extent.buffer_offset += shift;
            extent.offset = start;
            extent.length = end - start;
            Some(extent)
        })
        .collect()
}

/// Repeat `pattern` over `length` bytes starting `position` bytes into the
/// request buffer
fn expand_pattern(pattern: &Bytes, position: u64, length: u64) -> Bytes {
    let pattern_len = pattern.len() as u64;
    let mut out = BytesMut::with_capacity(length as usize);
    let mut phase = (position % pattern_len) as usize;
    let mut remaining = length as usize;
    while remaining > 0 {
        let take = (pattern.len() - phase).min(remaining);
        out.extend_from_slice(&pattern[phase..phase + take]);
        remaining -= take;
        phase = 0;
    }
    out.freeze()
}

/// Translate object-relative snapshot extents back to area offsets
fn to_image_delta(delta: SnapshotDelta, extents: &[ObjectExtent]) -> SnapshotDelta {
    delta
        .into_iter()
        .map(|(key, changed)| {
            let mapped = changed
                .iter()
                .flat_map(|c| {
                    extents.iter().filter_map(move |e| {
                        let start = c.offset.max(e.offset);
                        let end = (c.offset + c.length).min(e.offset + e.length);
                        (start < end).then(|| SnapshotExtent {
                            offset: e.image_offset + (start - e.offset),
                            length: end - start,
                            state: c.state,
                        })
                    })
                })
                .collect();
            (key, mapped)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_ctx::HeaderUpdate;
    use crate::testing::Harness;
    use rbdio_common::{ImageOptions, NOSNAP, SnapshotExtentState};

    const OBJECT: u64 = 1 << 22;

    fn object_extent(offset: u64, length: u64) -> ObjectExtent {
        ObjectExtent {
            object_no: 0,
            offset,
            length,
            image_offset: offset,
            buffer_offset: 0,
        }
    }

    #[test]
    fn test_prune_discard_extents() {
        let pruned = prune_discard_extents(
            vec![object_extent(100, 9000), object_extent(8192, 100)],
            4096,
        );
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].offset, 4096);
        assert_eq!(pruned[0].length, 4096);
        assert_eq!(pruned[0].image_offset, 4096);
    }

    #[test]
    fn test_expand_pattern_phase() {
        let pattern = Bytes::from_static(b"abcd");
        assert_eq!(&expand_pattern(&pattern, 0, 6)[..], b"abcdab");
        assert_eq!(&expand_pattern(&pattern, 6, 5)[..], b"cdabc");
    }

    #[test]
    fn test_write_then_read_across_objects() {
        let harness = Harness::new(ImageOptions::default());
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let write = harness.write(OBJECT - 4096, &data);
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(0));
        assert_eq!(harness.store.write_op_count(), 2);
        assert_eq!(harness.store.object_names().len(), 2);

        let read = harness.read_data(OBJECT - 4096, 8192);
        assert_eq!(&read[..], &data[..]);
    }

    #[test]
    fn test_read_unwritten_is_zero() {
        let harness = Harness::new(ImageOptions::default());
        let result = harness.read(OBJECT * 3, 4096);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(4096));
        assert_eq!(harness.read_data(OBJECT * 3, 16), vec![0u8; 16]);
    }

    #[test]
    fn test_backend_error_surfaces() {
        let harness = Harness::new(ImageOptions::default());
        harness.store.inject_error(libc::EIO);
        let result = harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(-i64::from(libc::EIO)));
    }

    #[test]
    fn test_discard_respects_granularity() {
        let harness = Harness::new(ImageOptions::default());
        harness.write(0, &[1u8; 16384]);
        harness.engine.run_pending();

        let discard = harness.discard(1000, 9000, 4096);
        harness.engine.run_pending();
        assert_eq!(*discard.lock(), Some(0));

        let data = harness.read_data(0, 16384);
        assert!(data[..4096].iter().all(|b| *b == 1));
        assert!(data[4096..8192].iter().all(|b| *b == 0));
        assert!(data[8192..].iter().all(|b| *b == 1));
    }

    #[test]
    fn test_write_same_expands_pattern() {
        let harness = Harness::new(ImageOptions::default());
        let result = harness.write_same(512, 2048, b"xy");
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(0));

        let data = harness.read_data(512, 2048);
        assert!(data.chunks(2).all(|c| c == b"xy"));
    }

    #[test]
    fn test_compare_and_write_mismatch_offset() {
        let harness = Harness::new(ImageOptions::default());
        harness.write(OBJECT + 100, &[4u8; 64]);
        harness.engine.run_pending();

        let mut cmp = vec![4u8; 64];
        cmp[10] = 5;
        let (result, mismatch) = harness.compare_and_write(OBJECT + 100, &cmp, &[6u8; 64]);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(-i64::from(libc::EILSEQ)));
        assert_eq!(*mismatch.lock(), Some(OBJECT + 110));

        let (result, _) = harness.compare_and_write(OBJECT + 100, &[4u8; 64], &[6u8; 64]);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(0));
        assert_eq!(harness.read_data(OBJECT + 100, 64), vec![6u8; 64]);
    }

    #[test]
    fn test_compare_and_write_across_objects_rejected() {
        let harness = Harness::new(ImageOptions::default());
        let (result, _) = harness.compare_and_write(OBJECT - 8, &[0u8; 16], &[1u8; 16]);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(-i64::from(libc::EINVAL)));
        assert_eq!(harness.store.op_count(), 0);
    }

    #[test]
    fn test_unclipped_read_past_address_space_rejected() {
        let harness = Harness::new(ImageOptions::default());
        let result = Arc::new(parking_lot::Mutex::new(None));
        let seen = result.clone();
        harness.image.aio_readv(
            vec![rbdio_common::Extent::new(u64::MAX - 10, 100)],
            crate::dispatch::ReadFlags::DISABLE_CLIPPING,
            move |r, _| *seen.lock() = Some(r),
        );
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(-i64::from(libc::EINVAL)));
        assert_eq!(harness.store.op_count(), 0);
        assert!(harness.image.ctx().async_ops.is_empty());
    }

    #[test]
    fn test_read_from_pinned_snapshot() {
        let harness = Harness::new(ImageOptions::default());
        harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();

        harness.store.snap_create(1);
        let ictx = harness.image.ctx().clone();
        ictx.notify_header_update(HeaderUpdate::SnapCreate {
            snap_id: 1,
            name: "one".into(),
        });
        ictx.refresh();

        harness.write(0, &[2u8; 512]);
        harness.engine.run_pending();

        ictx.snap_set(1).unwrap();
        assert_eq!(harness.read_data(0, 512), vec![1u8; 512]);
        ictx.snap_set(NOSNAP).unwrap();
        assert_eq!(harness.read_data(0, 512), vec![2u8; 512]);
    }

    #[test]
    fn test_list_snaps_translates_offsets() {
        let harness = Harness::new(ImageOptions::default());
        harness.write(OBJECT + 16, &[1u8; 16]);
        harness.engine.run_pending();
        harness.store.snap_create(1);
        harness.write(OBJECT + 48, &[2u8; 16]);
        harness.engine.run_pending();

        let (result, delta) = harness.list_snaps(OBJECT, 128, vec![1, NOSNAP]);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(0));

        // newly allocated ranges count as data, even where they hold zeros
        let delta = delta.lock().clone();
        assert_eq!(
            delta[&(0, 1)],
            vec![SnapshotExtent {
                offset: OBJECT,
                length: 32,
                state: SnapshotExtentState::Data,
            }]
        );
        assert_eq!(
            delta[&(1, NOSNAP)],
            vec![SnapshotExtent {
                offset: OBJECT + 32,
                length: 32,
                state: SnapshotExtentState::Data,
            }]
        );
    }

    #[test]
    fn test_list_snaps_requires_snapshots() {
        let harness = Harness::new(ImageOptions::default());
        let (result, _) = harness.list_snaps(0, 512, Vec::new());
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(-i64::from(libc::EINVAL)));
    }
}
