//! Image dispatcher: preprocessing, routing and administrative fan-out

use super::{
    AsyncOpTracker, CoreImageDispatch, Dispatch, DispatchLayer, FlushSource, ImageDispatch,
    ImageDispatchSpec, QosImageDispatch, QueueImageDispatch, ReadFlags, RefreshImageDispatch,
    Request, WriteBlockImageDispatch, WritebackCacheImageDispatch, route,
};
use crate::aio_completion::{AioCompletion, AioType};
use crate::async_op::AsyncOperation;
use crate::completion::{Context, Gather};
use crate::image_ctx::ImageCtx;
use crate::stats::IoStats;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use rbdio_common::types::total_length;
use rbdio_common::{Error, Extent, IoOperations, QosFlags, QosLimit, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A registered stage and its in-progress call counter
#[derive(Clone)]
struct StageEntry {
    dispatch: Arc<dyn ImageDispatch>,
    tracker: Arc<AsyncOpTracker>,
}

/// Routes image requests through the registered stages
pub struct ImageDispatcher {
    ictx: Arc<ImageCtx>,
    stages: RwLock<BTreeMap<DispatchLayer, StageEntry>>,
    qos: Arc<QosImageDispatch>,
    write_block: Arc<WriteBlockImageDispatch>,
    next_tid: AtomicU64,
    shutting_down: AtomicBool,
}

impl ImageDispatcher {
    /// Build the pipeline for an open image
    pub fn new(ictx: Arc<ImageCtx>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let qos = QosImageDispatch::new(ictx.clone());
            let write_block = WriteBlockImageDispatch::new(ictx.clone(), this.clone());

            let mut stages: Vec<Arc<dyn ImageDispatch>> = vec![
                QueueImageDispatch::new(ictx.clone()),
                qos.clone(),
                RefreshImageDispatch::new(ictx.clone()),
                write_block.clone(),
                CoreImageDispatch::new(ictx.clone()),
            ];
            if ictx.options.cache.enabled {
                stages.push(WritebackCacheImageDispatch::new(ictx.clone(), this.clone()));
            }

            let stages = stages
                .into_iter()
                .map(|dispatch| {
                    debug!(layer = ?dispatch.layer(), "Registered image dispatch");
                    let entry = StageEntry {
                        dispatch,
                        tracker: Arc::new(AsyncOpTracker::new()),
                    };
                    (entry.dispatch.layer(), entry)
                })
                .collect();

            Self {
                ictx,
                stages: RwLock::new(stages),
                qos,
                write_block,
                next_tid: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }
        })
    }

    pub fn image_ctx(&self) -> &Arc<ImageCtx> {
        &self.ictx
    }

    /// Register a stage, replacing any stage registered at its layer
    pub fn register_dispatch(&self, dispatch: Arc<dyn ImageDispatch>) {
        let layer = dispatch.layer();
        debug!(?layer, "Registered image dispatch");
        self.stages.write().insert(
            layer,
            StageEntry {
                dispatch,
                tracker: Arc::new(AsyncOpTracker::new()),
            },
        );
    }

    /// Registered layers in routing order
    pub fn layers(&self) -> Vec<DispatchLayer> {
        self.stages.read().keys().copied().collect()
    }

    /// Send a request, or continue routing a request already in flight
    pub fn send(self: &Arc<Self>, mut spec: Box<ImageDispatchSpec>) {
        if spec.tid == 0 {
            if self.rejects_new_requests(&spec) {
                debug!(op = spec.request.name(), "Rejecting request during shutdown");
                spec.fail(-libc::ESHUTDOWN);
                return;
            }
            spec.tid = self.next_tid.fetch_add(1, Ordering::Relaxed) + 1;
            spec.trace.record("tid", spec.tid);
            if self.preprocess(&mut spec) {
                return;
            }
        }

        loop {
            let next = {
                let stages = self.stages.read();
                stages
                    .range((Bound::Excluded(spec.dispatch_layer), Bound::Unbounded))
                    .next()
                    .map(|(layer, entry)| (*layer, entry.clone()))
            };
            let Some((layer, entry)) = next else {
                self.fail_unrouted(spec);
                return;
            };

            spec.dispatch_layer = layer;
            entry.tracker.start_op();
            let result = route(entry.dispatch.as_ref(), spec);
            entry.tracker.finish_op();

            match result {
                Dispatch::Handled => return,
                Dispatch::Continue(next_spec) => spec = next_spec,
            }
        }
    }

    fn rejects_new_requests(&self, spec: &ImageDispatchSpec) -> bool {
        // stage-issued requests and the shutdown flush itself still route
        self.shutting_down.load(Ordering::Acquire)
            && spec.dispatch_layer == DispatchLayer::None
            && !spec.is_shutdown_flush()
    }

    fn fail_unrouted(&self, spec: Box<ImageDispatchSpec>) {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!(tid = spec.tid, "Request reached torn down pipeline");
            spec.fail(-libc::ESHUTDOWN);
        } else {
            error!(
                tid = spec.tid,
                op = spec.request.name(),
                "Request was not handled by any image dispatch"
            );
            spec.fail(-libc::EINVAL);
        }
    }

    /// Validate and clip a new request. Returns true if it was completed.
    fn preprocess(&self, spec: &mut ImageDispatchSpec) -> bool {
        let had_extents = !spec.image_extents.is_empty();
        let clip_reads = match &spec.request {
            Request::Read { read_flags } => !read_flags.contains(ReadFlags::DISABLE_CLIPPING),
            _ => true,
        };
        let result = if !spec.request.is_write_op() {
            match spec.request {
                Request::ListSnaps { .. } => return false,
                Request::Flush { .. } => {
                    return match self.clip_request(spec) {
                        Ok(_) => false,
                        Err(e) => self.finish_early(spec, e),
                    };
                }
                _ if clip_reads => self.clip_request(spec).map(|_| ()),
                _ => Ok(()),
            }
        } else {
            self.preprocess_write(spec)
        };

        if let Err(e) = result {
            return self.finish_early(spec, e);
        }
        if had_extents && spec.total_length() == 0 {
            debug!(tid = spec.tid, "Request clipped to nothing");
            spec.aio_comp.set_request_count(0);
            return true;
        }
        false
    }

    fn finish_early(&self, spec: &ImageDispatchSpec, e: Error) -> bool {
        debug!(tid = spec.tid, op = spec.request.name(), error = %e, "Request rejected");
        spec.aio_comp.fail(e.errno());
        true
    }

    fn preprocess_write(&self, spec: &mut ImageDispatchSpec) -> Result<()> {
        validate_write_args(&spec.request, &spec.image_extents)?;
        let original = self.clip_request(spec)?;

        if original != spec.image_extents {
            trim_write_buffers(&mut spec.request, &original, &spec.image_extents);
        }

        let state = self.ictx.image_lock.read();
        if state.is_write_protected() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Clip extents to the addressed area, returning the unclipped extents
    fn clip_request(&self, spec: &mut ImageDispatchSpec) -> Result<Vec<Extent>> {
        let area_size = self.ictx.image_lock.read().area_size(spec.area());
        let original = spec.image_extents.clone();
        for extent in &mut spec.image_extents {
            clip_extent(extent, area_size)?;
        }
        Ok(original)
    }

    // ── Administrative fan-out ────────────────────────────────────────────

    /// Set a throttle's rate, burst and burst duration
    pub fn apply_qos_limit(
        &self,
        flag: QosFlags,
        limit: u64,
        burst: u64,
        burst_seconds: u64,
    ) -> Result<()> {
        self.qos
            .apply_qos_limit(flag, QosLimit::new(limit, burst, burst_seconds))
    }

    pub fn apply_qos_schedule_tick_min(&self, tick: Duration) {
        self.qos.apply_qos_schedule_tick_min(tick);
    }

    pub fn apply_qos_exclude_ops(&self, ops: IoOperations) {
        self.qos.apply_qos_exclude_ops(ops);
    }

    /// Rate limiter statistics
    pub fn io_stats(&self) -> &IoStats {
        self.qos.io_stats()
    }

    #[cfg(test)]
    pub(crate) fn qos_for_test(&self) -> &Arc<QosImageDispatch> {
        &self.qos
    }

    pub fn writes_blocked(&self) -> bool {
        self.write_block.writes_blocked()
    }

    /// Block writes and wait until in-flight writes are flushed
    ///
    /// Blocks the calling thread; never call from an engine thread.
    pub fn block_writes(&self) -> i32 {
        self.write_block.block_writes()
    }

    pub fn block_writes_async(&self, on_blocked: Context) {
        self.write_block.block_writes_async(on_blocked);
    }

    pub fn unblock_writes(&self) {
        self.write_block.unblock_writes();
    }

    pub fn wait_on_writes_unblocked(&self, on_unblocked: Context) {
        self.write_block.wait_on_writes_unblocked(on_unblocked);
    }

    /// Drop cached data in every stage
    pub fn invalidate_cache(&self, on_finish: Context) {
        let stages: Vec<StageEntry> = self.stages.read().values().cloned().collect();
        let gather = Gather::new(on_finish);
        for entry in stages {
            entry.dispatch.invalidate_cache(gather.new_sub());
        }
        gather.activate();
    }

    /// Drain in-flight requests and tear the stages down
    pub fn shut_down(self: &Arc<Self>, on_finish: Context) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            warn!(image = %self.ictx.name, "Image dispatcher already shutting down");
            on_finish.complete(0);
            return;
        }
        info!(image = %self.ictx.name, "Shutting down image dispatcher");

        let op = Arc::new(Mutex::new(AsyncOperation::new()));
        op.lock().start(&self.ictx);
        let finishing = op.clone();
        let this = self.clone();
        let ctx = Context::new(move |_| {
            finishing.lock().finish();
            this.flush_for_shutdown(on_finish);
        });
        op.lock().flush(ctx);
    }

    fn flush_for_shutdown(self: &Arc<Self>, on_finish: Context) {
        let this = self.clone();
        let aio_comp = AioCompletion::new(move |r, _| {
            if r < 0 {
                warn!(r, "Shutdown flush failed");
            }
            this.shut_down_stages(on_finish);
        });
        aio_comp.init(&self.ictx, AioType::Flush);
        let spec = ImageDispatchSpec::create_flush(
            Arc::downgrade(self),
            DispatchLayer::None,
            aio_comp,
            FlushSource::Shutdown,
        );
        self.send(spec);
    }

    fn shut_down_stages(&self, on_finish: Context) {
        let stages: Vec<(DispatchLayer, StageEntry)> =
            std::mem::take(&mut *self.stages.write()).into_iter().collect();
        let image = self.ictx.name.clone();
        Self::shut_down_next(
            stages,
            Context::new(move |r| {
                info!(image = %image, "Image dispatcher shut down");
                on_finish.complete(r);
            }),
        );
    }

    /// Tear down the last remaining stage, then recurse
    fn shut_down_next(mut stages: Vec<(DispatchLayer, StageEntry)>, on_finish: Context) {
        let Some((layer, entry)) = stages.pop() else {
            on_finish.complete(0);
            return;
        };
        let tracker = entry.tracker.clone();
        tracker.wait_for_ops(Context::new(move |_| {
            entry.dispatch.shut_down(Context::new(move |r| {
                debug!(?layer, r, "Image dispatch shut down");
                Self::shut_down_next(stages, on_finish);
            }));
        }));
    }
}

/// Clip one extent to an area of `area_size` bytes
fn clip_extent(extent: &mut Extent, area_size: u64) -> Result<()> {
    if extent.length == 0 {
        return Ok(());
    }
    if extent.offset >= area_size {
        return Err(Error::OutOfRange {
            offset: extent.offset,
            size: area_size,
        });
    }
    extent.length = extent.length.min(area_size - extent.offset);
    Ok(())
}

fn validate_write_args(request: &Request, extents: &[Extent]) -> Result<()> {
    match request {
        Request::Write { data } => {
            if data.len() as u64 != total_length(extents) {
                return Err(Error::invalid_argument(format!(
                    "write buffer of {} bytes for {} bytes of extents",
                    data.len(),
                    total_length(extents)
                )));
            }
        }
        Request::WriteSame { data } => {
            let pattern = data.len() as u64;
            if pattern == 0 {
                return Err(Error::invalid_argument("empty write-same pattern"));
            }
            if extents.iter().any(|e| e.length % pattern != 0) {
                return Err(Error::invalid_argument(
                    "write-same extent is not a multiple of the pattern",
                ));
            }
        }
        Request::CompareAndWrite { cmp_data, data } => {
            let [extent] = extents else {
                return Err(Error::invalid_argument(
                    "compare-and-write takes exactly one extent",
                ));
            };
            if cmp_data.len() as u64 != extent.length || data.len() as u64 != extent.length {
                return Err(Error::invalid_argument(
                    "compare-and-write buffers must match the extent length",
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Cut write buffers down to the clipped extents
fn trim_write_buffers(request: &mut Request, original: &[Extent], clipped: &[Extent]) {
    match request {
        Request::Write { data } => {
            let mut trimmed = BytesMut::with_capacity(total_length(clipped) as usize);
            let mut position = 0usize;
            for (orig, clip) in original.iter().zip(clipped) {
                trimmed.extend_from_slice(&data[position..position + clip.length as usize]);
                position += orig.length as usize;
            }
            *data = trimmed.freeze();
        }
        Request::CompareAndWrite { cmp_data, data } => {
            let length = total_length(clipped) as usize;
            *cmp_data = cmp_data.slice(..length);
            *data = data.slice(..length);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio_completion::IoOutput;
    use crate::testing::Harness;
    use rbdio_common::{ImageOptions, NOSNAP};
    use std::sync::atomic::AtomicUsize;

    /// Stage that records the tids it sees and optionally completes them
    struct Recorder {
        layer: DispatchLayer,
        handle: bool,
        tids: Mutex<Vec<u64>>,
    }

    impl Recorder {
        fn new(layer: DispatchLayer, handle: bool) -> Arc<Self> {
            Arc::new(Self {
                layer,
                handle,
                tids: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
            self.tids.lock().push(spec.tid);
            if self.handle {
                spec.aio_comp.set_request_count(0);
                Dispatch::Handled
            } else {
                Dispatch::Continue(spec)
            }
        }
    }

    impl ImageDispatch for Recorder {
        fn layer(&self) -> DispatchLayer {
            self.layer
        }

        fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
            self.record(spec)
        }

        fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
            self.record(spec)
        }

        fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
            self.record(spec)
        }
    }

    fn blocking() -> ImageOptions {
        ImageOptions {
            non_blocking_aio: false,
            ..ImageOptions::default()
        }
    }

    #[test]
    fn test_stages_registered_in_order() {
        let harness = Harness::new(ImageOptions::default());
        assert_eq!(
            harness.image.dispatcher().layers(),
            vec![
                DispatchLayer::Queue,
                DispatchLayer::Qos,
                DispatchLayer::Refresh,
                DispatchLayer::WriteBlock,
                DispatchLayer::Core,
            ]
        );

        let mut options = ImageOptions::default();
        options.cache.enabled = true;
        let harness = Harness::new(options);
        assert!(
            harness
                .image
                .dispatcher()
                .layers()
                .contains(&DispatchLayer::WritebackCache)
        );
    }

    #[test]
    fn test_tids_strictly_increase() {
        let harness = Harness::new(blocking());
        let recorder = Recorder::new(DispatchLayer::Refresh, false);
        harness.image.dispatcher().register_dispatch(recorder.clone());

        for i in 0..5 {
            harness.read(i * 512, 512);
        }
        harness.write(0, &[1u8; 512]);
        harness.flush();
        harness.engine.run_pending();

        let tids = recorder.tids.lock().clone();
        assert_eq!(tids, (1..=7).collect::<Vec<u64>>());
    }

    #[test]
    fn test_handled_request_skips_later_stages() {
        let harness = Harness::new(blocking());
        let first = Recorder::new(DispatchLayer::Qos, true);
        let second = Recorder::new(DispatchLayer::Refresh, false);
        harness.image.dispatcher().register_dispatch(first.clone());
        harness.image.dispatcher().register_dispatch(second.clone());

        let result = harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(0));
        assert_eq!(first.tids.lock().len(), 1);
        assert!(second.tids.lock().is_empty());
        assert_eq!(harness.store.op_count(), 0);
    }

    #[test]
    fn test_exactly_once_completion() {
        let harness = Harness::new(ImageOptions::default());
        let completions = Arc::new(AtomicUsize::new(0));
        for i in 0..20u64 {
            let counter = completions.clone();
            let callback = move |_: i64, _: IoOutput| {
                counter.fetch_add(1, Ordering::SeqCst);
            };
            match i % 4 {
                0 => harness.image.aio_read(i * 4096, 4096, callback),
                1 => harness
                    .image
                    .aio_write(i * 4096, bytes::Bytes::from(vec![1u8; 4096]), callback),
                2 => harness.image.aio_flush(callback),
                _ => harness.image.aio_read(u64::MAX - 10, 4096, callback),
            }
        }
        harness.engine.run_pending();
        assert_eq!(completions.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let harness = Harness::new(ImageOptions {
            read_only: true,
            ..blocking()
        });
        let recorder = Recorder::new(DispatchLayer::Queue, false);
        harness.image.dispatcher().register_dispatch(recorder.clone());

        let write = harness.write(0, &[1u8; 512]);
        let discard = harness.discard(0, 512, 0);
        let read = harness.read(0, 512);
        harness.engine.run_pending();

        let erofs = Some(-i64::from(libc::EROFS));
        assert_eq!(*write.lock(), erofs);
        assert_eq!(*discard.lock(), erofs);
        assert_eq!(*read.lock(), Some(512));
        // only the read was routed
        assert_eq!(recorder.tids.lock().len(), 1);
        assert_eq!(harness.store.write_op_count(), 0);
    }

    #[test]
    fn test_snapshot_pinned_rejects_writes() {
        let harness = Harness::new(blocking());
        let ictx = harness.image.ctx().clone();
        ictx.notify_header_update(crate::image_ctx::HeaderUpdate::SnapCreate {
            snap_id: 4,
            name: "pinned".into(),
        });
        ictx.refresh();
        ictx.snap_set(4).unwrap();

        let write = harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(-i64::from(libc::EROFS)));

        ictx.snap_set(NOSNAP).unwrap();
        let write = harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(0));
    }

    #[test]
    fn test_clip_failure_never_reaches_backend() {
        let harness = Harness::with_size(ImageOptions::default(), 1 << 20);
        let read = harness.read(2 << 20, 4096);
        harness.engine.run_pending();
        assert_eq!(*read.lock(), Some(-i64::from(libc::EINVAL)));
        assert_eq!(harness.store.op_count(), 0);
    }

    #[test]
    fn test_clipping_truncates_at_image_end() {
        let size = 1 << 20;
        let harness = Harness::with_size(ImageOptions::default(), size);

        let read = harness.read(size - 100, 4096);
        harness.engine.run_pending();
        assert_eq!(*read.lock(), Some(100));

        let write = harness.write(size - 512, &[1u8; 1024]);
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(0));
        assert_eq!(harness.read_data(size - 512, 512), vec![1u8; 512]);

        // zero-length extents are valid anywhere
        let empty = harness.read(size * 2, 0);
        harness.engine.run_pending();
        assert_eq!(*empty.lock(), Some(0));
    }

    #[test]
    fn test_disable_clipping_reads_past_end() {
        let size = 1 << 20;
        let harness = Harness::with_size(ImageOptions::default(), size);
        let result = Arc::new(Mutex::new(None));
        let seen = result.clone();
        harness.image.aio_readv(
            vec![Extent::new(size - 100, 200)],
            ReadFlags::DISABLE_CLIPPING,
            move |r, _| *seen.lock() = Some(r),
        );
        harness.engine.run_pending();
        assert_eq!(*result.lock(), Some(200));
    }

    #[test]
    fn test_invalid_write_arguments() {
        let harness = Harness::new(ImageOptions::default());
        let dispatcher = harness.image.dispatcher();
        let einval = Some(-i64::from(libc::EINVAL));

        let mismatched = AioCompletion::noop();
        harness.image.submit(
            mismatched.clone(),
            vec![Extent::new(0, 1024)],
            rbdio_common::ImageArea::Data,
            Request::Write {
                data: bytes::Bytes::from(vec![0u8; 512]),
            },
        );
        let pattern = harness.write_same(0, 1000, b"abc");
        harness.engine.run_pending();
        assert_eq!(mismatched.return_value(), einval);
        assert_eq!(*pattern.lock(), einval);
        assert!(!dispatcher.writes_blocked());
    }

    #[test]
    fn test_unhandled_request_fails() {
        let harness = Harness::new(blocking());
        let decline = Recorder::new(DispatchLayer::Core, false);
        harness.image.dispatcher().register_dispatch(decline.clone());

        let read = harness.read(0, 512);
        harness.engine.run_pending();
        assert_eq!(*read.lock(), Some(-i64::from(libc::EINVAL)));
        assert_eq!(decline.tids.lock().len(), 1);
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_ops() {
        let harness = Harness::new(ImageOptions::default());
        harness.store.pause();
        let write = harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();

        let closed = harness.close_async();
        harness.engine.run_pending();
        assert!(closed.lock().is_none());
        assert_eq!(harness.image.dispatcher().layers().len(), 5);

        harness.store.resume();
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(0));
        assert_eq!(*closed.lock(), Some(0));
        assert!(harness.image.dispatcher().layers().is_empty());
        assert!(harness.image.ctx().async_ops.is_empty());

        let late = harness.write(0, &[2u8; 512]);
        harness.engine.run_pending();
        assert_eq!(*late.lock(), Some(-i64::from(libc::ESHUTDOWN)));
    }

    #[test]
    fn test_invalidate_without_cache_completes() {
        let harness = Harness::new(ImageOptions::default());
        let invalidated = harness.invalidate_cache();
        harness.engine.run_pending();
        assert_eq!(*invalidated.lock(), Some(0));
    }

    fn random_io_matches_model(options: ImageOptions) {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // window straddling the first object boundary
        let object = 1u64 << options.object_order;
        let base = object - 16 * 1024;
        let span = 32 * 1024usize;

        let harness = Harness::new(options);
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = vec![0u8; span];
        for _ in 0..200 {
            let offset = rng.gen_range(0..span - 1);
            let length = rng.gen_range(1..=(span - offset).min(8192));
            let fill: u8 = rng.r#gen();
            harness.write(base + offset as u64, &vec![fill; length]);
            model[offset..offset + length].fill(fill);
            harness.engine.run_pending();
        }
        harness.flush();
        harness.engine.run_pending();

        assert_eq!(harness.read_data(base, span as u64), model);
        assert_eq!(harness.close(), 0);
    }

    #[test]
    fn test_random_io_matches_model() {
        random_io_matches_model(ImageOptions::default());

        let mut cached = ImageOptions::default();
        cached.cache.enabled = true;
        random_io_matches_model(cached);
    }

    #[test]
    fn test_clip_extent() {
        let mut extent = Extent::new(90, 20);
        clip_extent(&mut extent, 100).unwrap();
        assert_eq!(extent.length, 10);

        let mut empty = Extent::new(500, 0);
        assert!(clip_extent(&mut empty, 100).is_ok());

        let mut beyond = Extent::new(100, 1);
        assert!(matches!(
            clip_extent(&mut beyond, 100),
            Err(Error::OutOfRange { offset: 100, size: 100 })
        ));
    }
}
