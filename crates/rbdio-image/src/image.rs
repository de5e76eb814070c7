//! Open image handle

use crate::aio_completion::{AioCompletion, IoOutput};
use crate::completion::{Context, SaferCond};
use crate::dispatch::{
    DispatchLayer, FlushSource, ImageDispatchSpec, ImageDispatcher, ReadFlags, Request,
};
use crate::engine::Executor;
use crate::image_ctx::ImageCtx;

use bytes::Bytes;
use rbdio_client::ObjectBackend;
use rbdio_common::{Extent, Extents, ImageArea, ImageOptions, Result, SnapId};
use std::sync::Arc;
use tracing::info;

/// An open image and its dispatch pipeline
///
/// Every `aio_*` call returns immediately; the callback receives the final
/// status (bytes read, or 0 on success, or a negated errno) and any outputs
/// once the request completes.
pub struct Image {
    ictx: Arc<ImageCtx>,
    dispatcher: Arc<ImageDispatcher>,
}

impl Image {
    /// Open an image of `size` bytes on `backend`
    pub fn open(
        name: impl Into<String>,
        size: u64,
        options: ImageOptions,
        engine: Arc<dyn Executor>,
        backend: Arc<dyn ObjectBackend>,
    ) -> Result<Self> {
        let ictx = ImageCtx::new(name, size, options, engine, backend)?;
        let dispatcher = ImageDispatcher::new(ictx.clone());
        Ok(Self { ictx, dispatcher })
    }

    pub fn ctx(&self) -> &Arc<ImageCtx> {
        &self.ictx
    }

    pub fn dispatcher(&self) -> &Arc<ImageDispatcher> {
        &self.dispatcher
    }

    /// Submit a request with a caller-built completion
    pub fn submit(
        &self,
        aio_comp: Arc<AioCompletion>,
        image_extents: Extents,
        area: ImageArea,
        request: Request,
    ) {
        aio_comp.init(&self.ictx, request.aio_type());
        ImageDispatchSpec::new(
            Arc::downgrade(&self.dispatcher),
            DispatchLayer::None,
            aio_comp,
            image_extents,
            area,
            request,
        )
        .send();
    }

    fn submit_with(
        &self,
        image_extents: Extents,
        request: Request,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        self.submit(
            AioCompletion::new(callback),
            image_extents,
            ImageArea::Data,
            request,
        );
    }

    pub fn aio_read(
        &self,
        offset: u64,
        length: u64,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        self.aio_readv(vec![Extent::new(offset, length)], ReadFlags::empty(), callback);
    }

    /// Read several extents into one buffer, in extent order
    pub fn aio_readv(
        &self,
        image_extents: Extents,
        read_flags: ReadFlags,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        self.submit_with(image_extents, Request::Read { read_flags }, callback);
    }

    pub fn aio_write(
        &self,
        offset: u64,
        data: Bytes,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        let extent = Extent::new(offset, data.len() as u64);
        self.submit_with(vec![extent], Request::Write { data }, callback);
    }

    pub fn aio_discard(
        &self,
        offset: u64,
        length: u64,
        discard_granularity: u32,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        self.submit_with(
            vec![Extent::new(offset, length)],
            Request::Discard {
                discard_granularity,
            },
            callback,
        );
    }

    /// Fill `length` bytes with repetitions of `pattern`
    pub fn aio_write_same(
        &self,
        offset: u64,
        length: u64,
        pattern: Bytes,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        self.submit_with(
            vec![Extent::new(offset, length)],
            Request::WriteSame { data: pattern },
            callback,
        );
    }

    /// Write `data` only if the image currently holds `cmp_data`
    ///
    /// On mismatch the status is `-EILSEQ` and the output carries the image
    /// offset of the first differing byte.
    pub fn aio_compare_and_write(
        &self,
        offset: u64,
        cmp_data: Bytes,
        data: Bytes,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        let extent = Extent::new(offset, cmp_data.len() as u64);
        self.submit_with(
            vec![extent],
            Request::CompareAndWrite { cmp_data, data },
            callback,
        );
    }

    pub fn aio_flush(&self, callback: impl FnOnce(i64, IoOutput) + Send + 'static) {
        self.submit_with(
            Vec::new(),
            Request::Flush {
                flush_source: FlushSource::User,
            },
            callback,
        );
    }

    /// Changed ranges between consecutive snapshots of `snap_ids`
    pub fn aio_list_snaps(
        &self,
        image_extents: Extents,
        snap_ids: Vec<SnapId>,
        callback: impl FnOnce(i64, IoOutput) + Send + 'static,
    ) {
        self.submit_with(image_extents, Request::ListSnaps { snap_ids }, callback);
    }

    /// Drain in-flight requests and shut the pipeline down
    pub fn close_async(&self, on_finish: Context) {
        info!(image = %self.ictx.name, "Closing image");
        self.dispatcher.shut_down(on_finish);
    }

    /// Close, waiting on the calling thread
    ///
    /// Never call from an engine thread.
    pub fn close(&self) -> i32 {
        let cond = SaferCond::new();
        self.close_async(cond.context());
        cond.wait()
    }
}
