//! Write-back cache stage
//!
//! Absorbs writes into an in-memory dirty extent map and acknowledges them
//! immediately. Dirty data is written back in serialized rounds, as internal
//! writes issued below this layer, whenever an operation needs the backend to
//! see it: flushes, discards, write-same, compare-and-write, snapshot diffs,
//! reads that are not fully covered by dirty data, and writes that would push
//! the dirty total over `cache.max_dirty`.

use super::{
    Dispatch, DispatchLayer, ImageDispatch, ImageDispatchSpec, ImageDispatcher, Request,
};
use crate::aio_completion::{AioCompletion, AioType};
use crate::completion::{Context, Gather};
use crate::image_ctx::ImageCtx;

use bytes::Bytes;
use parking_lot::Mutex;
use rbdio_common::types::total_length;
use rbdio_common::{Extent, ImageArea, NOSNAP};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Non-overlapping dirty extents keyed by image offset
#[derive(Debug, Default)]
struct DirtyExtents {
    extents: BTreeMap<u64, Bytes>,
    bytes: u64,
}

impl DirtyExtents {
    fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Insert data, replacing whatever it overlaps
    fn insert(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        let overlapping: Vec<u64> = self
            .extents
            .range(..end)
            .rev()
            .take_while(|(start, existing)| **start + existing.len() as u64 > offset)
            .map(|(start, _)| *start)
            .collect();

        for start in overlapping {
            let Some(existing) = self.extents.remove(&start) else {
                continue;
            };
            self.bytes -= existing.len() as u64;
            let existing_end = start + existing.len() as u64;
            if start < offset {
                let head = existing.slice(..(offset - start) as usize);
                self.bytes += head.len() as u64;
                self.extents.insert(start, head);
            }
            if existing_end > end {
                let tail = existing.slice((end - start) as usize..);
                self.bytes += tail.len() as u64;
                self.extents.insert(end, tail);
            }
        }

        self.bytes += data.len() as u64;
        self.extents.insert(offset, data);
    }

    /// Check if any dirty byte falls inside the extent
    fn overlaps(&self, extent: &Extent) -> bool {
        self.extents
            .range(..extent.end())
            .next_back()
            .is_some_and(|(start, data)| start + data.len() as u64 > extent.offset)
    }

    /// Copy the extent out if every byte of it is dirty
    fn read(&self, extent: &Extent, out: &mut [u8]) -> bool {
        let first = self
            .extents
            .range(..=extent.offset)
            .next_back()
            .map_or(extent.offset, |(start, _)| *start);

        let mut position = extent.offset;
        for (start, data) in self.extents.range(first..extent.end()) {
            let data_end = start + data.len() as u64;
            if data_end <= position {
                continue;
            }
            if *start > position {
                return false;
            }
            let copy_end = data_end.min(extent.end());
            let src = &data[(position - start) as usize..(copy_end - start) as usize];
            let dst = (position - extent.offset) as usize;
            out[dst..dst + src.len()].copy_from_slice(src);
            position = copy_end;
            if position >= extent.end() {
                break;
            }
        }
        position >= extent.end()
    }
}

#[derive(Default)]
struct CacheState {
    dirty: DirtyExtents,
    /// Data of the writeback round in flight
    flushing: DirtyExtents,
    writeback_active: bool,
    /// Completed when the round in flight finishes
    round_waiters: Vec<Context>,
    /// Completed after the next round
    next_waiters: Vec<Context>,
}

pub struct WritebackCacheImageDispatch {
    this: Weak<Self>,
    ictx: Arc<ImageCtx>,
    dispatcher: Weak<ImageDispatcher>,
    state: Mutex<CacheState>,
}

impl WritebackCacheImageDispatch {
    pub fn new(ictx: Arc<ImageCtx>, dispatcher: Weak<ImageDispatcher>) -> Arc<Self> {
        info!(
            image = %ictx.name,
            max_dirty = ictx.options.cache.max_dirty,
            "Write-back cache enabled"
        );
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ictx,
            dispatcher,
            state: Mutex::new(CacheState::default()),
        })
    }

    fn is_clean(&self) -> bool {
        let state = self.state.lock();
        state.dirty.is_empty() && !state.writeback_active
    }

    /// Requests against a pinned snapshot or the crypto header never touch
    /// cached head data
    fn bypasses(&self, spec: &ImageDispatchSpec) -> bool {
        spec.area() != ImageArea::Data || self.ictx.snap_id() != NOSNAP
    }

    /// Write back all dirty data, then continue routing the request
    fn writeback_then_send(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        if self.is_clean() {
            return Dispatch::Continue(spec);
        }
        debug!(tid = spec.tid, op = spec.request.name(), "Writing back before request");
        self.writeback(Context::new(move |r| {
            if r < 0 {
                spec.fail(r);
            } else {
                spec.send();
            }
        }));
        Dispatch::Handled
    }

    /// Complete `on_finish` once all data dirty now reached the layers below
    fn writeback(&self, on_finish: Context) {
        let round = {
            let mut state = self.state.lock();
            if state.writeback_active {
                state.next_waiters.push(on_finish);
                return;
            }
            if state.dirty.is_empty() {
                Err(on_finish)
            } else {
                state.writeback_active = true;
                state.flushing = std::mem::take(&mut state.dirty);
                state.round_waiters.push(on_finish);
                Ok(state.flushing.extents.clone())
            }
        };

        match round {
            Ok(extents) => self.start_round(extents),
            Err(on_finish) => on_finish.complete(0),
        }
    }

    fn start_round(&self, extents: BTreeMap<u64, Bytes>) {
        debug!(image = %self.ictx.name, extents = extents.len(), "Starting writeback");
        let this = self.this.clone();
        let gather = Gather::new(Context::new(move |r| {
            if let Some(this) = this.upgrade() {
                this.handle_round_finished(r);
            }
        }));

        for (offset, data) in extents {
            let on_written = gather.new_sub();
            let aio_comp = AioCompletion::new(move |r, _| on_written.complete(r as i32));
            aio_comp.init(&self.ictx, AioType::Write);
            let length = data.len() as u64;
            ImageDispatchSpec::new(
                self.dispatcher.clone(),
                DispatchLayer::WritebackCache,
                aio_comp,
                vec![Extent::new(offset, length)],
                ImageArea::Data,
                Request::Write { data },
            )
            .send();
        }
        gather.activate();
    }

    fn handle_round_finished(&self, r: i32) {
        if r < 0 {
            warn!(image = %self.ictx.name, r, "Writeback failed");
        }
        let (waiters, next) = {
            let mut state = self.state.lock();
            state.writeback_active = false;
            state.flushing = DirtyExtents::default();
            let waiters = std::mem::take(&mut state.round_waiters);
            (waiters, std::mem::take(&mut state.next_waiters))
        };

        for waiter in waiters {
            waiter.complete(r);
        }
        if !next.is_empty() {
            self.writeback(Context::new(move |r| {
                for waiter in next {
                    waiter.complete(r);
                }
            }));
        }
    }

    /// Absorb a write if it fits under the dirty limit
    fn try_absorb(&self, spec: &ImageDispatchSpec) -> bool {
        let Request::Write { data } = &spec.request else {
            return false;
        };
        let length = total_length(&spec.image_extents);
        let mut state = self.state.lock();
        if state.dirty.bytes + length > self.ictx.options.cache.max_dirty {
            return false;
        }

        let mut position = 0usize;
        for extent in &spec.image_extents {
            let chunk = data.slice(position..position + extent.length as usize);
            position += extent.length as usize;
            if !chunk.is_empty() {
                state.dirty.insert(extent.offset, chunk);
            }
        }
        true
    }

    /// Serve a read from dirty data if every extent is fully covered
    fn try_serve_read(&self, spec: &ImageDispatchSpec) -> bool {
        let length = spec.total_length() as usize;
        let mut buffer = vec![0u8; length];
        {
            let state = self.state.lock();
            let mut position = 0usize;
            for extent in &spec.image_extents {
                let end = position + extent.length as usize;
                if !state.dirty.read(extent, &mut buffer[position..end]) {
                    return false;
                }
                position = end;
            }
        }

        spec.aio_comp.init_read_buffer(length);
        spec.aio_comp.copy_read_data(0, &buffer);
        spec.aio_comp.set_request_count(1);
        spec.aio_comp.complete_request(length as i64);
        true
    }

    fn touches_cached_data(&self, spec: &ImageDispatchSpec) -> bool {
        let state = self.state.lock();
        spec.image_extents
            .iter()
            .any(|e| state.dirty.overlaps(e) || state.flushing.overlaps(e))
    }
}

impl ImageDispatch for WritebackCacheImageDispatch {
    fn layer(&self) -> DispatchLayer {
        DispatchLayer::WritebackCache
    }

    fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        if self.bypasses(&spec) {
            return Dispatch::Continue(spec);
        }
        if self.try_serve_read(&spec) {
            debug!(tid = spec.tid, "Read served from cache");
            return Dispatch::Handled;
        }
        if self.touches_cached_data(&spec) {
            return self.writeback_then_send(spec);
        }
        Dispatch::Continue(spec)
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        if self.bypasses(&spec) {
            return Dispatch::Continue(spec);
        }
        if self.try_absorb(&spec) {
            debug!(tid = spec.tid, length = spec.total_length(), "Write absorbed by cache");
            spec.aio_comp.set_request_count(0);
            return Dispatch::Handled;
        }
        self.writeback_then_send(spec)
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.writeback_then_send(spec)
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.writeback_then_send(spec)
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.writeback_then_send(spec)
    }

    fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.writeback_then_send(spec)
    }

    fn list_snaps(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.writeback_then_send(spec)
    }

    fn invalidate_cache(&self, on_finish: Context) {
        let image = self.ictx.name.clone();
        self.writeback(Context::new(move |r| {
            info!(image = %image, r, "Invalidated write-back cache");
            on_finish.complete(r);
        }));
    }

    fn shut_down(&self, on_finish: Context) {
        let dropped = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.dirty).bytes
        };
        if dropped > 0 {
            warn!(image = %self.ictx.name, bytes = dropped, "Dropping dirty data at shutdown");
        }
        on_finish.complete(0);
    }
}
