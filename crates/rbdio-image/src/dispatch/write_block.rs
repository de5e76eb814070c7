//! Write blocking stage
//!
//! While one or more blockers hold the image, write-class requests and user
//! flushes queue here in arrival order. A blocker is acknowledged once every
//! write that was in flight when it arrived has completed and a flush issued
//! below this layer has made them durable.

use super::{
    Dispatch, DispatchLayer, FlushSource, ImageDispatch, ImageDispatchSpec, ImageDispatcher,
    Request,
};
use crate::aio_completion::{AioCompletion, AioType};
use crate::completion::{Context, SaferCond};
use crate::image_ctx::ImageCtx;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

#[derive(Default)]
struct WriteBlockState {
    write_blockers: u32,
    in_flight_writes: u32,
    /// Blockers waiting for in-flight writes to drain
    blocker_contexts: Vec<Context>,
    unblocked_waiters: Vec<Context>,
    blocked: VecDeque<Box<ImageDispatchSpec>>,
}

pub struct WriteBlockImageDispatch {
    this: Weak<Self>,
    ictx: Arc<ImageCtx>,
    dispatcher: Weak<ImageDispatcher>,
    state: Mutex<WriteBlockState>,
}

impl WriteBlockImageDispatch {
    pub fn new(ictx: Arc<ImageCtx>, dispatcher: Weak<ImageDispatcher>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ictx,
            dispatcher,
            state: Mutex::new(WriteBlockState::default()),
        })
    }

    pub fn writes_blocked(&self) -> bool {
        self.state.lock().write_blockers > 0
    }

    /// Block writes, waiting on the calling thread
    pub fn block_writes(&self) -> i32 {
        let cond = SaferCond::new();
        self.block_writes_async(cond.context());
        cond.wait()
    }

    pub fn block_writes_async(&self, on_blocked: Context) {
        let flush_now = {
            let mut state = self.state.lock();
            state.write_blockers += 1;
            debug!(
                blockers = state.write_blockers,
                in_flight = state.in_flight_writes,
                "Blocking writes"
            );
            if state.in_flight_writes > 0 {
                state.blocker_contexts.push(on_blocked);
                None
            } else {
                Some(on_blocked)
            }
        };
        if let Some(on_blocked) = flush_now {
            self.flush_io(on_blocked);
        }
    }

    pub fn unblock_writes(&self) {
        let (waiters, resumed) = {
            let mut state = self.state.lock();
            assert!(
                state.write_blockers > 0,
                "unblocking writes that are not blocked"
            );
            state.write_blockers -= 1;
            if state.write_blockers > 0 {
                return;
            }

            let resumed: Vec<_> = state.blocked.drain(..).collect();
            state.in_flight_writes += u32::try_from(resumed.len()).unwrap_or(u32::MAX);
            (std::mem::take(&mut state.unblocked_waiters), resumed)
        };
        info!(image = %self.ictx.name, queued = resumed.len(), "Unblocked writes");

        for spec in &resumed {
            self.track(spec);
        }
        for waiter in waiters {
            waiter.complete(0);
        }
        if !resumed.is_empty() {
            self.ictx.engine.post(Box::new(move || {
                for spec in resumed {
                    spec.send();
                }
            }));
        }
    }

    pub fn wait_on_writes_unblocked(&self, on_unblocked: Context) {
        {
            let mut state = self.state.lock();
            if state.write_blockers > 0 {
                state.unblocked_waiters.push(on_unblocked);
                return;
            }
        }
        on_unblocked.complete(0);
    }

    fn process_io(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        {
            let mut state = self.state.lock();
            if state.write_blockers > 0 || !state.blocked.is_empty() {
                debug!(tid = spec.tid, op = spec.request.name(), "Queueing blocked request");
                state.blocked.push_back(spec);
                return Dispatch::Handled;
            }
            state.in_flight_writes += 1;
        }
        self.track(&spec);
        Dispatch::Continue(spec)
    }

    fn track(&self, spec: &ImageDispatchSpec) {
        let this = self.this.clone();
        spec.aio_comp.add_finish_hook(Context::new(move |_| {
            if let Some(this) = this.upgrade() {
                this.handle_finished();
            }
        }));
    }

    fn handle_finished(&self) {
        let blocked = {
            let mut state = self.state.lock();
            state.in_flight_writes -= 1;
            if state.write_blockers > 0
                && state.in_flight_writes == 0
                && !state.blocker_contexts.is_empty()
            {
                Some(std::mem::take(&mut state.blocker_contexts))
            } else {
                None
            }
        };

        if let Some(contexts) = blocked {
            self.flush_io(Context::new(move |r| {
                for ctx in contexts {
                    ctx.complete(r);
                }
            }));
        }
    }

    /// Flush everything below this layer
    fn flush_io(&self, on_finish: Context) {
        let aio_comp = AioCompletion::new(move |r, _| on_finish.complete(r as i32));
        aio_comp.init(&self.ictx, AioType::Flush);
        ImageDispatchSpec::create_flush(
            self.dispatcher.clone(),
            DispatchLayer::WriteBlock,
            aio_comp,
            FlushSource::WriteBlock,
        )
        .send();
    }
}

impl ImageDispatch for WriteBlockImageDispatch {
    fn layer(&self) -> DispatchLayer {
        DispatchLayer::WriteBlock
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.process_io(spec)
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.process_io(spec)
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.process_io(spec)
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.process_io(spec)
    }

    fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        match spec.request {
            Request::Flush {
                flush_source: FlushSource::User,
            } => self.process_io(spec),
            _ => Dispatch::Continue(spec),
        }
    }

    fn shut_down(&self, on_finish: Context) {
        let blocked: Vec<_> = self.state.lock().blocked.drain(..).collect();
        if !blocked.is_empty() {
            info!(image = %self.ictx.name, count = blocked.len(), "Failing blocked requests");
        }
        for spec in blocked {
            spec.fail(-libc::ESHUTDOWN);
        }
        on_finish.complete(0);
    }
}
