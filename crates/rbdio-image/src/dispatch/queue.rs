//! Submission queue stage
//!
//! Hands requests off to the engine so routing continues on a worker rather
//! than on the submitter's stack.

use super::{Dispatch, DispatchLayer, FlushTracker, ImageDispatch, ImageDispatchSpec};
use crate::completion::Context;
use crate::image_ctx::ImageCtx;

use std::sync::{Arc, Weak};

pub struct QueueImageDispatch {
    this: Weak<Self>,
    ictx: Arc<ImageCtx>,
    flush_tracker: FlushTracker,
}

impl QueueImageDispatch {
    pub fn new(ictx: Arc<ImageCtx>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ictx,
            flush_tracker: FlushTracker::new(),
        })
    }

    fn enqueue(&self, spec: Box<ImageDispatchSpec>, read_op: bool) -> Dispatch {
        if !self.ictx.options.non_blocking_aio {
            return Dispatch::Continue(spec);
        }

        if !read_op {
            let tid = spec.tid;
            self.flush_tracker.start_io(tid);
            let this = self.this.clone();
            spec.aio_comp.add_finish_hook(Context::new(move |_| {
                if let Some(this) = this.upgrade() {
                    this.flush_tracker.finish_io(tid);
                }
            }));
        }

        self.ictx.engine.post(Box::new(move || spec.send()));
        Dispatch::Handled
    }
}

impl ImageDispatch for QueueImageDispatch {
    fn layer(&self) -> DispatchLayer {
        DispatchLayer::Queue
    }

    fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.enqueue(spec, true)
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.enqueue(spec, false)
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.enqueue(spec, false)
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.enqueue(spec, false)
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.enqueue(spec, false)
    }

    fn list_snaps(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.enqueue(spec, true)
    }

    fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        if spec.is_shutdown_flush() {
            return Dispatch::Continue(spec);
        }
        let tid = spec.tid;
        self.flush_tracker
            .flush(tid, Context::new(move |_| spec.send()));
        Dispatch::Handled
    }

    fn shut_down(&self, on_finish: Context) {
        self.flush_tracker.shut_down();
        on_finish.complete(0);
    }
}
