//! Layered image request dispatch
//!
//! Requests travel through an ordered set of stages. Each stage either
//! handles a request, taking ownership of it, or hands it back so the next
//! stage sees it. A stage that parks a request later resends it, and routing
//! resumes after that stage's layer.
//!
//! ```text
//! send ─► preprocess ─► Queue ─► Qos ─► Refresh ─► WriteBlock
//!      ─► [WritebackCache] ─► Core ─► backend
//! ```

mod core_dispatch;
mod dispatcher;
mod flush_tracker;
mod op_tracker;
mod qos;
mod queue;
mod refresh;
mod spec;
mod write_block;
mod writeback_cache;

pub use core_dispatch::CoreImageDispatch;
pub use dispatcher::ImageDispatcher;
pub use flush_tracker::FlushTracker;
pub use op_tracker::AsyncOpTracker;
pub use qos::QosImageDispatch;
pub use queue::QueueImageDispatch;
pub use refresh::RefreshImageDispatch;
pub use spec::{DispatchFlags, FlushSource, ImageDispatchSpec, ReadFlags, Request};
pub use write_block::WriteBlockImageDispatch;
pub use writeback_cache::WritebackCacheImageDispatch;

use crate::completion::Context;

/// Stage identifiers in routing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DispatchLayer {
    /// Not yet routed
    None,
    Queue,
    Qos,
    Refresh,
    WriteBlock,
    WritebackCache,
    Core,
}

/// Outcome of offering a request to a stage
pub enum Dispatch {
    /// The stage took ownership of the request
    Handled,
    /// The stage declined; route to the next stage
    Continue(Box<ImageDispatchSpec>),
}

/// Uniform stage contract, one handler per request variant
///
/// Handlers default to declining so stages only implement the variants they
/// act on.
pub trait ImageDispatch: Send + Sync {
    fn layer(&self) -> DispatchLayer;

    fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    fn list_snaps(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        Dispatch::Continue(spec)
    }

    /// Drop cached data; stages without a cache complete immediately
    fn invalidate_cache(&self, on_finish: Context) {
        on_finish.complete(0);
    }

    /// Release stage resources before the dispatcher goes away
    fn shut_down(&self, on_finish: Context) {
        on_finish.complete(0);
    }
}

/// Invoke the handler matching the request variant
pub(crate) fn route(stage: &dyn ImageDispatch, spec: Box<ImageDispatchSpec>) -> Dispatch {
    match spec.request {
        Request::Read { .. } => stage.read(spec),
        Request::Write { .. } => stage.write(spec),
        Request::Discard { .. } => stage.discard(spec),
        Request::WriteSame { .. } => stage.write_same(spec),
        Request::CompareAndWrite { .. } => stage.compare_and_write(spec),
        Request::Flush { .. } => stage.flush(spec),
        Request::ListSnaps { .. } => stage.list_snaps(spec),
    }
}
