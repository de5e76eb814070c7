//! rbdio Image I/O
//!
//! The I/O front-end of a block device image stored as fixed-size objects.
//! Client requests pass through an ordered pipeline of stages before the
//! terminal stage turns them into object operations, and completions travel
//! back through the same stages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │      Image      │  aio_read / aio_write / aio_flush ...
//! └────────┬────────┘
//!          │ ImageDispatchSpec
//! ┌────────▼────────┐
//! │ ImageDispatcher │  tid, clipping, validation
//! │  - Queue        │  hand-off to the engine
//! │  - Qos          │  token buckets
//! │  - Refresh      │  pending header updates
//! │  - WriteBlock   │  administrative write barrier
//! │  - Cache        │  optional write-back cache
//! │  - Core         │  object mapping
//! └────────┬────────┘
//!          │ ObjectOp
//! ┌────────▼────────┐
//! │  ObjectBackend  │
//! └─────────────────┘
//! ```
//!
//! All deferred work runs on an [`Executor`]: [`AsyncEngine`] in production,
//! [`InlineEngine`] where tests need deterministic scheduling and a virtual
//! clock.

pub mod aio_completion;
pub mod async_op;
pub mod completion;
pub mod dispatch;
pub mod engine;
pub mod image;
pub mod image_ctx;
pub mod stats;
pub mod striper;

#[cfg(test)]
pub(crate) mod testing;

pub use aio_completion::{AioCompletion, AioType, IoOutput};
pub use async_op::{AsyncOpList, AsyncOperation};
pub use completion::{Context, Gather, SaferCond};
pub use dispatch::{
    Dispatch, DispatchFlags, DispatchLayer, FlushSource, ImageDispatch, ImageDispatchSpec,
    ImageDispatcher, ReadFlags, Request,
};
pub use engine::{AsyncEngine, Executor, InlineEngine, Task};
pub use image::Image;
pub use image_ctx::{HeaderUpdate, ImageCtx, ImageState, SnapInfo};
pub use stats::{IoStats, LatencyHistogram, LatencyPercentiles};
pub use striper::{ObjectExtent, ObjectNo, Striper};
