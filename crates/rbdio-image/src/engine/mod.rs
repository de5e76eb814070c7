//! Execution engine
//!
//! Every component receives an [`Executor`] at construction and schedules all
//! deferred work through it. Two implementations exist: [`AsyncEngine`] owns
//! a tokio runtime, [`InlineEngine`] runs queued work on demand against a
//! virtual clock.

mod inline;
mod runtime;

pub use inline::InlineEngine;
pub use runtime::AsyncEngine;

use crate::completion::Context;
use std::time::{Duration, Instant};

/// Unit of work scheduled on an engine
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling capability shared by the image pipeline
pub trait Executor: Send + Sync {
    /// Run `task` now if already inside this engine, else schedule it
    fn dispatch(&self, task: Task);

    /// Schedule `task`; never runs it before returning
    fn post(&self, task: Task);

    /// Complete `ctx` with `r` from a scheduled task
    fn complete(&self, ctx: Context, r: i32) {
        self.post(Box::new(move || ctx.complete(r)));
    }

    /// Schedule `task` on the serialized sub-context used for user-visible
    /// completions. Tasks posted here run one at a time in FIFO order.
    fn post_api(&self, task: Task);

    /// Schedule `task` once `delay` has elapsed
    fn post_after(&self, delay: Duration, task: Task);

    /// Engine clock
    fn now(&self) -> Instant;
}
