//! Caller-visible request completion

use crate::async_op::AsyncOperation;
use crate::completion::Context;
use crate::image_ctx::ImageCtx;

use bytes::Bytes;
use parking_lot::Mutex;
use rbdio_common::SnapshotDelta;
use std::sync::Arc;
use tracing::trace;

/// Request kind a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AioType {
    #[default]
    None,
    Read,
    Write,
    Discard,
    WriteSame,
    CompareAndWrite,
    Flush,
    ListSnaps,
}

/// Outputs delivered with the final status
#[derive(Debug, Clone, Default)]
pub struct IoOutput {
    pub read_data: Bytes,
    /// Image offset of the first mismatching byte of a compare-and-write
    pub mismatch_offset: Option<u64>,
    pub snapshot_delta: SnapshotDelta,
}

/// User callback: status (bytes read or 0 on success, negated errno on
/// failure) and outputs
pub type AioCallback = Box<dyn FnOnce(i64, IoOutput) + Send>;

#[derive(Default)]
struct AioState {
    callback: Option<AioCallback>,
    aio_type: AioType,
    ictx: Option<Arc<ImageCtx>>,
    async_op: AsyncOperation,
    request_count_set: bool,
    pending: usize,
    rval: i64,
    error: i64,
    read_buf: Vec<u8>,
    mismatch_offset: Option<u64>,
    snapshot_delta: SnapshotDelta,
    finish_hooks: Vec<Context>,
    result: Option<i64>,
}

/// Everything needed to deliver a completion, taken out of the lock
struct Finisher {
    r: i64,
    callback: Option<AioCallback>,
    ictx: Option<Arc<ImageCtx>>,
    async_op: AsyncOperation,
    output: IoOutput,
    finish_hooks: Vec<Context>,
}

impl Finisher {
    fn run(self) {
        let hook_r = if self.r < 0 { self.r as i32 } else { 0 };
        for hook in self.finish_hooks.into_iter().rev() {
            hook.complete(hook_r);
        }

        if let Some(callback) = self.callback {
            let (r, output) = (self.r, self.output);
            match &self.ictx {
                Some(ictx) => ictx.engine.post_api(Box::new(move || callback(r, output))),
                None => callback(r, output),
            }
        }

        let mut async_op = self.async_op;
        if async_op.is_active() {
            async_op.finish();
        }
    }
}

/// Completion handle of one image request
///
/// Backend sub-requests report through [`AioCompletion::complete_request`];
/// once the last one arrives the per-stage finish hooks run innermost first,
/// the request's operation record finishes and the user callback is posted
/// to the engine's serialized sub-context.
pub struct AioCompletion {
    state: Mutex<AioState>,
}

impl AioCompletion {
    pub fn new(callback: impl FnOnce(i64, IoOutput) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AioState {
                callback: Some(Box::new(callback)),
                ..AioState::default()
            }),
        })
    }

    /// Completion whose result is only observed through [`Self::return_value`]
    pub fn noop() -> Arc<Self> {
        Self::new(|_, _| {})
    }

    /// Bind the completion to an image and request kind
    pub fn init(&self, ictx: &Arc<ImageCtx>, aio_type: AioType) {
        let mut state = self.state.lock();
        if state.ictx.is_none() {
            state.ictx = Some(ictx.clone());
        }
        state.aio_type = aio_type;
    }

    pub fn aio_type(&self) -> AioType {
        self.state.lock().aio_type
    }

    /// Register the request in the image's active-operation list
    pub fn start_op(&self) {
        let mut state = self.state.lock();
        if state.async_op.is_active() {
            return;
        }
        let Some(ictx) = state.ictx.clone() else {
            panic!("aio completion started without an image");
        };
        state.async_op.start(&ictx);
    }

    /// Complete `ctx` once every operation started before this one finished
    pub fn flush_async_op(&self, ctx: Context) {
        self.state.lock().async_op.flush(ctx);
    }

    /// Run `hook` with the final status before the user callback
    pub fn add_finish_hook(&self, hook: Context) {
        self.state.lock().finish_hooks.push(hook);
    }

    /// Set the number of sub-requests; zero completes immediately
    pub fn set_request_count(&self, count: usize) {
        let finisher = {
            let mut state = self.state.lock();
            assert!(!state.request_count_set, "aio request count set twice");
            state.request_count_set = true;
            state.pending = count;
            (count == 0).then(|| Self::take_finisher(&mut state))
        };
        if let Some(finisher) = finisher {
            finisher.run();
        }
    }

    /// Report one sub-request: byte count or 0 on success, negated errno on
    /// failure. The first error wins.
    pub fn complete_request(&self, r: i64) {
        let finisher = {
            let mut state = self.state.lock();
            assert!(
                state.pending > 0,
                "aio completion has no pending requests"
            );
            if r < 0 {
                if state.error == 0 {
                    state.error = r;
                }
            } else {
                state.rval += r;
            }
            state.pending -= 1;
            (state.pending == 0).then(|| Self::take_finisher(&mut state))
        };
        if let Some(finisher) = finisher {
            finisher.run();
        }
    }

    /// Complete a request that never issued sub-requests with an error
    pub fn fail(&self, r: i32) {
        let finisher = {
            let mut state = self.state.lock();
            assert!(
                state.pending == 0,
                "aio completion failed with requests in flight"
            );
            state.request_count_set = true;
            state.error = i64::from(r);
            Self::take_finisher(&mut state)
        };
        finisher.run();
    }

    fn take_finisher(state: &mut AioState) -> Finisher {
        assert!(state.result.is_none(), "aio completion completed twice");
        let r = if state.error < 0 { state.error } else { state.rval };
        state.result = Some(r);
        trace!(r, aio_type = ?state.aio_type, "aio completion finished");
        Finisher {
            r,
            callback: state.callback.take(),
            ictx: state.ictx.clone(),
            async_op: std::mem::take(&mut state.async_op),
            output: IoOutput {
                read_data: Bytes::from(std::mem::take(&mut state.read_buf)),
                mismatch_offset: state.mismatch_offset,
                snapshot_delta: std::mem::take(&mut state.snapshot_delta),
            },
            finish_hooks: std::mem::take(&mut state.finish_hooks),
        }
    }

    /// Size the read buffer before sub-requests land in it
    pub fn init_read_buffer(&self, length: usize) {
        self.state.lock().read_buf = vec![0; length];
    }

    /// Copy returned data into the read buffer; short data leaves zeros
    pub fn copy_read_data(&self, buffer_offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        let end = (buffer_offset + data.len()).min(state.read_buf.len());
        if buffer_offset < end {
            state.read_buf[buffer_offset..end].copy_from_slice(&data[..end - buffer_offset]);
        }
    }

    pub fn set_mismatch_offset(&self, offset: u64) {
        self.state.lock().mismatch_offset = Some(offset);
    }

    /// Merge changed ranges into the snapshot delta output
    pub fn merge_snapshot_delta(&self, delta: SnapshotDelta) {
        let mut state = self.state.lock();
        for (key, extents) in delta {
            let merged = state.snapshot_delta.entry(key).or_default();
            merged.extend(extents);
            merged.sort_by_key(|e| e.offset);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }

    /// Final status once complete
    pub fn return_value(&self) -> Option<i64> {
        self.state.lock().result
    }
}
