//! In-flight operation tracking and flush barriers
//!
//! Every started [`AsyncOperation`] owns an entry in its image's
//! [`AsyncOpList`], keyed by a sequence number that only grows, so the newest
//! operation always has the highest key. A flush attached to an operation is
//! parked on the next-older entry and travels further down as older
//! operations finish, firing only once nothing older is still active.

use crate::completion::Context;
use crate::image_ctx::ImageCtx;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tracing::trace;

#[derive(Default)]
struct OpListInner {
    next_seq: u64,
    /// Active operations by sequence, with the flushes parked on each
    active: BTreeMap<u64, Vec<Context>>,
}

/// Per-image ordered list of active operations
#[derive(Default)]
pub struct AsyncOpList {
    inner: Mutex<OpListInner>,
}

impl AsyncOpList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active operations
    pub fn len(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().active.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum OpState {
    #[default]
    Unstarted,
    Active,
    Finished,
}

/// One tracked unit of in-flight work
#[derive(Default)]
pub struct AsyncOperation {
    state: OpState,
    ictx: Option<Arc<ImageCtx>>,
    seq: u64,
}

impl AsyncOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state == OpState::Active
    }

    /// Link the operation as the newest entry of the image's list
    pub fn start(&mut self, ictx: &Arc<ImageCtx>) {
        assert_eq!(
            self.state,
            OpState::Unstarted,
            "async operation started twice"
        );
        let mut list = ictx.async_ops.inner.lock();
        list.next_seq += 1;
        let seq = list.next_seq;
        list.active.insert(seq, Vec::new());
        drop(list);

        trace!(seq, "started async op");
        self.seq = seq;
        self.ictx = Some(ictx.clone());
        self.state = OpState::Active;
    }

    /// Unlink the operation and release or forward its parked flushes
    pub fn finish(&mut self) {
        assert_eq!(
            self.state,
            OpState::Active,
            "async operation finished without being active"
        );
        self.state = OpState::Finished;
        let Some(ictx) = self.ictx.take() else {
            unreachable!("active async operation without image");
        };

        let flushes = {
            let mut list = ictx.async_ops.inner.lock();
            let Some(flushes) = list.active.remove(&self.seq) else {
                panic!("async operation {} missing from active list", self.seq);
            };
            match list.active.range_mut(..self.seq).next_back() {
                Some((_, older)) => {
                    older.extend(flushes);
                    return;
                }
                None => flushes,
            }
        };
        trace!(seq = self.seq, flushes = flushes.len(), "finished async op");
        if flushes.is_empty() {
            return;
        }

        let owner = ictx.clone();
        ictx.engine.post(Box::new(move || {
            let _owner_lock = owner.owner_lock.read_recursive();
            for ctx in flushes {
                ctx.complete(0);
            }
        }));
    }

    /// Complete `ctx` once every operation older than this one has finished
    pub fn flush(&self, ctx: Context) {
        assert_eq!(
            self.state,
            OpState::Active,
            "flush on an inactive async operation"
        );
        let Some(ictx) = self.ictx.as_ref() else {
            unreachable!("active async operation without image");
        };
        {
            let mut list = ictx.async_ops.inner.lock();
            if let Some((_, older)) = list.active.range_mut(..self.seq).next_back() {
                older.push(ctx);
                return;
            }
        }
        ictx.engine.complete(ctx, 0);
    }
}

impl Drop for AsyncOperation {
    fn drop(&mut self) {
        if !thread::panicking() {
            assert_ne!(
                self.state,
                OpState::Active,
                "async operation dropped while active"
            );
        }
    }
}
