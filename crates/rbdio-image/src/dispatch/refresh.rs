//! Header refresh stage
//!
//! Applies pending header updates before a request sees the image metadata.
//! Requests that arrive while a refresh is outstanding wait for it and resume
//! together once it is applied.

use super::{Dispatch, DispatchLayer, ImageDispatch, ImageDispatchSpec};
use crate::completion::Context;
use crate::image_ctx::ImageCtx;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    waiters: Vec<Box<ImageDispatchSpec>>,
}

pub struct RefreshImageDispatch {
    this: Weak<Self>,
    ictx: Arc<ImageCtx>,
    state: Mutex<RefreshState>,
}

impl RefreshImageDispatch {
    pub fn new(ictx: Arc<ImageCtx>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ictx,
            state: Mutex::new(RefreshState::default()),
        })
    }

    fn needs_refresh(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        if !self.ictx.refresh_required() {
            return Dispatch::Continue(spec);
        }

        let start = {
            let mut state = self.state.lock();
            state.waiters.push(spec);
            !std::mem::replace(&mut state.refreshing, true)
        };
        if start {
            let this = self.this.clone();
            self.ictx.engine.post(Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.handle_refresh();
                }
            }));
        }
        Dispatch::Handled
    }

    fn handle_refresh(&self) {
        let mut applied = 0;
        let waiters = loop {
            applied += self.ictx.refresh();
            if let Some(waiters) = self.finish_refresh() {
                break waiters;
            }
        };
        debug!(
            image = %self.ictx.name,
            applied,
            resumed = waiters.len(),
            "Refreshed image header"
        );
        for spec in waiters {
            spec.send();
        }
    }

    /// Release the waiters unless another update arrived during the refresh
    fn finish_refresh(&self) -> Option<Vec<Box<ImageDispatchSpec>>> {
        let mut state = self.state.lock();
        if self.ictx.refresh_required() {
            return None;
        }
        state.refreshing = false;
        Some(std::mem::take(&mut state.waiters))
    }
}

impl ImageDispatch for RefreshImageDispatch {
    fn layer(&self) -> DispatchLayer {
        DispatchLayer::Refresh
    }

    fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_refresh(spec)
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_refresh(spec)
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_refresh(spec)
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_refresh(spec)
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_refresh(spec)
    }

    fn list_snaps(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_refresh(spec)
    }

    fn shut_down(&self, on_finish: Context) {
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        for spec in waiters {
            spec.fail(-libc::ESHUTDOWN);
        }
        on_finish.complete(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio_completion::{AioCompletion, AioType};
    use crate::dispatch::{ReadFlags, Request};
    use crate::image_ctx::HeaderUpdate;
    use crate::testing::{Harness, test_ctx};
    use rbdio_common::{Extent, ImageArea, ImageOptions};

    #[test]
    fn test_pending_resize_applied_before_routing() {
        let harness = Harness::with_size(ImageOptions::default(), 4096);
        let ictx = harness.image.ctx().clone();
        ictx.notify_header_update(HeaderUpdate::Resize(1 << 20));
        assert!(ictx.refresh_required());

        // preprocessing still clips against the old size
        let write = harness.write(0, &[3u8; 4096]);
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(0));
        assert!(!ictx.refresh_required());
        assert_eq!(ictx.size(), 1 << 20);

        let read = harness.read(8192, 4096);
        harness.engine.run_pending();
        assert_eq!(*read.lock(), Some(4096));
    }

    #[test]
    fn test_read_only_toggle_applied() {
        let harness = Harness::new(ImageOptions::default());
        let ictx = harness.image.ctx().clone();
        ictx.notify_header_update(HeaderUpdate::SetReadOnly(true));

        let read = harness.read(0, 512);
        harness.engine.run_pending();
        assert_eq!(*read.lock(), Some(512));
        assert!(ictx.is_read_only());

        let write = harness.write(0, &[1u8; 512]);
        harness.engine.run_pending();
        assert_eq!(*write.lock(), Some(-i64::from(libc::EROFS)));
    }

    #[test]
    fn test_waiters_resume_together() {
        let harness = Harness::new(ImageOptions {
            non_blocking_aio: false,
            ..ImageOptions::default()
        });
        let ictx = harness.image.ctx().clone();
        ictx.notify_header_update(HeaderUpdate::Resize(1 << 21));

        let reads: Vec<_> = (0..3).map(|i| harness.read(i * 512, 512)).collect();
        // parked until the posted refresh runs
        assert_eq!(harness.store.op_count(), 0);
        harness.engine.run_pending();
        assert_eq!(harness.store.op_count(), 3);
        assert!(reads.iter().all(|r| *r.lock() == Some(512)));
    }

    #[test]
    fn test_update_during_refresh_applied_before_resume() {
        let (engine, _store, ictx) = test_ctx();
        let stage = RefreshImageDispatch::new(ictx.clone());
        ictx.notify_header_update(HeaderUpdate::Resize(1 << 20));

        // without a dispatcher a resumed request fails with ESHUTDOWN
        let aio_comp = AioCompletion::noop();
        aio_comp.init(&ictx, AioType::Read);
        let spec = ImageDispatchSpec::new(
            Weak::new(),
            DispatchLayer::Refresh,
            aio_comp.clone(),
            vec![Extent::new(0, 512)],
            ImageArea::Data,
            Request::Read {
                read_flags: ReadFlags::empty(),
            },
        );
        assert!(matches!(stage.read(spec), Dispatch::Handled));

        // a second update lands after the first pass was applied
        ictx.refresh();
        ictx.notify_header_update(HeaderUpdate::SetReadOnly(true));
        assert!(stage.finish_refresh().is_none());
        assert!(!aio_comp.is_complete());

        engine.run_pending();
        assert!(ictx.is_read_only());
        assert!(!ictx.refresh_required());
        assert_eq!(aio_comp.return_value(), Some(-i64::from(libc::ESHUTDOWN)));
    }
}
