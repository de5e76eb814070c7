//! Shared test fixtures

use crate::completion::Context;
use crate::engine::{AsyncEngine, InlineEngine};
use crate::image::Image;
use crate::image_ctx::ImageCtx;

use bytes::Bytes;
use parking_lot::Mutex;
use rbdio_client::MemStore;
use rbdio_common::{Extent, ImageOptions, SnapId, SnapshotDelta};
use std::sync::Arc;

/// Final status of a request, filled in by its callback
pub type Slot = Arc<Mutex<Option<i64>>>;

const TEST_IMAGE_SIZE: u64 = 1 << 30;

pub fn test_ctx() -> (Arc<InlineEngine>, Arc<MemStore>, Arc<ImageCtx>) {
    let engine = Arc::new(InlineEngine::new());
    let store = Arc::new(MemStore::new());
    let ictx = ImageCtx::new(
        "test",
        TEST_IMAGE_SIZE,
        ImageOptions::default(),
        engine.clone(),
        store.clone(),
    )
    .unwrap();
    (engine, store, ictx)
}

/// Image on a threaded engine
pub fn threaded_image(options: ImageOptions) -> Image {
    let engine = Arc::new(AsyncEngine::new(&options.engine).unwrap());
    let store = Arc::new(MemStore::new());
    Image::open("threaded", TEST_IMAGE_SIZE, options, engine, store).unwrap()
}

/// Image on an [`InlineEngine`] with request helpers
pub struct Harness {
    pub engine: Arc<InlineEngine>,
    pub store: Arc<MemStore>,
    pub image: Image,
}

impl Harness {
    pub fn new(options: ImageOptions) -> Self {
        Self::with_size(options, TEST_IMAGE_SIZE)
    }

    pub fn with_size(options: ImageOptions, size: u64) -> Self {
        let engine = Arc::new(InlineEngine::new());
        let store = Arc::new(MemStore::new());
        let image = Image::open("test", size, options, engine.clone(), store.clone()).unwrap();
        Self {
            engine,
            store,
            image,
        }
    }

    fn slot() -> (Slot, Slot) {
        let slot = Arc::new(Mutex::new(None));
        (slot.clone(), slot)
    }

    pub fn read(&self, offset: u64, length: u64) -> Slot {
        let (slot, seen) = Self::slot();
        self.image
            .aio_read(offset, length, move |r, _| *seen.lock() = Some(r));
        slot
    }

    /// Read and wait, asserting success
    pub fn read_data(&self, offset: u64, length: u64) -> Vec<u8> {
        let result = Arc::new(Mutex::new(None));
        let seen = result.clone();
        self.image.aio_read(offset, length, move |r, out| {
            *seen.lock() = Some((r, out.read_data));
        });
        self.engine.run_pending();
        let (r, data) = result.lock().take().expect("read did not complete");
        assert_eq!(r, length as i64, "short or failed read");
        data.to_vec()
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Slot {
        let (slot, seen) = Self::slot();
        self.image.aio_write(
            offset,
            Bytes::copy_from_slice(data),
            move |r, _| *seen.lock() = Some(r),
        );
        slot
    }

    pub fn discard(&self, offset: u64, length: u64, granularity: u32) -> Slot {
        let (slot, seen) = Self::slot();
        self.image.aio_discard(offset, length, granularity, move |r, _| {
            *seen.lock() = Some(r);
        });
        slot
    }

    pub fn write_same(&self, offset: u64, length: u64, pattern: &[u8]) -> Slot {
        let (slot, seen) = Self::slot();
        self.image.aio_write_same(
            offset,
            length,
            Bytes::copy_from_slice(pattern),
            move |r, _| *seen.lock() = Some(r),
        );
        slot
    }

    pub fn compare_and_write(
        &self,
        offset: u64,
        cmp: &[u8],
        data: &[u8],
    ) -> (Slot, Arc<Mutex<Option<u64>>>) {
        let (slot, seen) = Self::slot();
        let mismatch = Arc::new(Mutex::new(None));
        let mismatch_seen = mismatch.clone();
        self.image.aio_compare_and_write(
            offset,
            Bytes::copy_from_slice(cmp),
            Bytes::copy_from_slice(data),
            move |r, out| {
                *mismatch_seen.lock() = out.mismatch_offset;
                *seen.lock() = Some(r);
            },
        );
        (slot, mismatch)
    }

    pub fn list_snaps(
        &self,
        offset: u64,
        length: u64,
        snap_ids: Vec<SnapId>,
    ) -> (Slot, Arc<Mutex<SnapshotDelta>>) {
        let (slot, seen) = Self::slot();
        let delta = Arc::new(Mutex::new(SnapshotDelta::new()));
        let delta_seen = delta.clone();
        self.image.aio_list_snaps(
            vec![Extent::new(offset, length)],
            snap_ids,
            move |r, out| {
                *delta_seen.lock() = out.snapshot_delta;
                *seen.lock() = Some(r);
            },
        );
        (slot, delta)
    }

    pub fn flush(&self) -> Slot {
        let (slot, seen) = Self::slot();
        self.image.aio_flush(move |r, _| *seen.lock() = Some(r));
        slot
    }

    pub fn invalidate_cache(&self) -> Slot {
        let (slot, seen) = Self::slot();
        self.image
            .dispatcher()
            .invalidate_cache(Context::new(move |r| *seen.lock() = Some(i64::from(r))));
        slot
    }

    /// Start closing the image without driving the engine
    pub fn close_async(&self) -> Slot {
        let (slot, seen) = Self::slot();
        self.image
            .close_async(Context::new(move |r| *seen.lock() = Some(i64::from(r))));
        slot
    }

    /// Close and drive the engine until shutdown completes
    pub fn close(&self) -> i64 {
        let closed = self.close_async();
        self.engine.run_pending();
        let r = *closed.lock();
        r.expect("close did not complete")
    }
}
