//! Quality of Service (QoS) stage
//!
//! Rate limits image requests with token buckets, one per throttle kind:
//!
//! - **IOPS / BPS**: applies to every read and write-class request
//! - **READ_IOPS / READ_BPS**: reads only
//! - **WRITE_IOPS / WRITE_BPS**: writes, discards, write-same, compare-and-write
//!
//! IOPS buckets cost one token per request, BPS buckets cost the request's
//! byte length. Buckets refill in whole ticks of
//! `max(schedule_tick_min, 1s / limit)` driven by the engine clock. A request
//! that finds a bucket short, or other requests already waiting on it, parks
//! in that bucket's FIFO until a tick refills enough tokens. Charged buckets
//! are recorded in the request's [`DispatchFlags`] so a resumed request is
//! never charged twice.

use super::{
    Dispatch, DispatchFlags, DispatchLayer, FlushTracker, ImageDispatch, ImageDispatchSpec,
};
use crate::completion::Context;
use crate::image_ctx::ImageCtx;
use crate::stats::IoStats;

use parking_lot::Mutex;
use rbdio_common::{Error, IoOperations, QosFlags, QosLimit, QosOptions, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A request waiting for tokens
struct Waiter {
    cost: u64,
    spec: Box<ImageDispatchSpec>,
}

/// Token bucket rate limiter for one throttle kind
struct TokenBucket {
    flag: QosFlags,
    limit: QosLimit,
    /// Refill period
    tick: Duration,
    /// Tokens added per tick
    per_tick: u64,
    /// Maximum tokens (burst capacity)
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    timer_armed: bool,
}

impl TokenBucket {
    fn new(flag: QosFlags, now: Instant) -> Self {
        Self {
            flag,
            limit: QosLimit::default(),
            tick: Duration::ZERO,
            per_tick: 0,
            capacity: 0,
            tokens: 0,
            last_refill: now,
            waiters: VecDeque::new(),
            timer_armed: false,
        }
    }

    fn is_enabled(&self) -> bool {
        self.limit.limit > 0
    }

    /// Update the rate limit, keeping at most the new capacity in tokens
    fn set_limit(&mut self, limit: QosLimit, tick_min: Duration, now: Instant) {
        let was_enabled = self.is_enabled();
        self.limit = limit;
        if !self.is_enabled() {
            self.capacity = 0;
            self.tokens = 0;
            return;
        }

        let rate_tick = Duration::from_secs(1) / u32::try_from(limit.limit).unwrap_or(u32::MAX);
        self.tick = tick_min.max(rate_tick).max(Duration::from_millis(1));
        let per_tick = u128::from(limit.limit) * self.tick.as_nanos() / 1_000_000_000;
        self.per_tick = u64::try_from(per_tick).unwrap_or(u64::MAX).max(1);
        self.capacity = if limit.burst > 0 {
            limit.burst.saturating_mul(limit.burst_seconds.max(1))
        } else {
            limit.limit
        };
        // parked costs were capped by the old capacity
        let capacity = self.capacity;
        for waiter in &mut self.waiters {
            waiter.cost = waiter.cost.min(capacity);
        }

        if was_enabled {
            self.refill(now);
            self.tokens = self.tokens.min(self.capacity);
        } else {
            self.tokens = self.capacity;
            self.last_refill = now;
        }
    }

    fn cost(&self, length: u64) -> u64 {
        let cost = if QosFlags::BYTE_THROTTLES.contains(self.flag) {
            length
        } else {
            1
        };
        cost.min(self.capacity)
    }

    /// Add the tokens of every whole tick elapsed since the last refill
    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill || self.tick.is_zero() {
            return;
        }
        let ticks = (now - self.last_refill).as_nanos() / self.tick.as_nanos();
        if ticks == 0 {
            return;
        }
        let ticks = u32::try_from(ticks).unwrap_or(u32::MAX);
        self.tokens = self
            .tokens
            .saturating_add(u64::from(ticks).saturating_mul(self.per_tick))
            .min(self.capacity);
        self.last_refill = if self.tokens == self.capacity {
            now
        } else {
            self.last_refill + self.tick * ticks
        };
    }

    fn try_acquire(&mut self, cost: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens < cost {
            return false;
        }
        self.tokens -= cost;
        true
    }

    /// Delay until the next refill
    fn next_tick(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tick.saturating_sub(elapsed).max(Duration::from_millis(1))
    }
}

struct QosState {
    /// One bucket per throttle kind, in [`QosOptions::limits`] order
    buckets: Vec<TokenBucket>,
    schedule_tick_min: Duration,
    exclude_ops: IoOperations,
    shut_down: bool,
}

/// Rate limiting stage
pub struct QosImageDispatch {
    this: Weak<Self>,
    ictx: Arc<ImageCtx>,
    state: Mutex<QosState>,
    flush_tracker: FlushTracker,
    stats: Arc<IoStats>,
}

impl QosImageDispatch {
    /// Create the stage with limits from validated options
    pub fn new(ictx: Arc<ImageCtx>) -> Arc<Self> {
        let options: &QosOptions = &ictx.options.qos;
        let now = ictx.engine.now();
        let schedule_tick_min = Duration::from_millis(options.schedule_tick_min_ms);
        let buckets = options
            .limits()
            .into_iter()
            .map(|(flag, limit)| {
                let mut bucket = TokenBucket::new(flag, now);
                bucket.set_limit(limit, schedule_tick_min, now);
                bucket
            })
            .collect();
        let state = QosState {
            buckets,
            schedule_tick_min,
            exclude_ops: options.exclude_ops_mask().unwrap_or_default(),
            shut_down: false,
        };

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ictx,
            state: Mutex::new(state),
            flush_tracker: FlushTracker::new(),
            stats: Arc::new(IoStats::new()),
        })
    }

    pub fn io_stats(&self) -> &IoStats {
        &self.stats
    }

    /// Change one throttle's limit
    pub fn apply_qos_limit(&self, flag: QosFlags, limit: QosLimit) -> Result<()> {
        limit.validate()?;
        let released = {
            let mut state = self.state.lock();
            let tick_min = state.schedule_tick_min;
            let Some(bucket) = state.buckets.iter_mut().find(|b| b.flag == flag) else {
                return Err(Error::invalid_argument(format!(
                    "unknown qos throttle {flag:?}"
                )));
            };
            bucket.set_limit(limit, tick_min, self.ictx.engine.now());
            info!(
                image = %self.ictx.name,
                ?flag,
                limit = limit.limit,
                burst = limit.burst,
                "Applied qos limit"
            );

            if bucket.is_enabled() {
                Vec::new()
            } else {
                let marker = DispatchFlags::qos(bucket.flag);
                bucket
                    .waiters
                    .drain(..)
                    .map(|mut waiter| {
                        waiter.spec.dispatch_flags |= marker;
                        waiter.spec
                    })
                    .collect()
            }
        };
        let ready = released
            .into_iter()
            .filter_map(|spec| self.acquire(spec))
            .collect();
        self.resume(ready);
        Ok(())
    }

    pub fn apply_qos_schedule_tick_min(&self, tick: Duration) {
        let mut state = self.state.lock();
        state.schedule_tick_min = tick;
        let now = self.ictx.engine.now();
        for bucket in &mut state.buckets {
            if bucket.is_enabled() {
                let limit = bucket.limit;
                bucket.set_limit(limit, tick, now);
            }
        }
    }

    pub fn apply_qos_exclude_ops(&self, ops: IoOperations) {
        self.state.lock().exclude_ops = ops;
    }

    fn needs_throttle(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        let op = spec.request.io_operation();
        let read = op == IoOperations::READ;
        let length = spec.total_length();
        self.track_stats(&spec, read, length);

        let applicable = if read {
            QosFlags::READ_THROTTLES
        } else {
            QosFlags::WRITE_THROTTLES
        };
        {
            let state = self.state.lock();
            if state.exclude_ops.intersects(op)
                || !state
                    .buckets
                    .iter()
                    .any(|b| b.is_enabled() && applicable.contains(b.flag))
            {
                return Dispatch::Continue(spec);
            }
        }

        let tid = spec.tid;
        self.flush_tracker.start_io(tid);
        let this = self.this.clone();
        spec.aio_comp.add_finish_hook(Context::new(move |_| {
            if let Some(this) = this.upgrade() {
                this.flush_tracker.finish_io(tid);
            }
        }));

        match self.acquire(spec) {
            Some(spec) => Dispatch::Continue(spec),
            None => Dispatch::Handled,
        }
    }

    fn track_stats(&self, spec: &ImageDispatchSpec, read: bool, length: u64) {
        let stats = self.stats.clone();
        let engine = self.ictx.engine.clone();
        let start = engine.now();
        spec.aio_comp.add_finish_hook(Context::new(move |r| {
            if r < 0 {
                return;
            }
            let latency_us = engine.now().saturating_duration_since(start).as_micros() as u64;
            if read {
                stats.record_read(length, latency_us);
            } else {
                stats.record_write(length, latency_us);
            }
        }));
    }

    /// Charge every applicable bucket not yet charged. Returns the request if
    /// it may proceed, or parks it on the first bucket short of tokens.
    fn acquire(&self, mut spec: Box<ImageDispatchSpec>) -> Option<Box<ImageDispatchSpec>> {
        let read = spec.request.io_operation() == IoOperations::READ;
        let applicable = if read {
            QosFlags::READ_THROTTLES
        } else {
            QosFlags::WRITE_THROTTLES
        };
        let length = spec.total_length();
        let now = self.ictx.engine.now();

        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            spec.fail(-libc::ESHUTDOWN);
            return None;
        }

        for (index, bucket) in state.buckets.iter_mut().enumerate() {
            let marker = DispatchFlags::qos(bucket.flag);
            if !bucket.is_enabled()
                || !applicable.contains(bucket.flag)
                || spec.dispatch_flags.contains(marker)
            {
                continue;
            }

            let cost = bucket.cost(length);
            if bucket.waiters.is_empty() && bucket.try_acquire(cost, now) {
                spec.dispatch_flags |= marker;
                continue;
            }

            debug!(tid = spec.tid, flag = ?bucket.flag, cost, "Throttling request");
            bucket.waiters.push_back(Waiter { cost, spec });
            let delay = (!bucket.timer_armed).then(|| {
                bucket.timer_armed = true;
                bucket.next_tick(now)
            });
            drop(state);

            self.stats.record_throttled();
            if let Some(delay) = delay {
                self.schedule_tick(index, delay);
            }
            return None;
        }
        Some(spec)
    }

    fn schedule_tick(&self, index: usize, delay: Duration) {
        let this = self.this.clone();
        self.ictx.engine.post_after(
            delay,
            Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.handle_tick(index);
                }
            }),
        );
    }

    /// Refill one bucket and release the waiters it can now pay for
    fn handle_tick(&self, index: usize) {
        let now = self.ictx.engine.now();
        let (ready, rearm) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            let bucket = &mut state.buckets[index];
            bucket.timer_armed = false;
            bucket.refill(now);

            let marker = DispatchFlags::qos(bucket.flag);
            let mut ready = Vec::new();
            while let Some(waiter) = bucket.waiters.front() {
                if waiter.cost > bucket.tokens {
                    break;
                }
                bucket.tokens -= waiter.cost;
                if let Some(mut waiter) = bucket.waiters.pop_front() {
                    waiter.spec.dispatch_flags |= marker;
                    ready.push(waiter.spec);
                }
            }

            let rearm = (!bucket.waiters.is_empty()).then(|| {
                bucket.timer_armed = true;
                bucket.next_tick(now)
            });
            (ready, rearm)
        };

        if let Some(delay) = rearm {
            self.schedule_tick(index, delay);
        }
        let ready = ready.into_iter().filter_map(|spec| self.acquire(spec)).collect();
        self.resume(ready);
    }

    /// Continue routing released requests from the engine
    fn resume(&self, specs: Vec<Box<ImageDispatchSpec>>) {
        for spec in specs {
            self.ictx.engine.post(Box::new(move || spec.send()));
        }
    }
}

impl ImageDispatch for QosImageDispatch {
    fn layer(&self) -> DispatchLayer {
        DispatchLayer::Qos
    }

    fn read(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_throttle(spec)
    }

    fn write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_throttle(spec)
    }

    fn discard(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_throttle(spec)
    }

    fn write_same(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_throttle(spec)
    }

    fn compare_and_write(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        self.needs_throttle(spec)
    }

    fn flush(&self, spec: Box<ImageDispatchSpec>) -> Dispatch {
        // parked requests are failed by teardown instead
        if spec.is_shutdown_flush() {
            return Dispatch::Continue(spec);
        }
        let tid = spec.tid;
        self.flush_tracker
            .flush(tid, Context::new(move |_| spec.send()));
        Dispatch::Handled
    }

    fn shut_down(&self, on_finish: Context) {
        let parked: Vec<Box<ImageDispatchSpec>> = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state
                .buckets
                .iter_mut()
                .flat_map(|b| b.waiters.drain(..).map(|w| w.spec).collect::<Vec<_>>())
                .collect()
        };
        if !parked.is_empty() {
            info!(image = %self.ictx.name, count = parked.len(), "Failing throttled requests");
        }
        for spec in parked {
            spec.fail(-libc::ESHUTDOWN);
        }
        self.flush_tracker.shut_down();
        on_finish.complete(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use rbdio_common::ImageOptions;

    fn options_with(configure: impl FnOnce(&mut QosOptions)) -> ImageOptions {
        let mut options = ImageOptions::default();
        configure(&mut options.qos);
        options
    }

    #[test]
    fn test_token_bucket_tick_and_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(QosFlags::IOPS, now);
        bucket.set_limit(QosLimit::new(100, 0, 0), Duration::from_millis(50), now);
        assert_eq!(bucket.tick, Duration::from_millis(50));
        assert_eq!(bucket.per_tick, 5);
        assert_eq!(bucket.capacity, 100);
        assert_eq!(bucket.tokens, 100);

        bucket.set_limit(QosLimit::new(2, 0, 0), Duration::from_millis(50), now);
        assert_eq!(bucket.tick, Duration::from_millis(500));
        assert_eq!(bucket.per_tick, 1);
        assert_eq!(bucket.tokens, 2);

        bucket.set_limit(QosLimit::new(10, 20, 3), Duration::from_millis(50), now);
        assert_eq!(bucket.capacity, 60);
    }

    #[test]
    fn test_token_bucket_refill_whole_ticks() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(QosFlags::IOPS, start);
        bucket.set_limit(QosLimit::new(10, 0, 0), Duration::from_millis(50), start);
        assert!(bucket.try_acquire(10, start));
        assert!(!bucket.try_acquire(1, start));

        // one tick is 100ms for 10 iops
        assert!(!bucket.try_acquire(1, start + Duration::from_millis(99)));
        assert!(bucket.try_acquire(1, start + Duration::from_millis(100)));
        assert!(!bucket.try_acquire(1, start + Duration::from_millis(150)));
        assert!(bucket.try_acquire(2, start + Duration::from_millis(300)));
    }

    #[test]
    fn test_iops_throttling_with_virtual_time() {
        let harness = Harness::new(options_with(|qos| qos.iops = QosLimit::new(10, 0, 0)));
        let results: Vec<_> = (0..12).map(|i| harness.write(i * 512, &[1u8; 512])).collect();
        harness.engine.run_pending();

        let done = results.iter().filter(|r| r.lock().is_some()).count();
        assert_eq!(done, 10);
        assert_eq!(harness.image.dispatcher().io_stats().throttled_ops(), 2);

        // one token per 100ms tick
        harness.engine.advance(Duration::from_millis(100));
        assert_eq!(results.iter().filter(|r| r.lock().is_some()).count(), 11);
        harness.engine.advance(Duration::from_millis(100));
        assert!(results.iter().all(|r| *r.lock() == Some(0)));
    }

    #[test]
    fn test_bps_charges_bytes() {
        let harness = Harness::new(options_with(|qos| qos.write_bps = QosLimit::new(4096, 0, 0)));
        let first = harness.write(0, &[1u8; 4096]);
        let second = harness.write(4096, &[1u8; 512]);
        let read = harness.read(0, 4096);
        harness.engine.run_pending();

        assert_eq!(*first.lock(), Some(0));
        assert!(second.lock().is_none());
        // reads are not subject to write throttles
        assert!(read.lock().is_some());

        // 4096 bytes/s with a 50ms tick refills 204 bytes per tick
        harness.engine.advance(Duration::from_millis(150));
        assert!(second.lock().is_some());
    }

    #[test]
    fn test_exclude_ops_bypass() {
        let harness = Harness::new(options_with(|qos| {
            qos.iops = QosLimit::new(1, 0, 0);
            qos.exclude_ops = vec!["read".into()];
        }));
        let reads: Vec<_> = (0..5).map(|_| harness.read(0, 512)).collect();
        harness.engine.run_pending();
        assert!(reads.iter().all(|r| r.lock().is_some()));

        let writes: Vec<_> = (0..2).map(|i| harness.write(i * 512, &[1u8; 512])).collect();
        harness.engine.run_pending();
        assert!(writes[0].lock().is_some());
        assert!(writes[1].lock().is_none());
        harness.engine.advance(Duration::from_secs(1));
        assert!(writes[1].lock().is_some());
    }

    #[test]
    fn test_resumed_request_not_charged_twice() {
        // Blocked on WRITE_IOPS after IOPS was charged: when released it must
        // not pay IOPS again.
        let harness = Harness::new(options_with(|qos| {
            qos.iops = QosLimit::new(100, 0, 0);
            qos.write_iops = QosLimit::new(1, 0, 0);
        }));
        let first = harness.write(0, &[1u8; 512]);
        let second = harness.write(512, &[1u8; 512]);
        harness.engine.run_pending();
        assert!(first.lock().is_some());
        assert!(second.lock().is_none());

        let iops_tokens = |h: &Harness| {
            let qos = h.image.dispatcher().qos_for_test();
            let state = qos.state.lock();
            state.buckets[0].tokens
        };
        let before = iops_tokens(&harness);
        assert_eq!(before, 98);
        harness.engine.advance(Duration::from_secs(1));
        assert!(second.lock().is_some());
        assert_eq!(iops_tokens(&harness), before);
    }

    #[test]
    fn test_disabling_limit_releases_waiters() {
        let harness = Harness::new(options_with(|qos| qos.iops = QosLimit::new(1, 0, 0)));
        let first = harness.read(0, 512);
        let second = harness.read(0, 512);
        harness.engine.run_pending();
        assert!(first.lock().is_some());
        assert!(second.lock().is_none());

        harness
            .image
            .dispatcher()
            .apply_qos_limit(QosFlags::IOPS, 0, 0, 0)
            .unwrap();
        harness.engine.run_pending();
        assert!(second.lock().is_some());
    }

    #[test]
    fn test_lowered_limit_releases_parked_request() {
        let mib = 1u64 << 20;
        let harness = Harness::new(options_with(|qos| qos.write_bps = QosLimit::new(mib, 0, 0)));
        let first = harness.write(0, &vec![1u8; mib as usize]);
        let second = harness.write(mib, &vec![2u8; 600_000]);
        let flush = harness.flush();
        harness.engine.run_pending();
        assert_eq!(*first.lock(), Some(0));
        assert!(second.lock().is_none());

        harness
            .image
            .dispatcher()
            .apply_qos_limit(QosFlags::WRITE_BPS, 4096, 0, 0)
            .unwrap();
        // the parked cost shrinks to the new 4096 byte capacity
        harness.engine.advance(Duration::from_secs(5));
        assert_eq!(*second.lock(), Some(0));
        assert_eq!(*flush.lock(), Some(0));
    }

    #[test]
    fn test_invalid_limit_rejected() {
        let harness = Harness::new(ImageOptions::default());
        let dispatcher = harness.image.dispatcher();
        assert!(dispatcher.apply_qos_limit(QosFlags::IOPS, 100, 50, 1).is_err());
        assert!(dispatcher.apply_qos_limit(QosFlags::IOPS, 100, 200, 0).is_err());
        assert!(dispatcher.apply_qos_limit(QosFlags::IOPS, 100, 200, 2).is_ok());
    }

    #[test]
    fn test_flush_waits_for_throttled_write() {
        let harness = Harness::new(options_with(|qos| qos.iops = QosLimit::new(1, 0, 0)));
        let first = harness.write(0, &[1u8; 512]);
        let second = harness.write(512, &[2u8; 512]);
        let flush = harness.flush();
        harness.engine.run_pending();
        assert!(first.lock().is_some());
        assert!(second.lock().is_none());
        assert!(flush.lock().is_none());

        harness.engine.advance(Duration::from_secs(1));
        assert_eq!(*second.lock(), Some(0));
        assert_eq!(*flush.lock(), Some(0));
    }

    #[test]
    fn test_shut_down_fails_throttled_requests() {
        let harness = Harness::new(options_with(|qos| qos.iops = QosLimit::new(1, 0, 0)));
        let first = harness.read(0, 512);
        let second = harness.read(0, 512);
        harness.engine.run_pending();
        assert!(second.lock().is_none());

        let closed = harness.close();
        assert_eq!(*first.lock(), Some(512));
        assert_eq!(*second.lock(), Some(-i64::from(libc::ESHUTDOWN)));
        assert_eq!(closed, 0);
    }
}
