//! Request statistics kept by the rate limiter

use std::sync::atomic::{AtomicU64, Ordering};

const BUCKETS: usize = 16;

/// Upper bound of histogram bucket `index` in microseconds
///
/// Bounds follow a 1-2-5 series from 10us to 500ms; the last bucket is
/// unbounded.
const fn bucket_bound(index: usize) -> u64 {
    if index >= BUCKETS - 1 {
        return u64::MAX;
    }
    let mut decade = 10u64;
    let mut i = 0;
    while i < index / 3 {
        decade *= 10;
        i += 1;
    }
    match index % 3 {
        0 => decade,
        1 => decade * 2,
        _ => decade * 5,
    }
}

/// Lock-free latency histogram
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    samples: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let index = (0..BUCKETS)
            .find(|&i| latency_us < bucket_bound(i))
            .unwrap_or(BUCKETS - 1);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Mean latency in microseconds
    pub fn avg(&self) -> u64 {
        self.total_us
            .load(Ordering::Relaxed)
            .checked_div(self.count())
            .unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given quantile (0.0 - 1.0)
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile(&self, quantile: f64) -> u64 {
        let samples = self.count();
        if samples == 0 {
            return 0;
        }
        let rank = (samples as f64 * quantile).ceil() as u64;
        let mut seen = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return bucket_bound(index);
            }
        }
        u64::MAX
    }
}

/// Latency summary
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPercentiles {
    pub avg: u64,
    pub max: u64,
    pub p50: u64,
    pub p99: u64,
}

impl LatencyPercentiles {
    pub fn from_histogram(histogram: &LatencyHistogram) -> Self {
        Self {
            avg: histogram.avg(),
            max: histogram.max(),
            p50: histogram.percentile(0.50),
            p99: histogram.percentile(0.99),
        }
    }
}

/// Completed requests in one direction
#[derive(Debug, Default)]
struct Direction {
    ops: AtomicU64,
    bytes: AtomicU64,
    latency: LatencyHistogram,
}

impl Direction {
    fn record(&self, bytes: u64, latency_us: u64) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.latency.record(latency_us);
    }
}

/// Counters for requests passing the rate limiter
#[derive(Debug, Default)]
pub struct IoStats {
    reads: Direction,
    writes: Direction,
    /// Requests that had to wait for tokens
    throttled: AtomicU64,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64, latency_us: u64) {
        self.reads.record(bytes, latency_us);
    }

    /// Record a completed write-class request
    pub fn record_write(&self, bytes: u64, latency_us: u64) {
        self.writes.record(bytes, latency_us);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_ops(&self) -> u64 {
        self.reads.ops.load(Ordering::Relaxed)
    }

    pub fn write_ops(&self) -> u64 {
        self.writes.ops.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.reads.bytes.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.writes.bytes.load(Ordering::Relaxed)
    }

    pub fn throttled_ops(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    pub fn read_latency(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_histogram(&self.reads.latency)
    }

    pub fn write_latency(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_histogram(&self.writes.latency)
    }
}
