//! rbdio bench
//!
//! Opens an image on an in-memory object store, drives the dispatch pipeline
//! with a read/write workload at a fixed queue depth and reports throughput,
//! latency and rate limiter counters.

mod workload;

use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use rbdio_client::MemStore;
use rbdio_common::{ImageOptions, QosLimit};
use rbdio_image::{
    AsyncEngine, Image, IoOutput, IoStats, LatencyHistogram, LatencyPercentiles, SaferCond,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::workload::{IoKind, Pattern, Workload};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "rbdio-bench", about = "rbdio image I/O benchmark")]
struct Args {
    /// Image size in bytes
    #[arg(long, default_value_t = 1 << 30)]
    size: u64,

    /// Object size as a power of two (overrides the config file)
    #[arg(long)]
    object_order: Option<u8>,

    /// Request size in bytes
    #[arg(long, default_value_t = 4096)]
    io_size: u64,

    /// Number of requests to issue
    #[arg(long, default_value_t = 100_000)]
    total_ios: u64,

    /// Requests kept in flight
    #[arg(long, default_value_t = 32)]
    queue_depth: usize,

    /// Offset pattern
    #[arg(long, value_enum, default_value_t = Pattern::Rand)]
    pattern: Pattern,

    /// Percentage of requests that are reads
    #[arg(long, default_value_t = 50)]
    read_percent: u8,

    /// IOPS limit
    #[arg(long)]
    qos_iops: Option<u64>,

    /// Bytes per second limit
    #[arg(long)]
    qos_bps: Option<u64>,

    /// Enable the write-back cache stage
    #[arg(long)]
    cache: bool,

    /// Engine worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Workload seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Image options file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Options from the config file, then `RBDIO__*` variables, then flags
fn load_options(args: &Args) -> Result<ImageOptions> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    let mut options: ImageOptions = builder
        .add_source(
            config::Environment::with_prefix("RBDIO")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("load configuration")?
        .try_deserialize()
        .context("parse image options")?;

    if let Some(order) = args.object_order {
        options.object_order = order;
    }
    if let Some(iops) = args.qos_iops {
        options.qos.iops = QosLimit::new(iops, 0, 0);
    }
    if let Some(bps) = args.qos_bps {
        options.qos.bps = QosLimit::new(bps, 0, 0);
    }
    if let Some(threads) = args.threads {
        options.engine.threads = threads;
    }
    if args.cache {
        options.cache.enabled = true;
    }

    options.validate().context("invalid image options")?;
    Ok(options)
}

// ── Results ───────────────────────────────────────────────────────────────────

struct Completed {
    kind: IoKind,
    r: i64,
    latency: Duration,
}

#[derive(Default)]
struct Summary {
    reads: u64,
    writes: u64,
    errors: u64,
    bytes: u64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl Summary {
    fn record(&mut self, completed: &Completed, io_size: u64) {
        if completed.r < 0 {
            self.errors += 1;
            warn!(r = completed.r, kind = ?completed.kind, "Request failed");
            return;
        }
        let latency_us = u64::try_from(completed.latency.as_micros()).unwrap_or(u64::MAX);
        match completed.kind {
            IoKind::Read => {
                self.reads += 1;
                self.read_latency.record(latency_us);
            }
            IoKind::Write => {
                self.writes += 1;
                self.write_latency.record(latency_us);
            }
        }
        self.bytes += io_size;
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self, elapsed: Duration, qos: &IoStats) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let ops = self.reads + self.writes;
        println!("elapsed       {:.3}s", elapsed.as_secs_f64());
        println!(
            "completed     {ops} ({} reads, {} writes, {} errors)",
            self.reads, self.writes, self.errors
        );
        println!("iops          {:.0}", ops as f64 / secs);
        println!(
            "throughput    {:.2} MiB/s",
            self.bytes as f64 / secs / (1024.0 * 1024.0)
        );
        print_latency("read", LatencyPercentiles::from_histogram(&self.read_latency));
        print_latency(
            "write",
            LatencyPercentiles::from_histogram(&self.write_latency),
        );
        println!("throttled     {}", qos.throttled_ops());
    }
}

fn print_latency(kind: &str, latency: LatencyPercentiles) {
    println!(
        "{kind:<5} lat(us) avg {} p50 {} p99 {} max {}",
        latency.avg, latency.p50, latency.p99, latency.max
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = load_options(&args)?;
    if args.queue_depth == 0 {
        bail!("queue depth must be positive");
    }
    info!(
        size = args.size,
        io_size = args.io_size,
        queue_depth = args.queue_depth,
        pattern = ?args.pattern,
        "Starting rbdio bench"
    );

    let mut workload = Workload::new(
        args.pattern,
        args.size,
        args.io_size,
        args.read_percent,
        args.seed,
    )?;
    let engine = Arc::new(AsyncEngine::new(&options.engine).context("start engine")?);
    let store = Arc::new(MemStore::new());
    let image = Image::open("bench", args.size, options, engine, store).context("open image")?;

    let io_len = usize::try_from(args.io_size).context("io size")?;
    let payload = Bytes::from(vec![0xa5u8; io_len]);
    let (tx, rx) = mpsc::channel::<Completed>();
    let mut summary = Summary::default();
    let mut in_flight = 0usize;
    let started = Instant::now();

    for _ in 0..args.total_ios {
        if in_flight >= args.queue_depth {
            let completed = rx.recv().context("completion channel closed")?;
            summary.record(&completed, args.io_size);
            in_flight -= 1;
        }

        let (kind, offset) = workload.next_io();
        let tx = tx.clone();
        let submitted = Instant::now();
        let callback = move |r: i64, _: IoOutput| {
            // the receiver outlives every request
            let _ = tx.send(Completed {
                kind,
                r,
                latency: submitted.elapsed(),
            });
        };
        match kind {
            IoKind::Read => image.aio_read(offset, args.io_size, callback),
            IoKind::Write => image.aio_write(offset, payload.clone(), callback),
        }
        in_flight += 1;
    }
    while in_flight > 0 {
        let completed = rx.recv().context("completion channel closed")?;
        summary.record(&completed, args.io_size);
        in_flight -= 1;
    }

    let flushed = SaferCond::new();
    let on_flushed = flushed.context();
    image.aio_flush(move |r, _| on_flushed.complete(i32::try_from(r).unwrap_or(i32::MIN)));
    let r = flushed.wait();
    if r < 0 {
        bail!("flush failed: {r}");
    }
    let elapsed = started.elapsed();

    summary.report(elapsed, image.dispatcher().io_stats());

    let r = image.close();
    if r < 0 {
        bail!("close failed: {r}");
    }
    info!("Bench complete");
    Ok(())
}
