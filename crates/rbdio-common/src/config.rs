//! Configuration types for rbdio
//!
//! Options are grouped per concern and deserialize with defaults for any
//! omitted field, so a partial file only overrides what it names.

use crate::error::{Error, Result};
use crate::types::{IoOperations, QosFlags};
use serde::{Deserialize, Serialize};

/// Per-image I/O options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// Object size as a power of two (22 = 4 MiB objects)
    pub object_order: u8,
    /// Re-post submitted requests onto the engine instead of routing them on
    /// the submitter's thread
    pub non_blocking_aio: bool,
    /// Open the image read-only
    pub read_only: bool,
    /// Rate limiting
    pub qos: QosOptions,
    /// Write-back cache
    pub cache: CacheOptions,
    /// Execution engine
    pub engine: EngineOptions,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            object_order: 22,
            non_blocking_aio: true,
            read_only: false,
            qos: QosOptions::default(),
            cache: CacheOptions::default(),
            engine: EngineOptions::default(),
        }
    }
}

impl ImageOptions {
    /// Object size in bytes
    pub fn object_size(&self) -> u64 {
        1u64 << self.object_order
    }

    /// Validate option ranges
    pub fn validate(&self) -> Result<()> {
        if !(12..=26).contains(&self.object_order) {
            return Err(Error::configuration(format!(
                "object_order {} outside 12..=26",
                self.object_order
            )));
        }
        if self.engine.threads == 0 {
            return Err(Error::configuration("engine.threads must be positive"));
        }
        self.qos.exclude_ops_mask()?;
        for (flag, limit) in self.qos.limits() {
            limit
                .validate()
                .map_err(|e| Error::configuration(format!("qos {flag:?}: {e}")))?;
        }
        Ok(())
    }
}

/// Limit for a single QoS throttle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosLimit {
    /// Sustained rate per second (0 = unlimited)
    pub limit: u64,
    /// Burst rate per second (0 = same as limit)
    pub burst: u64,
    /// How long the burst rate can be sustained
    pub burst_seconds: u64,
}

impl QosLimit {
    pub const fn new(limit: u64, burst: u64, burst_seconds: u64) -> Self {
        Self {
            limit,
            burst,
            burst_seconds,
        }
    }

    /// Check the limit is internally consistent
    pub fn validate(&self) -> Result<()> {
        if self.burst > 0 && self.burst < self.limit {
            return Err(Error::invalid_argument(format!(
                "burst {} is below limit {}",
                self.burst, self.limit
            )));
        }
        if self.burst > 0 && self.burst_seconds == 0 {
            return Err(Error::invalid_argument("burst_seconds must be positive"));
        }
        Ok(())
    }
}

/// Rate limiting options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QosOptions {
    pub iops: QosLimit,
    pub bps: QosLimit,
    pub read_iops: QosLimit,
    pub write_iops: QosLimit,
    pub read_bps: QosLimit,
    pub write_bps: QosLimit,
    /// Minimum refill tick of the throttles in milliseconds
    pub schedule_tick_min_ms: u64,
    /// Operation kinds that bypass rate limiting
    pub exclude_ops: Vec<String>,
}

impl Default for QosOptions {
    fn default() -> Self {
        Self {
            iops: QosLimit::default(),
            bps: QosLimit::default(),
            read_iops: QosLimit::default(),
            write_iops: QosLimit::default(),
            read_bps: QosLimit::default(),
            write_bps: QosLimit::default(),
            schedule_tick_min_ms: 50,
            exclude_ops: Vec::new(),
        }
    }
}

impl QosOptions {
    /// All throttle limits paired with their selector
    pub fn limits(&self) -> [(QosFlags, QosLimit); 6] {
        [
            (QosFlags::IOPS, self.iops),
            (QosFlags::BPS, self.bps),
            (QosFlags::READ_IOPS, self.read_iops),
            (QosFlags::WRITE_IOPS, self.write_iops),
            (QosFlags::READ_BPS, self.read_bps),
            (QosFlags::WRITE_BPS, self.write_bps),
        ]
    }

    /// Parsed exclusion mask
    pub fn exclude_ops_mask(&self) -> Result<IoOperations> {
        IoOperations::from_names(&self.exclude_ops)
    }

    /// Check if any throttle is configured
    pub fn has_limits(&self) -> bool {
        self.limits().iter().any(|(_, l)| l.limit > 0)
    }
}

/// Write-back cache options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Register the write-back cache stage
    pub enabled: bool,
    /// Dirty bytes held before writes force a writeback
    pub max_dirty: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_dirty: 24 * 1024 * 1024, // 24 MiB
        }
    }
}

/// Execution engine options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Worker threads of the shared runtime
    pub threads: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { threads: 2 }
    }
}
