//! rbdio Common Library
//!
//! Shared types, error handling and configuration used by the image I/O
//! pipeline, the object backend client and the tooling built on top of them.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheOptions, EngineOptions, ImageOptions, QosLimit, QosOptions};
pub use error::{Error, Result};
pub use types::{
    Extent, Extents, ImageArea, IoOperations, NOSNAP, QosFlags, SnapId, SnapshotDelta,
    SnapshotExtent, SnapshotExtentState,
};
