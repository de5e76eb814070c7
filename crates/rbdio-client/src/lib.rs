//! rbdio Client - object backend collaborator
//!
//! The image pipeline only needs one capability from the cluster connection:
//! issue an object operation and get a completion back exactly once. This
//! crate defines that contract and ships an in-memory implementation used by
//! tests and the bench tool.

pub mod backend;
pub mod mem;
pub mod op;

// Re-exports
pub use backend::{BackendError, ObjectBackend};
pub use mem::MemStore;
pub use op::{ObjectOp, OpCompletion, OpReply};
