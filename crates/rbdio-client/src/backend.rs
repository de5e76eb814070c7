//! Backend collaborator contract

use crate::op::{ObjectOp, OpCompletion};
use thiserror::Error;

/// Error raised while executing an object operation
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("compare mismatch in {oid} at {offset}")]
    Mismatch { oid: String, offset: u64 },

    #[error("injected failure: errno {0}")]
    Injected(i32),

    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

impl BackendError {
    /// Negated errno delivered to the operation's completion
    pub fn errno(&self) -> i32 {
        -match self {
            Self::ObjectNotFound(_) => libc::ENOENT,
            Self::Mismatch { .. } => libc::EILSEQ,
            Self::Injected(errno) => errno.abs(),
            Self::InvalidOp(_) => libc::EINVAL,
        }
    }
}

/// Issues object operations against the storage cluster
///
/// `aio_operate` must return without waiting for the operation and invoke
/// `on_finish` exactly once, possibly before it returns.
pub trait ObjectBackend: Send + Sync {
    fn aio_operate(&self, op: ObjectOp, on_finish: OpCompletion);
}
