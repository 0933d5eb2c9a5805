//! Errors raised while applying plans.

use std::time::Duration;

use thiserror::Error;

use fleet_rpc::RpcError;

/// Result type for applier operations.
pub type ApplierResult<T> = Result<T, ApplierError>;

#[derive(Debug, Error)]
pub enum ApplierError {
    /// The store did not reach the plan's snapshot index in time.
    #[error("timed out after {waited:?} waiting for index {index} (latest {latest})")]
    SnapshotTimeout {
        index: u64,
        latest: u64,
        waited: Duration,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("plan queue is closed")]
    QueueClosed,

    #[error("plan applier dropped the request")]
    ReplyDropped,
}

impl ApplierError {
    /// Returns true if resubmitting the same plan may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplierError::SnapshotTimeout { .. } => true,
            ApplierError::Rpc(err) => err.is_retryable(),
            ApplierError::QueueClosed | ApplierError::ReplyDropped => false,
        }
    }

    /// Returns true if the submitting worker no longer owns its evaluation.
    pub fn is_token_mismatch(&self) -> bool {
        matches!(self, ApplierError::Rpc(RpcError::EvalTokenMismatch))
    }
}
