//! Error types for the replicated transaction engine.

use thiserror::Error;

/// Errors surfaced by the transaction engine to its callers.
///
/// Per-replica failures never appear here directly; they are folded into
/// quorum evaluation and only the aggregate reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AfrError {
    /// No replica could be reached.
    #[error("no replica reachable")]
    ReplicaUnreachable,

    /// Another owner holds an overlapping lock on some replica.
    #[error("lock conflict on inode {inode}")]
    LockConflict {
        /// Inode whose lock could not be obtained.
        inode: u64,
    },

    /// Waiting for the lock exceeded the configured timeout.
    #[error("lock wait timed out on inode {inode}")]
    LockTimeout {
        /// Inode whose lock could not be obtained.
        inode: u64,
    },

    /// A replica returned an error code for the operation itself.
    #[error("operation failed with code {code}")]
    OperationError {
        /// Errno-style code reported by the replica.
        code: i32,
    },

    /// Fewer replicas than the quorum succeeded.
    #[error("quorum not met: {succeeded} succeeded, {required} required")]
    QuorumFailure {
        /// Number of replicas that succeeded.
        succeeded: usize,
        /// Number of replicas required by the policy.
        required: usize,
    },

    /// A pending-changelog write could not be made durable.
    #[error("attribute store error: {msg}")]
    AttributeStore {
        /// Description of the failure.
        msg: String,
    },

    /// The transaction was cancelled before any pending mark was written.
    #[error("transaction cancelled")]
    Cancelled,

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// A persisted changelog value could not be decoded.
    #[error("codec error: {msg}")]
    Codec {
        /// Description of the problem.
        msg: String,
    },

    /// The transaction request does not fit its type.
    #[error("invalid request: {msg}")]
    InvalidRequest {
        /// Description of the problem.
        msg: String,
    },
}

impl AfrError {
    /// Returns true if the caller may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AfrError::LockConflict { .. } | AfrError::LockTimeout { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, AfrError>;

/// Errors reported by a single replica call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    /// Transport-level failure: the replica could not be contacted.
    #[error("replica unreachable")]
    Unreachable,

    /// The call did not complete within the per-call timeout.
    #[error("replica call timed out")]
    Timeout,

    /// The replica refused a lock held by another owner.
    #[error("lock held by another owner")]
    LockConflict,

    /// The replica executed the call and returned an error code.
    #[error("replica returned errno {0}")]
    Errno(i32),

    /// The replica's attribute store rejected a read or write.
    #[error("attribute store: {0}")]
    AttrStore(String),

    /// The replica answered with a reply that does not match the request.
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

impl ReplicaError {
    /// Returns true when the replica definitely did not apply the operation.
    ///
    /// Timeouts and transport failures leave the outcome unknown.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            ReplicaError::Errno(_) | ReplicaError::LockConflict | ReplicaError::AttrStore(_)
        )
    }
}
