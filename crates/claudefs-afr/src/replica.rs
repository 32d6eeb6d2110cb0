//! Replica handles and the per-transaction replica set snapshot.
//!
//! Every replica is reached through the single `Replica::invoke` capability.
//! The transport behind it (RPC, RDMA, in-process) is not this crate's
//! concern; `ReplicaHandle` wraps the raw capability with typed helpers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{AfrError, ReplicaError, Result};
use crate::types::{InodeId, LockOwner, LockTarget, ReplicaId};

/// Opaque filesystem operation forwarded to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FopRequest {
    /// Operation name as understood by the replica (e.g. "writev", "unlink").
    pub op: String,
    /// Inode the operation applies to.
    pub inode: InodeId,
    /// Encoded operation arguments.
    pub args: Vec<u8>,
}

impl FopRequest {
    /// Creates a new fop request.
    pub fn new(op: &str, inode: InodeId, args: Vec<u8>) -> Self {
        Self {
            op: op.to_string(),
            inode,
            args,
        }
    }
}

/// A request understood by every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRequest {
    /// Take a lock on behalf of `owner`. Non-blocking on the replica side.
    Lock {
        /// What to lock.
        target: LockTarget,
        /// Who holds it.
        owner: LockOwner,
    },
    /// Drop a lock. Unlocking something not held succeeds.
    Unlock {
        /// What to unlock.
        target: LockTarget,
        /// Who held it.
        owner: LockOwner,
    },
    /// Read one extended attribute.
    GetXattr {
        /// Inode to read from.
        inode: InodeId,
        /// Attribute key.
        key: String,
    },
    /// Write one extended attribute atomically.
    SetXattr {
        /// Inode to write to.
        inode: InodeId,
        /// Attribute key.
        key: String,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// Execute a filesystem operation.
    Fop(FopRequest),
}

/// A replica's answer to a `ReplicaRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaReply {
    /// Lock, unlock or setxattr completed.
    Done,
    /// Value of the requested attribute, None if absent.
    Xattr(Option<Vec<u8>>),
    /// Result payload of a fop.
    Fop(Vec<u8>),
}

/// The capability every replica endpoint exposes.
#[async_trait]
pub trait Replica: Send + Sync {
    /// Sends one request and waits for its reply.
    async fn invoke(&self, request: ReplicaRequest) -> std::result::Result<ReplicaReply, ReplicaError>;
}

/// A replica endpoint together with its position and name in the set.
#[derive(Clone)]
pub struct ReplicaHandle {
    id: ReplicaId,
    name: String,
    client: Arc<dyn Replica>,
}

impl fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

fn unexpected(reply: ReplicaReply) -> ReplicaError {
    ReplicaError::Protocol(format!("{:?}", reply))
}

impl ReplicaHandle {
    /// Creates a handle for replica `id` named `name`.
    pub fn new(id: ReplicaId, name: &str, client: Arc<dyn Replica>) -> Self {
        Self {
            id,
            name: name.to_string(),
            client,
        }
    }

    /// Position of this replica in the set.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Configured name of this replica.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a raw request.
    pub async fn invoke(&self, request: ReplicaRequest) -> std::result::Result<ReplicaReply, ReplicaError> {
        self.client.invoke(request).await
    }

    /// Requests a lock on this replica.
    pub async fn lock(&self, target: &LockTarget, owner: LockOwner) -> std::result::Result<(), ReplicaError> {
        match self
            .invoke(ReplicaRequest::Lock {
                target: target.clone(),
                owner,
            })
            .await?
        {
            ReplicaReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Releases a lock on this replica.
    pub async fn unlock(&self, target: &LockTarget, owner: LockOwner) -> std::result::Result<(), ReplicaError> {
        match self
            .invoke(ReplicaRequest::Unlock {
                target: target.clone(),
                owner,
            })
            .await?
        {
            ReplicaReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Reads an attribute; `Ok(None)` when it does not exist.
    pub async fn get_xattr(&self, inode: InodeId, key: &str) -> std::result::Result<Option<Vec<u8>>, ReplicaError> {
        match self
            .invoke(ReplicaRequest::GetXattr {
                inode,
                key: key.to_string(),
            })
            .await?
        {
            ReplicaReply::Xattr(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Writes an attribute.
    pub async fn set_xattr(&self, inode: InodeId, key: &str, value: Vec<u8>) -> std::result::Result<(), ReplicaError> {
        match self
            .invoke(ReplicaRequest::SetXattr {
                inode,
                key: key.to_string(),
                value,
            })
            .await?
        {
            ReplicaReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Executes a fop and returns its reply payload.
    pub async fn fop(&self, request: FopRequest) -> std::result::Result<Vec<u8>, ReplicaError> {
        match self.invoke(ReplicaRequest::Fop(request)).await? {
            ReplicaReply::Fop(payload) => Ok(payload),
            other => Err(unexpected(other)),
        }
    }
}

/// Snapshot of the replica set taken when a transaction starts.
///
/// The `up` vector is frozen for the lifetime of the transaction; changes
/// made by the surrounding framework are seen by later transactions only.
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    pub(crate) handles: Arc<Vec<ReplicaHandle>>,
    pub(crate) up: Vec<bool>,
}

impl ReplicaSet {
    /// Builds a snapshot; `up` must have one entry per handle.
    pub fn new(handles: Arc<Vec<ReplicaHandle>>, up: Vec<bool>) -> Result<Self> {
        if handles.len() != up.len() {
            return Err(AfrError::Config {
                msg: format!(
                    "liveness vector has {} entries for {} replicas",
                    up.len(),
                    handles.len()
                ),
            });
        }
        Ok(Self { handles, up })
    }

    /// Number of configured replicas.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if the set has no replicas.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns true if replica `index` was up when the snapshot was taken.
    pub fn is_up(&self, index: usize) -> bool {
        self.up.get(index).copied().unwrap_or(false)
    }

    /// The frozen liveness vector.
    pub fn up(&self) -> &[bool] {
        &self.up
    }

    /// Number of replicas that were up.
    pub fn up_count(&self) -> usize {
        self.up.iter().filter(|u| **u).count()
    }

    /// Handle of replica `index`.
    pub fn handle(&self, index: usize) -> &ReplicaHandle {
        &self.handles[index]
    }

    /// All handles in set order.
    pub fn handles(&self) -> &[ReplicaHandle] {
        &self.handles
    }

    /// Replica names in set order.
    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name().to_string()).collect()
    }
}
