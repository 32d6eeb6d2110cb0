//! Reads and updates the pending changelog stored on replicas.
//!
//! Each update is a read-modify-write of the single changelog attribute of
//! one inode on one replica. Transactions on disjoint ranges of one inode
//! hold their locks together, so updates of the same inode are serialized
//! through a per-inode gate.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::ReplicaError;
use crate::fanout::{call_all, with_timeout};
use crate::pending::{PendingCodec, PendingMatrix, ReplicaDelta, WriteSet};
use crate::replica::{ReplicaHandle, ReplicaSet};
use crate::types::InodeId;

/// Outcome of applying a write-set.
#[derive(Debug, Clone)]
pub struct ChangelogWrite {
    /// Result per written replica; replicas without a delta are absent.
    pub results: Vec<(usize, Result<PendingMatrix, ReplicaError>)>,
}

impl ChangelogWrite {
    /// Replicas whose write became durable.
    pub fn succeeded(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(i, _)| *i)
            .collect()
    }

    /// Replicas whose write failed, with the error.
    pub fn failed(&self) -> Vec<(usize, ReplicaError)> {
        self.results
            .iter()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (*i, e.clone())))
            .collect()
    }
}

/// Changelog access for one replica set.
///
/// Clones share the update gates.
#[derive(Debug, Clone)]
pub struct Changelog {
    codec: PendingCodec,
    call_timeout: Duration,
    gates: Arc<DashMap<InodeId, Arc<Mutex<()>>>>,
}

impl Changelog {
    /// Creates a changelog accessor.
    pub fn new(codec: PendingCodec, call_timeout: Duration) -> Self {
        Self {
            codec,
            call_timeout,
            gates: Arc::new(DashMap::new()),
        }
    }

    /// The codec in use.
    pub fn codec(&self) -> &PendingCodec {
        &self.codec
    }

    /// Timeout of each replica call.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Reads the matrix of `inode` as stored on `handle`.
    pub async fn read(&self, handle: &ReplicaHandle, inode: InodeId) -> Result<PendingMatrix, ReplicaError> {
        let owner = handle.id().index();
        let value = with_timeout(self.call_timeout, handle.get_xattr(inode, self.codec.key())).await?;
        self.codec
            .decode(owner, value.as_deref())
            .map_err(|e| ReplicaError::AttrStore(e.to_string()))
    }

    /// Applies every delta of `ws` concurrently and waits for all of them.
    pub async fn apply(&self, set: &ReplicaSet, ws: &WriteSet) -> ChangelogWrite {
        if ws.is_empty() {
            return ChangelogWrite {
                results: Vec::new(),
            };
        }
        let gate = self.gates.entry(ws.inode).or_default().clone();
        let guard = gate.lock().await;

        let targets: Vec<usize> = ws.deltas.iter().map(|d| d.replica).collect();
        let results = call_all(&targets, self.call_timeout, |i| {
            let handle = set.handle(i);
            let delta = ws.delta_for(i);
            async move {
                match delta {
                    Some(delta) => self.update(handle, ws.inode, delta).await,
                    None => Err(ReplicaError::Protocol("no delta".to_string())),
                }
            }
        })
        .await;

        drop(guard);
        self.gates
            .remove_if(&ws.inode, |_, g| Arc::strong_count(g) == 2);

        for (i, result) in &results {
            if let Err(e) = result {
                tracing::warn!(
                    inode = %ws.inode,
                    replica = set.handle(*i).name(),
                    error = %e,
                    "changelog update failed"
                );
            }
        }

        ChangelogWrite { results }
    }

    async fn update(
        &self,
        handle: &ReplicaHandle,
        inode: InodeId,
        delta: &ReplicaDelta,
    ) -> Result<PendingMatrix, ReplicaError> {
        let owner = handle.id().index();
        let current = handle.get_xattr(inode, self.codec.key()).await?;
        let mut matrix = self
            .codec
            .decode(owner, current.as_deref())
            .map_err(|e| ReplicaError::AttrStore(e.to_string()))?;
        matrix.apply(delta);
        handle
            .set_xattr(inode, self.codec.key(), self.codec.encode(&matrix))
            .await?;
        Ok(matrix)
    }
}
