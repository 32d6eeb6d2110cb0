//! Self-heal triggering.
//!
//! The engine never repairs data itself. When replicas diverge it emits a
//! `HealRequest` naming the lagging replicas, and a heal process consumes
//! the requests from a queue.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;

use crate::types::{InodeId, ReplicaId};

/// Why a heal was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealReason {
    /// A transaction finished with lagging replicas.
    PostOp,
    /// A recovery scan found leftover pending marks.
    RecoveryScan,
    /// A replica applied the operation but kept its pre-op marks, which
    /// now accuse the listed peers.
    StaleChangelog,
}

/// A request to bring lagging replicas of an inode up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealRequest {
    /// Volume the inode belongs to.
    pub volume: String,
    /// Inode to heal.
    pub inode: InodeId,
    /// Replicas that may be missing updates.
    pub lagging: Vec<ReplicaId>,
    /// What triggered the request.
    pub reason: HealReason,
}

/// Receives divergence notifications from the engine.
///
/// Called from the transaction path; implementations must not block.
pub trait HealNotifier: Send + Sync {
    /// Reports that `request.lagging` may hold stale data for `request.inode`.
    fn on_divergence(&self, request: HealRequest);
}

/// Notifier that drops every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHealNotifier;

impl HealNotifier for NoopHealNotifier {
    fn on_divergence(&self, request: HealRequest) {
        tracing::trace!(inode = %request.inode, "heal request discarded");
    }
}

/// Notifier feeding an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelHealNotifier {
    tx: mpsc::UnboundedSender<HealRequest>,
}

impl ChannelHealNotifier {
    /// Creates a notifier and the queue it feeds.
    pub fn new() -> (Self, HealQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, HealQueue { rx })
    }
}

impl HealNotifier for ChannelHealNotifier {
    fn on_divergence(&self, request: HealRequest) {
        if self.tx.send(request).is_err() {
            tracing::warn!("heal queue closed, request dropped");
        }
    }
}

/// Consumer side of a `ChannelHealNotifier`.
#[derive(Debug)]
pub struct HealQueue {
    rx: mpsc::UnboundedReceiver<HealRequest>,
}

impl HealQueue {
    /// Waits for the next request; `None` once every notifier is gone.
    pub async fn recv(&mut self) -> Option<HealRequest> {
        self.rx.recv().await
    }

    /// Takes everything queued right now without waiting.
    pub fn drain(&mut self) -> Vec<HealRequest> {
        let mut out = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            out.push(request);
        }
        out
    }

    /// Drains the queue, merging requests for the same volume and inode.
    ///
    /// Lagging sets are unioned; the reason of the first request wins.
    /// Output keeps first-seen order.
    pub fn drain_coalesced(&mut self) -> Vec<HealRequest> {
        let mut order: Vec<(String, InodeId)> = Vec::new();
        let mut merged: HashMap<(String, InodeId), (HealReason, BTreeSet<ReplicaId>)> = HashMap::new();
        for request in self.drain() {
            let key = (request.volume.clone(), request.inode);
            let entry = merged.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (request.reason, BTreeSet::new())
            });
            entry.1.extend(request.lagging);
        }
        order
            .into_iter()
            .filter_map(|key| {
                merged.remove(&key).map(|(reason, lagging)| HealRequest {
                    volume: key.0,
                    inode: key.1,
                    lagging: lagging.into_iter().collect(),
                    reason,
                })
            })
            .collect()
    }
}
