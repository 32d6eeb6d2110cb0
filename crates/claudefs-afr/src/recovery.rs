//! Recovery scan over leftover pending marks.
//!
//! After a restart the changelog is the only record of transactions that
//! never reached post-op. The scanner reads every reachable replica's view
//! of each inode and asks for a heal of every replica some view accuses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::changelog::Changelog;
use crate::fanout::call_all;
use crate::heal::{HealNotifier, HealReason, HealRequest};
use crate::pending::PendingMatrix;
use crate::replica::ReplicaSet;
use crate::types::{InodeId, PendingClass, ReplicaId};

/// Two replicas that each hold marks against the other in the same class.
///
/// Only a candidate: a crash between pre-op and post-op also leaves mutual
/// marks. Resolution is up to the heal process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBrainCandidate {
    /// Lower-indexed replica.
    pub a: ReplicaId,
    /// Higher-indexed replica.
    pub b: ReplicaId,
    /// Column both marks are in.
    pub class: PendingClass,
}

/// Scan result for one inode.
#[derive(Debug, Clone)]
pub struct InodeScan {
    /// Scanned inode.
    pub inode: InodeId,
    /// Changelog view per replica; `None` when it could not be read.
    pub views: Vec<Option<PendingMatrix>>,
    /// Replicas accused by at least one view.
    pub lagging: Vec<ReplicaId>,
    /// Pairs accusing each other.
    pub split_brain_candidates: Vec<SplitBrainCandidate>,
    /// Replicas that were down or failed the read.
    pub unscanned: Vec<ReplicaId>,
}

impl InodeScan {
    /// Returns true if no reachable replica holds a mark.
    pub fn is_clean(&self) -> bool {
        self.lagging.is_empty()
    }
}

/// Outcome of a scan over many inodes.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// One entry per scanned inode, in request order.
    pub scans: Vec<InodeScan>,
    /// Heal requests emitted.
    pub heal_requests: usize,
}

impl RecoveryReport {
    /// Inodes with at least one lagging replica.
    pub fn inodes_needing_heal(&self) -> Vec<InodeId> {
        self.scans
            .iter()
            .filter(|s| !s.is_clean())
            .map(|s| s.inode)
            .collect()
    }

    /// Scan entry for `inode`.
    pub fn scan_for(&self, inode: InodeId) -> Option<&InodeScan> {
        self.scans.iter().find(|s| s.inode == inode)
    }
}

/// Reads leftover marks and schedules heals.
pub struct RecoveryScanner {
    volume: String,
    set: ReplicaSet,
    changelog: Changelog,
    notifier: Arc<dyn HealNotifier>,
}

impl RecoveryScanner {
    /// Creates a scanner over `set`.
    pub fn new(volume: &str, set: ReplicaSet, changelog: Changelog, notifier: Arc<dyn HealNotifier>) -> Self {
        Self {
            volume: volume.to_string(),
            set,
            changelog,
            notifier,
        }
    }

    /// Scans `inodes` one after another, replicas in parallel.
    pub async fn scan(&self, inodes: &[InodeId]) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for &inode in inodes {
            let scan = self.scan_inode(inode).await;
            if !scan.lagging.is_empty() {
                tracing::info!(
                    volume = %self.volume,
                    inode = %inode,
                    lagging = ?scan.lagging,
                    "leftover pending marks, scheduling heal"
                );
                self.notifier.on_divergence(HealRequest {
                    volume: self.volume.clone(),
                    inode,
                    lagging: scan.lagging.clone(),
                    reason: HealReason::RecoveryScan,
                });
                report.heal_requests += 1;
            }
            for c in &scan.split_brain_candidates {
                tracing::warn!(
                    volume = %self.volume,
                    inode = %inode,
                    a = %c.a,
                    b = %c.b,
                    class = ?c.class,
                    "replicas accuse each other"
                );
            }
            report.scans.push(scan);
        }
        report
    }

    /// Scans one inode without notifying.
    pub async fn scan_inode(&self, inode: InodeId) -> InodeScan {
        let up: Vec<usize> = (0..self.set.len()).filter(|i| self.set.is_up(*i)).collect();
        let results = call_all(&up, self.changelog.call_timeout(), |i| {
            let handle = self.set.handle(i);
            async move { self.changelog.read(handle, inode).await }
        })
        .await;

        let mut views: Vec<Option<PendingMatrix>> = vec![None; self.set.len()];
        for (i, result) in results {
            match result {
                Ok(matrix) => views[i] = Some(matrix),
                Err(e) => tracing::warn!(
                    inode = %inode,
                    replica = self.set.handle(i).name(),
                    error = %e,
                    "changelog read failed during recovery"
                ),
            }
        }

        let lagging: BTreeSet<ReplicaId> = views
            .iter()
            .flatten()
            .flat_map(|m| m.accused())
            .collect();
        let unscanned = views
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| ReplicaId::from(i))
            .collect();

        InodeScan {
            inode,
            split_brain_candidates: mutual_accusations(&views),
            lagging: lagging.into_iter().collect(),
            unscanned,
            views,
        }
    }
}

fn mutual_accusations(views: &[Option<PendingMatrix>]) -> Vec<SplitBrainCandidate> {
    let mut out = Vec::new();
    for a in 0..views.len() {
        for b in (a + 1)..views.len() {
            let (Some(va), Some(vb)) = (&views[a], &views[b]) else {
                continue;
            };
            for class in PendingClass::ALL {
                if va.get(b, class) > 0 && vb.get(a, class) > 0 {
                    out.push(SplitBrainCandidate {
                        a: ReplicaId::from(a),
                        b: ReplicaId::from(b),
                        class,
                    });
                }
            }
        }
    }
    out
}
