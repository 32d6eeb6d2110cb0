//! Quorum evaluation over per-replica outcomes.

use serde::{Deserialize, Serialize};

use crate::fanout::ReplicaOutcome;
use crate::types::ReplicaId;

/// How many replicas must succeed for a transaction to count as applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuorumPolicy {
    /// Strict majority of the configured set: `N / 2 + 1`.
    Majority,
    /// Every replica that was up at dispatch time.
    AllUp,
    /// A fixed number of replicas.
    Fixed(usize),
}

impl QuorumPolicy {
    /// Number of successes required for a set of `set_size` replicas of
    /// which `up_count` were reachable when the step was issued.
    pub fn required(&self, set_size: usize, up_count: usize) -> usize {
        match *self {
            QuorumPolicy::Majority => set_size / 2 + 1,
            QuorumPolicy::AllUp => up_count.max(1),
            QuorumPolicy::Fixed(k) => k.clamp(1, set_size.max(1)),
        }
    }
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Majority
    }
}

/// Aggregate verdict for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumDecision {
    /// Every replica that was up succeeded.
    FullSuccess,
    /// Quorum met but the listed replicas failed and now lag behind.
    PartialSuccess(Vec<ReplicaId>),
    /// Not enough replicas succeeded.
    QuorumFailure {
        /// Successes counted.
        succeeded: usize,
        /// Successes required.
        required: usize,
    },
}

impl QuorumDecision {
    /// Returns true for full or partial success.
    pub fn is_success(&self) -> bool {
        !matches!(self, QuorumDecision::QuorumFailure { .. })
    }

    /// Replicas that need reconciliation after a partial success.
    pub fn lagging(&self) -> &[ReplicaId] {
        match self {
            QuorumDecision::PartialSuccess(lagging) => lagging,
            _ => &[],
        }
    }
}

/// Decides the transaction verdict from per-replica outcomes.
///
/// Skipped replicas were down at dispatch time and are excluded from both
/// the success and failure counts.
pub fn evaluate(outcomes: &[ReplicaOutcome], set_size: usize, policy: QuorumPolicy) -> QuorumDecision {
    let up_count = outcomes.iter().filter(|o| !o.is_skipped()).count();
    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let required = policy.required(set_size, up_count);

    if succeeded == 0 || succeeded < required {
        return QuorumDecision::QuorumFailure {
            succeeded,
            required,
        };
    }

    let failed: Vec<ReplicaId> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| o.is_error())
        .map(|(i, _)| ReplicaId::from(i))
        .collect();

    if failed.is_empty() {
        QuorumDecision::FullSuccess
    } else {
        QuorumDecision::PartialSuccess(failed)
    }
}
