//! The replicated transaction state machine.
//!
//! Every mutating operation on a replicated inode runs as one transaction:
//!
//! ```text
//! Init -> Locking -> PreOp -> Running -> PostOp -> Unlocking -> Done
//! ```
//!
//! PreOp marks every up replica pending on every writer before anything is
//! dispatched, so a crash mid-operation leaves evidence on disk. PostOp
//! clears the marks of replicas that applied the operation and leaves the
//! rest for self-heal. A failure at any step jumps forward to Unlocking;
//! the lock is always released.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::changelog::Changelog;
use crate::config::AfrConfig;
use crate::error::{AfrError, ReplicaError, Result};
use crate::fanout::{Dispatcher, FopContext, ReplicaOutcome, ReplicaSlot, TransactionBody};
use crate::heal::{HealNotifier, HealReason, HealRequest};
use crate::lock::{LockCoordinator, LockTimeouts};
use crate::metrics::{AfrMetrics, AfrMetricsSnapshot};
use crate::pending::{PeerResult, PendingCodec, PendingMatrix};
use crate::quorum::{self, QuorumDecision};
use crate::recovery::{RecoveryReport, RecoveryScanner};
use crate::replica::{Replica, ReplicaHandle, ReplicaSet};
use crate::types::{ByteRange, InodeId, LockScope, LockTarget, ReplicaId, TxnId, TxnType};

/// Step of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Created, nothing done yet.
    Init,
    /// Acquiring the transaction lock.
    Locking,
    /// Writing pending marks.
    PreOp,
    /// Dispatching the operation.
    Running,
    /// Resolving pending marks and evaluating quorum.
    PostOp,
    /// Releasing the lock.
    Unlocking,
    /// Finished.
    Done,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::Init => "init",
            TxnState::Locking => "locking",
            TxnState::PreOp => "pre-op",
            TxnState::Running => "running",
            TxnState::PostOp => "post-op",
            TxnState::Unlocking => "unlocking",
            TxnState::Done => "done",
        };
        f.write_str(s)
    }
}

/// What a transaction operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRequest {
    /// Transaction type.
    pub txn_type: TxnType,
    /// Target inode, or the parent directory for entry and create.
    pub inode: InodeId,
    /// Byte range, required for data transactions.
    pub range: Option<ByteRange>,
    /// Entry name, required for entry and create transactions.
    pub name: Option<String>,
}

impl TxnRequest {
    /// Content write on `range` of `inode`.
    pub fn data(inode: InodeId, range: ByteRange) -> Self {
        Self {
            txn_type: TxnType::Data,
            inode,
            range: Some(range),
            name: None,
        }
    }

    /// Attribute change on `inode`.
    pub fn metadata(inode: InodeId) -> Self {
        Self {
            txn_type: TxnType::Metadata,
            inode,
            range: None,
            name: None,
        }
    }

    /// Change of entry `name` in directory `parent`.
    pub fn entry(parent: InodeId, name: &str) -> Self {
        Self {
            txn_type: TxnType::Entry,
            inode: parent,
            range: None,
            name: Some(name.to_string()),
        }
    }

    /// Creation of `name` in directory `parent`.
    pub fn create(parent: InodeId, name: &str) -> Self {
        Self {
            txn_type: TxnType::Create,
            inode: parent,
            range: None,
            name: Some(name.to_string()),
        }
    }

    /// Checks that the request carries what its type needs.
    pub fn validate(&self) -> Result<()> {
        match self.txn_type {
            TxnType::Data if self.range.is_none() => Err(AfrError::InvalidRequest {
                msg: "data transaction without byte range".to_string(),
            }),
            TxnType::Entry | TxnType::Create
                if self.name.as_deref().map_or(true, str::is_empty) =>
            {
                Err(AfrError::InvalidRequest {
                    msg: format!("{} transaction without entry name", self.txn_type),
                })
            }
            _ => Ok(()),
        }
    }

    /// Lock needed for this request.
    pub fn lock_target(&self) -> LockTarget {
        let scope = match self.txn_type {
            TxnType::Data => LockScope::Range(self.range.unwrap_or_else(ByteRange::whole_file)),
            TxnType::Metadata => LockScope::Inode,
            TxnType::Entry | TxnType::Create => LockScope::Entry {
                name: self.name.clone(),
            },
        };
        LockTarget {
            inode: self.inode,
            scope,
        }
    }
}

/// Result of a transaction as seen by its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Applied on every replica that was up.
    Success,
    /// Applied on a quorum; the listed replicas did not apply it and were
    /// sent to heal.
    PartialSuccess(Vec<ReplicaId>),
    /// Not applied on a quorum.
    Failure(AfrError),
}

impl Outcome {
    /// Returns true for `Success` and `PartialSuccess`.
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failure(_))
    }

    /// Lagging replicas of a partial success.
    pub fn lagging(&self) -> &[ReplicaId] {
        match self {
            Outcome::PartialSuccess(lagging) => lagging,
            _ => &[],
        }
    }

    /// The failure reason, if any.
    pub fn error(&self) -> Option<&AfrError> {
        match self {
            Outcome::Failure(e) => Some(e),
            _ => None,
        }
    }
}

/// Full record of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionReport {
    /// Transaction id.
    pub txn: TxnId,
    /// The request as submitted.
    pub request: TxnRequest,
    /// States entered, in order.
    pub states: Vec<TxnState>,
    /// Per-replica outcome; empty if the transaction never got past locking.
    pub outcomes: Vec<ReplicaOutcome>,
    /// Fop latency per replica in microseconds.
    pub latencies_us: Vec<u64>,
    /// Quorum verdict over the dispatched operation, if it was dispatched.
    pub decision: Option<QuorumDecision>,
    /// Cancellation arrived after pre-op and was ignored.
    pub cancel_requested_late: bool,
    /// Replicas sent to heal.
    pub healed: Vec<ReplicaId>,
    /// Final outcome.
    pub outcome: Outcome,
}

impl TransactionReport {
    fn new(txn: TxnId, request: TxnRequest) -> Self {
        Self {
            txn,
            request,
            states: vec![TxnState::Init],
            outcomes: Vec::new(),
            latencies_us: Vec::new(),
            decision: None,
            cancel_requested_late: false,
            healed: Vec::new(),
            outcome: Outcome::Success,
        }
    }

    /// Returns true if the transaction entered `state`.
    pub fn visited(&self, state: TxnState) -> bool {
        self.states.contains(&state)
    }

    fn enter(&mut self, state: TxnState) {
        tracing::trace!(txn = %self.txn, state = %state, "transaction state");
        self.states.push(state);
    }
}

/// Runs replicated transactions for one volume.
///
/// Each transaction runs on its own task. A caller that stops waiting
/// before pre-op cancels it; after pre-op it still runs to `Done`, so marks
/// are resolved and the lock released.
pub struct TransactionEngine {
    core: Arc<EngineCore>,
}

struct EngineCore {
    config: AfrConfig,
    handles: Arc<Vec<ReplicaHandle>>,
    up: watch::Sender<Vec<bool>>,
    locks: LockCoordinator,
    changelog: Changelog,
    dispatcher: Dispatcher,
    notifier: Arc<dyn HealNotifier>,
    metrics: AfrMetrics,
    next_txn: AtomicU64,
}

impl TransactionEngine {
    /// Creates an engine over `replicas`, given in config order.
    ///
    /// All replicas start up. A `client_id` of 0 is replaced by a random id.
    pub fn new(config: AfrConfig, replicas: Vec<Arc<dyn Replica>>, notifier: Arc<dyn HealNotifier>) -> Result<Self> {
        config.validate()?;
        if replicas.len() != config.replica_count() {
            return Err(AfrError::Config {
                msg: format!(
                    "{} replica clients for {} configured replicas",
                    replicas.len(),
                    config.replica_count()
                ),
            });
        }

        let client_id = if config.client_id == 0 {
            rand::random::<u64>().max(1)
        } else {
            config.client_id
        };

        let handles: Vec<ReplicaHandle> = replicas
            .into_iter()
            .zip(config.replicas.iter())
            .enumerate()
            .map(|(i, (client, name))| ReplicaHandle::new(ReplicaId::from(i), name, client))
            .collect();
        let n = handles.len();

        let locks = LockCoordinator::new(
            client_id,
            LockTimeouts {
                call_timeout: config.call_timeout(),
                lock_timeout: config.lock_timeout(),
                retry_backoff: config.lock_retry_backoff(),
            },
        );
        let changelog = Changelog::new(PendingCodec::new(&config.xattr_prefix, n), config.call_timeout());
        let dispatcher = Dispatcher::new(config.call_timeout());
        let (up, _) = watch::channel(vec![true; n]);

        tracing::info!(
            volume = %config.volume,
            replicas = n,
            client_id,
            "transaction engine created"
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                config,
                handles: Arc::new(handles),
                up,
                locks,
                changelog,
                dispatcher,
                notifier,
                metrics: AfrMetrics::new(),
                next_txn: AtomicU64::new(1),
            }),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &AfrConfig {
        &self.core.config
    }

    /// Volume name.
    pub fn volume(&self) -> &str {
        &self.core.config.volume
    }

    /// Marks replica `index` up or down for transactions started from now on.
    pub fn set_replica_up(&self, index: usize, up: bool) -> Result<()> {
        if index >= self.core.handles.len() {
            return Err(AfrError::InvalidRequest {
                msg: format!("replica index {} out of range", index),
            });
        }
        let changed = self.core.up.send_if_modified(|v| {
            let changed = v[index] != up;
            v[index] = up;
            changed
        });
        if changed {
            tracing::info!(
                volume = %self.core.config.volume,
                replica = self.core.handles[index].name(),
                up,
                "replica liveness changed"
            );
        }
        Ok(())
    }

    /// Watches the up vector.
    pub fn subscribe_up(&self) -> watch::Receiver<Vec<bool>> {
        self.core.up.subscribe()
    }

    /// Current replica set with its up vector.
    pub fn replica_set(&self) -> ReplicaSet {
        self.core.replica_set()
    }

    /// Metric values.
    pub fn metrics(&self) -> AfrMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Metrics in Prometheus text format.
    pub fn format_metrics(&self) -> String {
        self.core.metrics.snapshot().format_prometheus(&self.core.config.volume)
    }

    /// Reads the pending matrix of `inode` stored on replica `index`.
    pub async fn read_pending(&self, index: usize, inode: InodeId) -> Result<PendingMatrix> {
        let handle = self.core.handles.get(index).ok_or_else(|| AfrError::InvalidRequest {
            msg: format!("replica index {} out of range", index),
        })?;
        self.core
            .changelog
            .read(handle, inode)
            .await
            .map_err(|e| AfrError::AttributeStore { msg: e.to_string() })
    }

    /// Runs a transaction and returns its outcome.
    pub async fn run_transaction(&self, request: TxnRequest, body: Arc<dyn TransactionBody>) -> Outcome {
        self.execute(request, body, None).await.outcome
    }

    /// Runs a transaction and returns its full report.
    ///
    /// `cancel` is honored until the lock is held; after that the
    /// transaction runs to completion and the late request is only recorded.
    /// Dropping the returned future counts as a cancellation.
    pub async fn execute(
        &self,
        request: TxnRequest,
        body: Arc<dyn TransactionBody>,
        cancel: Option<CancellationToken>,
    ) -> TransactionReport {
        let core = &self.core;
        let txn = TxnId::new(core.next_txn.fetch_add(1, Ordering::Relaxed));
        core.metrics.txn_started();
        tracing::debug!(
            volume = %core.config.volume,
            txn = %txn,
            txn_type = %request.txn_type,
            inode = %request.inode,
            "transaction started"
        );

        let cancel = cancel.map(|c| c.child_token()).unwrap_or_default();
        let _abandon = cancel.clone().drop_guard();
        let task = tokio::spawn({
            let core = Arc::clone(core);
            let request = request.clone();
            async move { core.execute(txn, request, body.as_ref(), cancel).await }
        });

        match task.await {
            Ok(report) => report,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                tracing::error!(txn = %txn, error = %e, "transaction task stopped");
                core.finish(TransactionReport::new(txn, request), Outcome::Failure(AfrError::Cancelled))
            }
        }
    }

    /// Scans `inodes` for leftover pending marks and schedules heals.
    pub async fn recover(&self, inodes: &[InodeId]) -> RecoveryReport {
        let core = &self.core;
        let scanner = RecoveryScanner::new(
            &core.config.volume,
            core.replica_set(),
            core.changelog.clone(),
            Arc::clone(&core.notifier),
        );
        let report = scanner.scan(inodes).await;
        core.metrics.heal_notifications(report.heal_requests as u64);
        report
    }
}

impl EngineCore {
    fn replica_set(&self) -> ReplicaSet {
        let up = self.up.borrow().clone();
        ReplicaSet {
            handles: Arc::clone(&self.handles),
            up,
        }
    }

    async fn execute(
        &self,
        txn: TxnId,
        request: TxnRequest,
        body: &dyn TransactionBody,
        cancel: CancellationToken,
    ) -> TransactionReport {
        let mut report = TransactionReport::new(txn, request.clone());
        let outcome = match self.prepare(&request, &cancel) {
            Err(e) => Outcome::Failure(e),
            Ok(()) => self.run(&mut report, &request, body, &cancel).await,
        };
        self.finish(report, outcome)
    }

    fn prepare(&self, request: &TxnRequest, cancel: &CancellationToken) -> Result<()> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Err(AfrError::Cancelled);
        }
        Ok(())
    }

    async fn run(
        &self,
        report: &mut TransactionReport,
        request: &TxnRequest,
        body: &dyn TransactionBody,
        cancel: &CancellationToken,
    ) -> Outcome {
        let txn = report.txn;
        let set = self.replica_set();
        let policy = self.config.quorum.policy_for(request.txn_type);
        let required = policy.required(set.len(), set.up_count());
        let class = request.txn_type.pending_class();

        report.enter(TxnState::Locking);
        let acquisition = match self
            .locks
            .acquire(&set, request.lock_target(), txn, required, cancel)
            .await
        {
            Ok(acquisition) => acquisition,
            Err(e) => {
                if e != AfrError::Cancelled {
                    self.metrics.lock_failure();
                }
                tracing::debug!(txn = %txn, error = %e, "lock not acquired");
                report.enter(TxnState::Unlocking);
                return Outcome::Failure(e);
            }
        };
        let token = acquisition.token;
        let mut slots = acquisition.slots;

        if cancel.is_cancelled() {
            report.enter(TxnState::Unlocking);
            self.locks.release(&set, &token).await;
            return Outcome::Failure(AfrError::Cancelled);
        }

        // Pre-op: marks cover every up replica, written on every lock holder.
        report.enter(TxnState::PreOp);
        let writers: Vec<bool> = slots.iter().map(ReplicaSlot::is_active).collect();
        let marked = set.up().to_vec();
        let marks = self
            .changelog
            .codec()
            .mark_pending(request.inode, class, &writers, &marked);
        let preop = self.changelog.apply(&set, &marks).await;

        let mut durable = writers.clone();
        let preop_failed = preop.failed();
        for (i, e) in &preop_failed {
            tracing::warn!(
                txn = %txn,
                replica = set.handle(*i).name(),
                error = %e,
                "pre-op mark failed, replica skipped"
            );
            durable[*i] = false;
            slots[*i] = ReplicaSlot::Failed(e.clone());
        }
        self.metrics.preop_downgrade(preop_failed.len() as u64);
        self.note_late_cancel(report, cancel);

        let active = slots.iter().filter(|s| s.is_active()).count();
        let preop_error = if active < required {
            tracing::error!(
                txn = %txn,
                active,
                required,
                "pre-op marks not durable on a quorum"
            );
            Some(AfrError::AttributeStore {
                msg: format!("pre-op durable on {} replicas, {} required", active, required),
            })
        } else {
            None
        };

        // Running.
        let outcomes = if preop_error.is_none() {
            report.enter(TxnState::Running);
            let ctx = FopContext {
                txn,
                txn_type: request.txn_type,
                inode: request.inode,
                range: request.range,
                name: request.name.clone(),
            };
            let summary = self.dispatcher.dispatch(&set, &slots, body, &ctx).await;
            report.latencies_us = summary.latencies_us;
            self.note_late_cancel(report, cancel);
            summary.outcomes
        } else {
            undispatched(&slots)
        };

        // Post-op.
        report.enter(TxnState::PostOp);
        let results = peer_results(&slots, &outcomes);
        let resolution = self.changelog.codec().resolve_pending(
            request.inode,
            class,
            &durable,
            &marked,
            &results,
        );
        let postop = self.changelog.apply(&set, &resolution).await;
        let postop_failed: Vec<usize> = postop.failed().into_iter().map(|(i, _)| i).collect();
        if !postop_failed.is_empty() {
            self.metrics.postop_write_failure(postop_failed.len() as u64);
            tracing::error!(txn = %txn, replicas = ?postop_failed, "post-op changelog write failed");
        }
        self.note_late_cancel(report, cancel);

        let outcome = match preop_error {
            Some(e) => Outcome::Failure(e),
            None => {
                let decision = quorum::evaluate(&outcomes, set.len(), policy);
                report.decision = Some(decision.clone());
                decide(&decision, &outcomes, &postop_failed, required)
            }
        };

        let lagging = heal_targets(&outcome, &outcomes);
        let accused = stale_accusations(&postop_failed, &marked);
        let mut healed: BTreeSet<ReplicaId> = BTreeSet::new();
        for (targets, reason) in [
            (lagging, HealReason::PostOp),
            (accused, HealReason::StaleChangelog),
        ] {
            if targets.is_empty() {
                continue;
            }
            healed.extend(targets.iter().copied());
            self.notifier.on_divergence(HealRequest {
                volume: self.config.volume.clone(),
                inode: request.inode,
                lagging: targets,
                reason,
            });
            self.metrics.heal_notifications(1);
        }
        report.healed = healed.into_iter().collect();
        report.outcomes = outcomes;

        report.enter(TxnState::Unlocking);
        self.locks.release(&set, &token).await;
        outcome
    }

    fn note_late_cancel(&self, report: &mut TransactionReport, cancel: &CancellationToken) {
        if cancel.is_cancelled() && !report.cancel_requested_late {
            report.cancel_requested_late = true;
            tracing::info!(txn = %report.txn, "cancellation after pre-op ignored");
        }
    }

    fn finish(&self, mut report: TransactionReport, outcome: Outcome) -> TransactionReport {
        report.enter(TxnState::Done);
        match &outcome {
            Outcome::Success => self.metrics.txn_full_success(),
            Outcome::PartialSuccess(_) => self.metrics.txn_partial_success(),
            Outcome::Failure(e) => {
                if *e == AfrError::Cancelled {
                    self.metrics.cancellation();
                }
                self.metrics.txn_failed();
            }
        }
        match &outcome {
            Outcome::Failure(e) => tracing::info!(
                volume = %self.config.volume,
                txn = %report.txn,
                inode = %report.request.inode,
                error = %e,
                "transaction failed"
            ),
            _ => tracing::info!(
                volume = %self.config.volume,
                txn = %report.txn,
                inode = %report.request.inode,
                lagging = ?outcome.lagging(),
                "transaction applied"
            ),
        }
        report.outcome = outcome;
        report
    }

}

/// Outcomes for a transaction that stopped before dispatch.
fn undispatched(slots: &[ReplicaSlot]) -> Vec<ReplicaOutcome> {
    slots
        .iter()
        .map(|s| match s {
            ReplicaSlot::Failed(e) => ReplicaOutcome::Error(e.clone()),
            _ => ReplicaOutcome::Skipped,
        })
        .collect()
}

/// Maps what happened on each replica to changelog resolution input.
///
/// Replicas that dropped out before dispatch definitely did not apply the
/// operation, whatever error removed them.
fn peer_results(slots: &[ReplicaSlot], outcomes: &[ReplicaOutcome]) -> Vec<PeerResult> {
    slots
        .iter()
        .zip(outcomes)
        .map(|(slot, outcome)| match (slot, outcome) {
            (ReplicaSlot::Down, _) => PeerResult::Down,
            (ReplicaSlot::Failed(_), _) => PeerResult::NotApplied,
            (ReplicaSlot::Active, ReplicaOutcome::Success) => PeerResult::Applied,
            (ReplicaSlot::Active, ReplicaOutcome::Error(e)) if e.is_definitive() => PeerResult::NotApplied,
            (ReplicaSlot::Active, ReplicaOutcome::Error(_)) => PeerResult::Unknown,
            (ReplicaSlot::Active, ReplicaOutcome::Skipped) => PeerResult::NotApplied,
        })
        .collect()
}

fn decide(
    decision: &QuorumDecision,
    outcomes: &[ReplicaOutcome],
    postop_failed: &[usize],
    required: usize,
) -> Outcome {
    if let QuorumDecision::QuorumFailure {
        succeeded,
        required,
    } = decision
    {
        return Outcome::Failure(quorum_error(outcomes, *succeeded, *required));
    }

    let durable = outcomes
        .iter()
        .enumerate()
        .filter(|(i, o)| o.is_success() && !postop_failed.contains(i))
        .count();
    if durable < required {
        return Outcome::Failure(AfrError::AttributeStore {
            msg: format!("post-op durable on {} replicas, {} required", durable, required),
        });
    }

    let lagging = decision.lagging();
    if lagging.is_empty() {
        Outcome::Success
    } else {
        Outcome::PartialSuccess(lagging.to_vec())
    }
}

/// A quorum failure where nothing applied and a replica gave an error code
/// surfaces that code.
fn quorum_error(outcomes: &[ReplicaOutcome], succeeded: usize, required: usize) -> AfrError {
    if succeeded == 0 {
        let code = outcomes.iter().find_map(|o| match o {
            ReplicaOutcome::Error(ReplicaError::Errno(code)) => Some(*code),
            _ => None,
        });
        if let Some(code) = code {
            return AfrError::OperationError { code };
        }
    }
    AfrError::QuorumFailure {
        succeeded,
        required,
    }
}

/// Replicas that did not apply the operation and need self-heal.
///
/// Partial successes heal their lagging replicas. A failure still heals
/// when some replica applied the operation, since those are now ahead.
fn heal_targets(outcome: &Outcome, outcomes: &[ReplicaOutcome]) -> Vec<ReplicaId> {
    match outcome {
        Outcome::Success => Vec::new(),
        Outcome::PartialSuccess(lagging) => lagging.clone(),
        Outcome::Failure(_) => {
            if !outcomes.iter().any(ReplicaOutcome::is_success) {
                return Vec::new();
            }
            let lagging: BTreeSet<ReplicaId> = outcomes
                .iter()
                .enumerate()
                .filter(|(_, o)| o.is_error())
                .map(|(i, _)| ReplicaId::from(i))
                .collect();
            lagging.into_iter().collect()
        }
    }
}

/// Peers accused by the pre-op marks left on replicas whose post-op write
/// failed. These match what a recovery scan would read back.
fn stale_accusations(postop_failed: &[usize], marked: &[bool]) -> Vec<ReplicaId> {
    let accused: BTreeSet<ReplicaId> = postop_failed
        .iter()
        .flat_map(|&writer| {
            marked
                .iter()
                .enumerate()
                .filter(move |(p, m)| **m && *p != writer)
                .map(|(p, _)| ReplicaId::from(p))
        })
        .collect();
    accused.into_iter().collect()
}
