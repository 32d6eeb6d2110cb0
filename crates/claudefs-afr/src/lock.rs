//! Transaction locks: a local per-inode queue plus replica-side locks.
//!
//! Within one engine, overlapping targets are serialized by a FIFO queue
//! kept per inode, so transactions on different inodes never wait on each
//! other. Once the local slot is granted, the same target is locked on
//! every up replica and the lock counts only if a quorum granted it.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AfrError, ReplicaError, Result};
use crate::fanout::{call_all, ReplicaSlot};
use crate::replica::ReplicaSet;
use crate::types::{InodeId, LockOwner, LockScope, LockTarget, TxnId};

#[derive(Default)]
struct QueueState {
    held: Vec<(u64, LockScope)>,
    waiting: VecDeque<(u64, LockScope)>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.held.is_empty() && self.waiting.is_empty()
    }
}

/// Lock queue for one inode.
#[derive(Default)]
struct LockQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl LockQueue {
    /// Grants `ticket` if it conflicts with no holder and no earlier waiter.
    fn try_grant(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let pos = match state.waiting.iter().position(|(t, _)| *t == ticket) {
            Some(pos) => pos,
            None => return false,
        };
        let scope = &state.waiting[pos].1;
        let blocked = state.held.iter().any(|(_, s)| s.conflicts_with(scope))
            || state
                .waiting
                .iter()
                .take(pos)
                .any(|(_, s)| s.conflicts_with(scope));
        if blocked {
            return false;
        }
        if let Some(entry) = state.waiting.remove(pos) {
            state.held.push(entry);
        }
        true
    }

    fn cancel_wait(&self, ticket: u64) {
        self.state.lock().waiting.retain(|(t, _)| *t != ticket);
        self.notify.notify_waiters();
    }

    fn release(&self, ticket: u64) {
        self.state.lock().held.retain(|(t, _)| *t != ticket);
        self.notify.notify_waiters();
    }
}

/// In-process lock table, one FIFO queue per inode.
#[derive(Default)]
pub struct LockTable {
    queues: DashMap<InodeId, Arc<LockQueue>>,
    next_ticket: AtomicU64,
}

impl LockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `target` can be held exclusively or `deadline` passes.
    pub async fn lock_until(self: &Arc<Self>, target: &LockTarget, deadline: Instant) -> Result<LocalLockGuard> {
        let queue = self
            .queues
            .entry(target.inode)
            .or_default()
            .clone();
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        queue
            .state
            .lock()
            .waiting
            .push_back((ticket, target.scope.clone()));

        let mut waiter = Waiter {
            queue: &queue,
            ticket,
            granted: false,
        };

        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if queue.try_grant(ticket) {
                waiter.granted = true;
                return Ok(LocalLockGuard {
                    table: Arc::clone(self),
                    inode: target.inode,
                    ticket,
                });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(AfrError::LockTimeout {
                    inode: target.inode.as_u64(),
                });
            }
        }
    }

    /// Number of holders currently granted on `inode`.
    pub fn held_count(&self, inode: InodeId) -> usize {
        self.queues
            .get(&inode)
            .map(|q| q.state.lock().held.len())
            .unwrap_or(0)
    }

    /// Number of inodes with a live queue.
    pub fn active_inodes(&self) -> usize {
        self.queues.len()
    }

    fn release(&self, inode: InodeId, ticket: u64) {
        let queue = self.queues.get(&inode).map(|q| Arc::clone(q.value()));
        if let Some(queue) = queue {
            queue.release(ticket);
        }
        self.queues
            .remove_if(&inode, |_, q| Arc::strong_count(q) == 1 && q.state.lock().is_idle());
    }
}

/// Removes an abandoned waiter (timeout or cancellation) from its queue.
struct Waiter<'a> {
    queue: &'a Arc<LockQueue>,
    ticket: u64,
    granted: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.granted {
            self.queue.cancel_wait(self.ticket);
        }
    }
}

/// A granted slot in the local lock table, freed on drop.
pub struct LocalLockGuard {
    table: Arc<LockTable>,
    inode: InodeId,
    ticket: u64,
}

impl Drop for LocalLockGuard {
    fn drop(&mut self) {
        self.table.release(self.inode, self.ticket);
    }
}

/// Ownership of a transaction lock.
///
/// Release through `LockCoordinator::release`; dropping an unreleased token
/// frees the local slot but leaves replica locks to expire on their own.
pub struct LockToken {
    target: LockTarget,
    owner: LockOwner,
    requested: Vec<usize>,
    granted: Vec<usize>,
    local: Mutex<Option<LocalLockGuard>>,
    released: AtomicBool,
}

impl LockToken {
    /// What is locked.
    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    /// Owner identity presented to replicas.
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Replicas that granted the lock.
    pub fn granted(&self) -> &[usize] {
        &self.granted
    }

    /// Replicas the lock was requested from. A replica that timed out may
    /// still hold it, so release unlocks all of them.
    pub fn requested(&self) -> &[usize] {
        &self.requested
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::warn!(
                target_lock = %self.target,
                txn = %self.owner.txn,
                "lock token dropped without release"
            );
        }
    }
}

/// A successful acquisition: the token and each replica's participation.
pub struct LockAcquisition {
    /// The lock token.
    pub token: LockToken,
    /// Down, Active (granted) or Failed per replica.
    pub slots: Vec<ReplicaSlot>,
}

/// Timing parameters of the lock coordinator.
#[derive(Debug, Clone)]
pub struct LockTimeouts {
    /// Timeout of a single replica lock call.
    pub call_timeout: Duration,
    /// Total time an acquisition may take.
    pub lock_timeout: Duration,
    /// Base backoff between replica lock retries.
    pub retry_backoff: Duration,
}

/// Acquires and releases transaction locks across a replica set.
pub struct LockCoordinator {
    table: Arc<LockTable>,
    client_id: u64,
    timeouts: LockTimeouts,
}

impl LockCoordinator {
    /// Creates a coordinator for the engine identified by `client_id`.
    pub fn new(client_id: u64, timeouts: LockTimeouts) -> Self {
        Self {
            table: Arc::new(LockTable::new()),
            client_id,
            timeouts,
        }
    }

    /// The local lock table.
    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    /// Lock owner identity for transaction `txn`.
    pub fn owner(&self, txn: TxnId) -> LockOwner {
        LockOwner {
            client: self.client_id,
            txn,
        }
    }

    /// Locks `target` for `txn` on at least `required` up replicas.
    ///
    /// Waits in the local queue first, then asks every up replica. Replica
    /// conflicts are retried with jittered backoff until the lock timeout.
    /// Cancellation is honored at every wait point.
    pub async fn acquire(
        &self,
        set: &ReplicaSet,
        target: LockTarget,
        txn: TxnId,
        required: usize,
        cancel: &CancellationToken,
    ) -> Result<LockAcquisition> {
        let deadline = Instant::now() + self.timeouts.lock_timeout;
        let inode = target.inode.as_u64();
        let owner = self.owner(txn);

        let local = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AfrError::Cancelled),
            guard = self.table.lock_until(&target, deadline) => guard?,
        };

        let up: Vec<usize> = (0..set.len()).filter(|i| set.is_up(*i)).collect();
        if up.is_empty() {
            return Err(AfrError::ReplicaUnreachable);
        }

        let mut attempt: u32 = 0;
        loop {
            let results = call_all(&up, self.timeouts.call_timeout, |i| {
                let handle = set.handle(i);
                let target = &target;
                async move { handle.lock(target, owner).await }
            })
            .await;

            let granted: Vec<usize> = results
                .iter()
                .filter(|(_, r)| r.is_ok())
                .map(|(i, _)| *i)
                .collect();

            if granted.len() >= required {
                let mut slots = vec![ReplicaSlot::Down; set.len()];
                for (i, result) in results {
                    slots[i] = match result {
                        Ok(()) => ReplicaSlot::Active,
                        Err(e) => {
                            tracing::warn!(
                                txn = %txn,
                                replica = set.handle(i).name(),
                                error = %e,
                                "replica excluded: lock not granted"
                            );
                            ReplicaSlot::Failed(e)
                        }
                    };
                }
                tracing::debug!(txn = %txn, target_lock = %target, granted = granted.len(), "lock acquired");
                return Ok(LockAcquisition {
                    token: LockToken {
                        target,
                        owner,
                        requested: up,
                        granted,
                        local: Mutex::new(Some(local)),
                        released: AtomicBool::new(false),
                    },
                    slots,
                });
            }

            // A timed out request may have been granted anyway.
            self.unlock_replicas(set, &target, owner, &up).await;

            let conflict = results
                .iter()
                .any(|(_, r)| matches!(r, Err(ReplicaError::LockConflict)));
            let unreachable = granted.is_empty()
                && results.iter().all(|(_, r)| {
                    matches!(r, Err(ReplicaError::Unreachable) | Err(ReplicaError::Timeout))
                });

            if unreachable {
                return Err(AfrError::ReplicaUnreachable);
            }
            if !conflict {
                return Err(AfrError::QuorumFailure {
                    succeeded: granted.len(),
                    required,
                });
            }

            let backoff = self.backoff(attempt);
            if Instant::now() + backoff >= deadline {
                return Err(AfrError::LockConflict { inode });
            }
            tracing::debug!(txn = %txn, attempt, backoff_ms = backoff.as_millis() as u64, "lock conflict, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AfrError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Releases `token` on every replica it was requested from, then locally.
    ///
    /// Idempotent and infallible: a second call does nothing, and replicas
    /// that cannot be reached are logged and left to expire the lock.
    pub async fn release(&self, set: &ReplicaSet, token: &LockToken) {
        if token.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(txn = %token.owner.txn, "lock already released");
            return;
        }
        self.unlock_replicas(set, &token.target, token.owner, &token.requested)
            .await;
        drop(token.local.lock().take());
        tracing::debug!(txn = %token.owner.txn, target_lock = %token.target, "lock released");
    }

    async fn unlock_replicas(&self, set: &ReplicaSet, target: &LockTarget, owner: LockOwner, replicas: &[usize]) {
        let results = call_all(replicas, self.timeouts.call_timeout, |i| {
            let handle = set.handle(i);
            async move { handle.unlock(target, owner).await }
        })
        .await;
        for (i, result) in results {
            if let Err(e) = result {
                tracing::warn!(
                    txn = %owner.txn,
                    replica = set.handle(i).name(),
                    error = %e,
                    "unlock failed, replica will expire the lock"
                );
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.timeouts.retry_backoff.as_millis() as u64;
        let capped = base.saturating_mul(1u64 << attempt.min(5));
        let jitter = if capped > 1 {
            rand::thread_rng().gen_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}
