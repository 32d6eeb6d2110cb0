//! In-process replica used for testing and single-node deployments.
//!
//! Holds extended attributes and replica-side locks in memory and supports
//! fault injection. Only the attribute map is durable: `snapshot`/`restore`
//! serialize it with bincode to model a process restart, while locks and
//! the fop log are lost, as they would be on a real crash.
//!
//! Locks are leases: a lock older than the lease no longer excludes other
//! owners, so a client that vanishes without unlocking cannot block an
//! inode forever.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ReplicaError;
use crate::replica::{FopRequest, Replica, ReplicaReply, ReplicaRequest};
use crate::types::{InodeId, LockOwner, LockScope, LockTarget};

/// How the replica responds to fops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FopFault {
    /// Apply the fop normally.
    #[default]
    None,
    /// Reject the fop with the given errno.
    Errno(i32),
    /// Fail at the transport level.
    Unreachable,
    /// Never answer.
    Hang,
}

/// Default lifetime of a replica-side lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);

/// Call counters, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReplicaStats {
    /// Locks granted.
    pub locks_granted: u64,
    /// Lock requests refused because of a conflict.
    pub lock_conflicts: u64,
    /// Unlock requests received.
    pub unlocks: u64,
    /// Successful setxattr calls.
    pub xattr_writes: u64,
    /// Fops applied.
    pub fops_applied: u64,
    /// Locks dropped because their lease ran out.
    pub leases_expired: u64,
}

struct HeldLock {
    scope: LockScope,
    owner: LockOwner,
    granted_at: Instant,
}

#[derive(Default)]
struct ReplicaState {
    xattrs: BTreeMap<(u64, String), Vec<u8>>,
    locks: HashMap<InodeId, Vec<HeldLock>>,
    fop_log: Vec<FopRequest>,
    stats: MemoryReplicaStats,
}

#[derive(Default, Clone, Copy)]
struct Faults {
    unreachable: bool,
    fop: FopFault,
    fop_delay: Option<Duration>,
    lock_reply_delay: Option<Duration>,
    setxattr_budget: Option<usize>,
}

/// A replica living entirely in process memory.
pub struct MemoryReplica {
    name: String,
    state: Mutex<ReplicaState>,
    faults: Mutex<Faults>,
    lock_lease: Mutex<Duration>,
}

impl MemoryReplica {
    /// Creates an empty replica.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ReplicaState::default()),
            faults: Mutex::new(Faults::default()),
            lock_lease: Mutex::new(DEFAULT_LOCK_LEASE),
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes the durable attribute state.
    pub fn snapshot(&self) -> Result<Vec<u8>, ReplicaError> {
        let state = self.state.lock().map_err(poisoned)?;
        let entries: Vec<(u64, String, Vec<u8>)> = state
            .xattrs
            .iter()
            .map(|((ino, key), value)| (*ino, key.clone(), value.clone()))
            .collect();
        bincode::serialize(&entries).map_err(|e| ReplicaError::AttrStore(e.to_string()))
    }

    /// Rebuilds a replica from a snapshot, as after a restart.
    pub fn restore(name: &str, snapshot: &[u8]) -> Result<Self, ReplicaError> {
        let entries: Vec<(u64, String, Vec<u8>)> =
            bincode::deserialize(snapshot).map_err(|e| ReplicaError::AttrStore(e.to_string()))?;
        let replica = Self::new(name);
        {
            let mut state = replica.state.lock().map_err(poisoned)?;
            for (ino, key, value) in entries {
                state.xattrs.insert((ino, key), value);
            }
        }
        Ok(replica)
    }

    /// Makes every request fail as unreachable (or restores reachability).
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unreachable = unreachable;
        }
    }

    /// Sets how fops are answered.
    pub fn set_fop_fault(&self, fault: FopFault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fop = fault;
        }
    }

    /// Delays every fop by `delay` before applying it.
    pub fn set_fop_delay(&self, delay: Option<Duration>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fop_delay = delay;
        }
    }

    /// Grants locks but answers lock requests only after `delay`, as when
    /// the reply is slow on the wire.
    pub fn set_lock_reply_delay(&self, delay: Option<Duration>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.lock_reply_delay = delay;
        }
    }

    /// Sets how long a granted lock excludes other owners.
    pub fn set_lock_lease(&self, lease: Duration) {
        if let Ok(mut current) = self.lock_lease.lock() {
            *current = lease;
        }
    }

    /// Lets only `budget` more setxattr calls succeed; None removes the limit.
    pub fn set_setxattr_budget(&self, budget: Option<usize>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.setxattr_budget = budget;
        }
    }

    /// Reads an attribute directly, bypassing fault injection.
    pub fn xattr(&self, inode: InodeId, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.xattrs.get(&(inode.as_u64(), key.to_string())).cloned())
    }

    /// Locks currently held on `inode`.
    pub fn held_locks(&self, inode: InodeId) -> Vec<(LockScope, LockOwner)> {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.locks
                    .get(&inode)
                    .map(|held| held.iter().map(|l| (l.scope.clone(), l.owner)).collect())
            })
            .unwrap_or_default()
    }

    /// Fops applied so far, in order.
    pub fn fop_log(&self) -> Vec<FopRequest> {
        self.state
            .lock()
            .map(|s| s.fop_log.clone())
            .unwrap_or_default()
    }

    /// Call counters.
    pub fn stats(&self) -> MemoryReplicaStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }

    fn current_faults(&self) -> Result<Faults, ReplicaError> {
        let faults = self.faults.lock().map_err(poisoned)?;
        Ok(*faults)
    }

    fn take_setxattr_budget(&self) -> Result<bool, ReplicaError> {
        let mut faults = self.faults.lock().map_err(poisoned)?;
        match faults.setxattr_budget {
            None => Ok(true),
            Some(0) => Ok(false),
            Some(n) => {
                faults.setxattr_budget = Some(n - 1);
                Ok(true)
            }
        }
    }

    fn lock(&self, target: LockTarget, owner: LockOwner) -> Result<ReplicaReply, ReplicaError> {
        let lease = *self.lock_lease.lock().map_err(poisoned)?;
        let now = Instant::now();
        let mut state = self.state.lock().map_err(poisoned)?;
        let held = state.locks.entry(target.inode).or_default();

        let before = held.len();
        held.retain(|l| now.duration_since(l.granted_at) < lease);
        let expired = (before - held.len()) as u64;
        if expired > 0 {
            tracing::warn!(
                replica = %self.name,
                inode = %target.inode,
                expired,
                "lock lease expired"
            );
        }

        let renewal = held
            .iter()
            .position(|l| l.owner == owner && l.scope == target.scope);
        let outcome = if let Some(i) = renewal {
            held[i].granted_at = now;
            Ok(false)
        } else if held
            .iter()
            .any(|l| l.owner != owner && l.scope.conflicts_with(&target.scope))
        {
            Err(ReplicaError::LockConflict)
        } else {
            held.push(HeldLock {
                scope: target.scope,
                owner,
                granted_at: now,
            });
            Ok(true)
        };

        state.stats.leases_expired += expired;
        match outcome {
            Ok(granted) => {
                if granted {
                    state.stats.locks_granted += 1;
                }
                Ok(ReplicaReply::Done)
            }
            Err(e) => {
                state.stats.lock_conflicts += 1;
                Err(e)
            }
        }
    }

    fn unlock(&self, target: LockTarget, owner: LockOwner) -> Result<ReplicaReply, ReplicaError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state.stats.unlocks += 1;
        if let Some(held) = state.locks.get_mut(&target.inode) {
            held.retain(|l| !(l.owner == owner && l.scope == target.scope));
            if held.is_empty() {
                state.locks.remove(&target.inode);
            }
        }
        Ok(ReplicaReply::Done)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> ReplicaError {
    ReplicaError::AttrStore("replica state lock poisoned".to_string())
}

#[async_trait]
impl Replica for MemoryReplica {
    async fn invoke(&self, request: ReplicaRequest) -> Result<ReplicaReply, ReplicaError> {
        let faults = self.current_faults()?;
        if faults.unreachable {
            return Err(ReplicaError::Unreachable);
        }

        match request {
            ReplicaRequest::Lock { target, owner } => {
                let reply = self.lock(target, owner);
                if let Some(delay) = faults.lock_reply_delay {
                    tokio::time::sleep(delay).await;
                }
                reply
            }
            ReplicaRequest::Unlock { target, owner } => self.unlock(target, owner),
            ReplicaRequest::GetXattr { inode, key } => {
                let state = self.state.lock().map_err(poisoned)?;
                Ok(ReplicaReply::Xattr(
                    state.xattrs.get(&(inode.as_u64(), key)).cloned(),
                ))
            }
            ReplicaRequest::SetXattr { inode, key, value } => {
                if !self.take_setxattr_budget()? {
                    return Err(ReplicaError::AttrStore(format!(
                        "{}: write of {} refused",
                        self.name, key
                    )));
                }
                let mut state = self.state.lock().map_err(poisoned)?;
                state.xattrs.insert((inode.as_u64(), key), value);
                state.stats.xattr_writes += 1;
                Ok(ReplicaReply::Done)
            }
            ReplicaRequest::Fop(fop) => {
                if let Some(delay) = faults.fop_delay {
                    tokio::time::sleep(delay).await;
                }
                match faults.fop {
                    FopFault::None => {}
                    FopFault::Errno(code) => return Err(ReplicaError::Errno(code)),
                    FopFault::Unreachable => return Err(ReplicaError::Unreachable),
                    FopFault::Hang => std::future::pending::<()>().await,
                }
                let mut state = self.state.lock().map_err(poisoned)?;
                state.fop_log.push(fop);
                state.stats.fops_applied += 1;
                Ok(ReplicaReply::Fop(Vec::new()))
            }
        }
    }
}
