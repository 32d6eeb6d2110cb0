//! Fan-out dispatch of one operation to every active replica.
//!
//! All calls of a step are issued together, one future per replica, and
//! the step completes only when every call has answered, failed or timed
//! out. Nothing short-circuits on the first failure.

use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ReplicaError;
use crate::replica::{FopRequest, ReplicaHandle, ReplicaSet};
use crate::types::{ByteRange, InodeId, TxnId, TxnType};

/// Result of one replica's part of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaOutcome {
    /// The replica applied the operation.
    Success,
    /// The replica failed or was not attempted for this transaction.
    Error(ReplicaError),
    /// The replica was down when the transaction started.
    Skipped,
}

impl ReplicaOutcome {
    /// Returns true for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, ReplicaOutcome::Success)
    }

    /// Returns true for `Error`.
    pub fn is_error(&self) -> bool {
        matches!(self, ReplicaOutcome::Error(_))
    }

    /// Returns true for `Skipped`.
    pub fn is_skipped(&self) -> bool {
        matches!(self, ReplicaOutcome::Skipped)
    }
}

/// Participation of one replica in the current transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaSlot {
    /// Down at transaction start.
    Down,
    /// Taking part.
    Active,
    /// Dropped out before the fop was sent (lock or pre-op failure).
    Failed(ReplicaError),
}

impl ReplicaSlot {
    /// Returns true for `Active`.
    pub fn is_active(&self) -> bool {
        matches!(self, ReplicaSlot::Active)
    }
}

/// What the body of a transaction is operating on.
#[derive(Debug, Clone)]
pub struct FopContext {
    /// Transaction the call belongs to.
    pub txn: TxnId,
    /// Transaction type.
    pub txn_type: TxnType,
    /// Target inode (the parent directory for entry operations).
    pub inode: InodeId,
    /// Byte range for data operations.
    pub range: Option<ByteRange>,
    /// Entry name for entry and create operations.
    pub name: Option<String>,
}

/// The caller-supplied per-replica action of a transaction.
#[async_trait]
pub trait TransactionBody: Send + Sync {
    /// Applies the operation on one replica.
    async fn apply(&self, replica: &ReplicaHandle, ctx: &FopContext) -> Result<(), ReplicaError>;
}

/// Body sending the same fop request to every replica.
#[derive(Debug, Clone)]
pub struct FopBody {
    request: FopRequest,
}

impl FopBody {
    /// Wraps a request.
    pub fn new(request: FopRequest) -> Self {
        Self { request }
    }
}

#[async_trait]
impl TransactionBody for FopBody {
    async fn apply(&self, replica: &ReplicaHandle, _ctx: &FopContext) -> Result<(), ReplicaError> {
        replica.fop(self.request.clone()).await.map(|_| ())
    }
}

/// Summary of one fan-out.
#[derive(Debug, Clone)]
pub struct FanoutSummary {
    /// Outcome per replica, in set order.
    pub outcomes: Vec<ReplicaOutcome>,
    /// Call latency per replica in microseconds, 0 when not called.
    pub latencies_us: Vec<u64>,
}

impl FanoutSummary {
    /// Number of replicas that succeeded.
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Number of replicas that failed.
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_error()).count()
    }
}

/// Issues the transaction body to all active replicas.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    call_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with the given per-call timeout.
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Runs `body` on every active slot and waits for all of them.
    ///
    /// Down slots come back `Skipped`, slots that dropped out earlier come
    /// back as their recorded error. A timed out call is `Error(Timeout)`;
    /// the replica's liveness is left untouched.
    pub async fn dispatch(
        &self,
        set: &ReplicaSet,
        slots: &[ReplicaSlot],
        body: &dyn TransactionBody,
        ctx: &FopContext,
    ) -> FanoutSummary {
        let active: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .map(|(i, _)| i)
            .collect();

        let results = join_all(active.iter().map(|&i| {
            let handle = set.handle(i);
            async move {
                let start = Instant::now();
                let result = with_timeout(self.call_timeout, body.apply(handle, ctx)).await;
                (i, result, start.elapsed().as_micros() as u64)
            }
        }))
        .await;

        let mut outcomes: Vec<ReplicaOutcome> = slots
            .iter()
            .map(|s| match s {
                ReplicaSlot::Down => ReplicaOutcome::Skipped,
                ReplicaSlot::Failed(e) => ReplicaOutcome::Error(e.clone()),
                ReplicaSlot::Active => ReplicaOutcome::Error(ReplicaError::Unreachable),
            })
            .collect();
        let mut latencies_us = vec![0; slots.len()];

        for (i, result, latency) in results {
            latencies_us[i] = latency;
            outcomes[i] = match result {
                Ok(()) => ReplicaOutcome::Success,
                Err(e) => {
                    tracing::debug!(txn = %ctx.txn, replica = i, error = %e, "fop failed on replica");
                    ReplicaOutcome::Error(e)
                }
            };
        }

        FanoutSummary {
            outcomes,
            latencies_us,
        }
    }
}

/// Runs `fut`, mapping an elapsed deadline to `ReplicaError::Timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, ReplicaError>
where
    F: Future<Output = Result<T, ReplicaError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReplicaError::Timeout),
    }
}

/// Calls `f` for every index concurrently and waits for all of them.
pub(crate) async fn call_all<T, F, Fut>(
    indices: &[usize],
    timeout: Duration,
    f: F,
) -> Vec<(usize, Result<T, ReplicaError>)>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, ReplicaError>>,
{
    join_all(indices.iter().map(|&i| {
        let fut = f(i);
        async move { (i, with_timeout(timeout, fut).await) }
    }))
    .await
}
