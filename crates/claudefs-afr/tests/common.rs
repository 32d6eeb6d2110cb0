//! Common fixtures for the transaction engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use claudefs_afr::{
    AfrConfig, ChannelHealNotifier, FopContext, FopRequest, HealQueue, InodeId, MemoryReplica,
    Replica, ReplicaError, ReplicaHandle, TransactionBody, TransactionEngine,
};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring RUST_LOG, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Timeouts short enough for tests.
pub fn test_config(volume: &str, n: usize) -> AfrConfig {
    let names: Vec<String> = (0..n).map(|i| format!("{}-r{}", volume, i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut config = AfrConfig::new(volume, &refs);
    config.call_timeout_ms = 500;
    config.lock_timeout_ms = 2_000;
    config.lock_retry_backoff_ms = 5;
    config
}

/// An engine over in-memory replicas plus the heal queue it feeds.
pub struct TestCluster {
    pub engine: Arc<TransactionEngine>,
    pub replicas: Vec<Arc<MemoryReplica>>,
    pub heal: HealQueue,
}

impl TestCluster {
    /// Cluster of `n` fresh replicas.
    pub fn new(volume: &str, n: usize) -> Self {
        Self::with_config(test_config(volume, n))
    }

    /// Cluster of fresh replicas named after `config`.
    pub fn with_config(config: AfrConfig) -> Self {
        let replicas = config
            .replicas
            .iter()
            .map(|name| Arc::new(MemoryReplica::new(name)))
            .collect();
        Self::from_replicas(config, replicas)
    }

    /// Cluster over existing replicas.
    pub fn from_replicas(config: AfrConfig, replicas: Vec<Arc<MemoryReplica>>) -> Self {
        init_tracing();
        let clients: Vec<Arc<dyn Replica>> = replicas
            .iter()
            .map(|r| r.clone() as Arc<dyn Replica>)
            .collect();
        let (notifier, heal) = ChannelHealNotifier::new();
        let engine = TransactionEngine::new(config, clients, Arc::new(notifier))
            .expect("valid test config");
        Self {
            engine: Arc::new(engine),
            replicas,
            heal,
        }
    }

    /// Simulates a restart: replicas are rebuilt from their durable state
    /// and a fresh engine is created over them.
    pub fn restart(&self) -> Self {
        let replicas = self
            .replicas
            .iter()
            .map(|r| {
                let snapshot = r.snapshot().expect("snapshot");
                Arc::new(MemoryReplica::restore(r.name(), &snapshot).expect("restore"))
            })
            .collect();
        Self::from_replicas(self.engine.config().clone(), replicas)
    }

    /// Pending cell `(peer, class)` as stored on replica `owner`.
    pub async fn pending(&self, owner: usize, inode: InodeId) -> claudefs_afr::PendingMatrix {
        self.engine
            .read_pending(owner, inode)
            .await
            .expect("read pending")
    }
}

/// Waits until no transaction of `engine` is in flight.
pub async fn wait_until_idle(engine: &TransactionEngine) {
    for _ in 0..300 {
        if engine.metrics().in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transactions still in flight: {}", engine.metrics().in_flight);
}

/// Plain write fop.
pub fn write_fop(inode: u64) -> Arc<claudefs_afr::FopBody> {
    Arc::new(claudefs_afr::FopBody::new(FopRequest::new(
        "writev",
        InodeId::new(inode),
        vec![0xab; 10],
    )))
}

/// Body that records when it runs on replica 0 and holds for `hold`.
///
/// Intervals let tests check that overlapping targets never run together.
pub struct IntervalBody {
    hold: Duration,
    epoch: Instant,
    intervals: Mutex<Vec<(String, u128, u128)>>,
}

impl IntervalBody {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            epoch: Instant::now(),
            intervals: Mutex::new(Vec::new()),
        }
    }

    /// Recorded `(label, start_us, end_us)` triples.
    pub fn intervals(&self) -> Vec<(String, u128, u128)> {
        self.intervals.lock().expect("intervals").clone()
    }
}

#[async_trait]
impl TransactionBody for IntervalBody {
    async fn apply(&self, replica: &ReplicaHandle, ctx: &FopContext) -> Result<(), ReplicaError> {
        if replica.id().index() != 0 {
            return replica
                .fop(FopRequest::new("writev", ctx.inode, Vec::new()))
                .await
                .map(|_| ());
        }
        let start = self.epoch.elapsed().as_micros();
        tokio::time::sleep(self.hold).await;
        let end = self.epoch.elapsed().as_micros();
        let label = match ctx.range {
            Some(r) => format!("{}@{}", ctx.txn, r),
            None => ctx.txn.to_string(),
        };
        self.intervals
            .lock()
            .expect("intervals")
            .push((label, start, end));
        replica
            .fop(FopRequest::new("writev", ctx.inode, Vec::new()))
            .await
            .map(|_| ())
    }
}

/// Body that cancels a token while running, then applies normally.
pub struct CancellingBody {
    pub token: tokio_util::sync::CancellationToken,
}

#[async_trait]
impl TransactionBody for CancellingBody {
    async fn apply(&self, replica: &ReplicaHandle, ctx: &FopContext) -> Result<(), ReplicaError> {
        self.token.cancel();
        replica
            .fop(FopRequest::new("setattr", ctx.inode, Vec::new()))
            .await
            .map(|_| ())
    }
}
