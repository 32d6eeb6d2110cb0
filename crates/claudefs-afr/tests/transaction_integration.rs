//! End-to-end tests of replicated transactions over in-memory replicas.

mod common;

use claudefs_afr::{
    AfrError, ByteRange, FopFault, HealReason, InodeId, Outcome, PendingClass, QuorumDecision,
    ReplicaError, ReplicaId, ReplicaOutcome, TxnRequest, TxnState,
};
use common::{
    test_config, wait_until_idle, write_fop, CancellingBody, IntervalBody, TestCluster,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Passive observer of the pending matrix while a transaction runs.
struct ObservingBody {
    cluster_replicas: Vec<Arc<claudefs_afr::MemoryReplica>>,
    seen: std::sync::Mutex<Vec<Option<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl claudefs_afr::TransactionBody for ObservingBody {
    async fn apply(
        &self,
        replica: &claudefs_afr::ReplicaHandle,
        ctx: &claudefs_afr::FopContext,
    ) -> Result<(), claudefs_afr::ReplicaError> {
        let i = replica.id().index();
        let value = self.cluster_replicas[i].xattr(ctx.inode, "trusted.afr.pending");
        self.seen.lock().expect("seen")[i] = value;
        replica
            .fop(claudefs_afr::FopRequest::new("writev", ctx.inode, vec![1; 10]))
            .await
            .map(|_| ())
    }
}

#[tokio::test]
async fn test_data_write_three_replicas_end_to_end() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(42);
    let body = Arc::new(ObservingBody {
        cluster_replicas: cluster.replicas.clone(),
        seen: std::sync::Mutex::new(vec![None; 3]),
    });

    let report = cluster
        .engine
        .execute(TxnRequest::data(inode, ByteRange::new(0, 10)), body.clone(), None)
        .await;

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.decision, Some(QuorumDecision::FullSuccess));
    assert!(report.outcomes.iter().all(ReplicaOutcome::is_success));

    // During Running every replica holds marks for its two peers.
    let codec = claudefs_afr::PendingCodec::new("trusted.afr", 3);
    let seen = body.seen.lock().expect("seen").clone();
    for (i, value) in seen.iter().enumerate() {
        let matrix = codec.decode(i, value.as_deref()).expect("decode");
        let nonzero = (0..3)
            .filter(|p| matrix.get(*p, PendingClass::Data) > 0)
            .count();
        assert_eq!(nonzero, 2, "replica {} during running", i);
        assert_eq!(matrix.get(i, PendingClass::Data), 0);
    }

    // Net zero afterwards, lock released everywhere.
    for (i, replica) in cluster.replicas.iter().enumerate() {
        assert!(cluster.pending(i, inode).await.is_clean());
        assert!(replica.held_locks(inode).is_empty());
        assert_eq!(replica.stats().locks_granted, 1);
        assert_eq!(replica.stats().unlocks, 1);
        assert_eq!(replica.fop_log().len(), 1);
    }
}

#[tokio::test]
async fn test_partial_success_leaves_marks_and_heals() {
    let mut cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(7);
    cluster.replicas[2].set_fop_fault(FopFault::Errno(5));

    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 4096)), write_fop(7))
        .await;
    assert_eq!(outcome, Outcome::PartialSuccess(vec![ReplicaId::new(2)]));

    for survivor in [0, 1] {
        let m = cluster.pending(survivor, inode).await;
        assert_eq!(m.get(2, PendingClass::Data), 1);
        assert_eq!(m.get(1 - survivor, PendingClass::Data), 0);
    }

    let requests = cluster.heal.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].inode, inode);
    assert_eq!(requests[0].lagging, vec![ReplicaId::new(2)]);
    assert_eq!(requests[0].reason, HealReason::PostOp);
    assert_eq!(cluster.engine.metrics().partial_success, 1);
}

#[tokio::test]
async fn test_repeated_failures_accumulate() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(3);
    cluster.replicas[1].set_fop_fault(FopFault::Errno(5));
    for _ in 0..3 {
        cluster
            .engine
            .run_transaction(TxnRequest::metadata(inode), write_fop(3))
            .await;
    }
    assert_eq!(cluster.pending(0, inode).await.get(1, PendingClass::Metadata), 3);
    assert_eq!(cluster.pending(2, inode).await.get(1, PendingClass::Metadata), 3);
}

#[tokio::test]
async fn test_quorum_failure_when_majority_fails() {
    let mut cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(9);
    cluster.replicas[1].set_fop_fault(FopFault::Errno(5));
    cluster.replicas[2].set_fop_fault(FopFault::Errno(5));

    let report = cluster
        .engine
        .execute(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(9), None)
        .await;
    assert_eq!(
        report.outcome,
        Outcome::Failure(AfrError::QuorumFailure {
            succeeded: 1,
            required: 2
        })
    );
    assert!(report.visited(TxnState::Unlocking));
    assert!(cluster.replicas.iter().all(|r| r.held_locks(inode).is_empty()));

    // r0 applied, so the other two lag behind it.
    let requests = cluster.heal.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lagging, vec![ReplicaId::new(1), ReplicaId::new(2)]);
}

#[tokio::test]
async fn test_down_replica_is_skipped_and_marked() {
    let mut cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(11);
    cluster.engine.set_replica_up(1, false).expect("index in range");

    let report = cluster
        .engine
        .execute(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(11), None)
        .await;
    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.outcomes[1], ReplicaOutcome::Skipped);
    assert!(cluster.replicas[1].fop_log().is_empty());
    assert_eq!(cluster.replicas[1].stats().locks_granted, 0);

    // First failure observed: survivors record the down replica.
    assert_eq!(cluster.pending(0, inode).await.get(1, PendingClass::Data), 1);
    assert_eq!(cluster.pending(2, inode).await.get(1, PendingClass::Data), 1);
    assert_eq!(cluster.pending(0, inode).await.get(2, PendingClass::Data), 0);
    assert!(cluster.heal.drain().is_empty());
}

#[tokio::test]
async fn test_entry_ops_need_every_up_replica() {
    let cluster = TestCluster::new("vol", 3);
    let parent = InodeId::new(1);
    cluster.replicas[0].set_fop_fault(FopFault::Errno(17));

    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::create(parent, "a.txt"), write_fop(1))
        .await;
    assert_eq!(
        outcome,
        Outcome::Failure(AfrError::QuorumFailure {
            succeeded: 2,
            required: 3
        })
    );
    assert_eq!(cluster.pending(1, parent).await.get(0, PendingClass::Entry), 1);
}

#[tokio::test]
async fn test_preop_write_failure_downgrades_replica() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(5);
    cluster.replicas[2].set_setxattr_budget(Some(0));

    let report = cluster
        .engine
        .execute(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(5), None)
        .await;
    assert_eq!(report.outcome, Outcome::PartialSuccess(vec![ReplicaId::new(2)]));
    assert!(cluster.replicas[2].fop_log().is_empty());
    assert_eq!(cluster.pending(0, inode).await.get(2, PendingClass::Data), 1);
    assert_eq!(cluster.engine.metrics().preop_downgrades, 1);
}

#[tokio::test]
async fn test_postop_write_failure_heals_stale_accusations() {
    let mut cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(6);
    // One write for the pre-op mark, none for post-op.
    cluster.replicas[0].set_setxattr_budget(Some(1));

    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(6))
        .await;
    // Every replica applied the write.
    assert_eq!(outcome, Outcome::Success);
    assert!(cluster.replicas.iter().all(|r| r.fop_log().len() == 1));
    assert_eq!(cluster.engine.metrics().postop_write_failures, 1);

    // r0 still accuses its peers; the others are clean.
    let stale = cluster.pending(0, inode).await;
    assert_eq!(stale.get(1, PendingClass::Data), 1);
    assert_eq!(stale.get(2, PendingClass::Data), 1);
    assert!(cluster.pending(1, inode).await.is_clean());
    assert!(cluster.pending(2, inode).await.is_clean());

    let requests = cluster.heal.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].reason, HealReason::StaleChangelog);
    assert_eq!(requests[0].lagging, vec![ReplicaId::new(1), ReplicaId::new(2)]);

    // A later scan reads the same evidence back.
    let report = cluster.engine.recover(&[inode]).await;
    let scan = report.scan_for(inode).expect("scanned");
    assert_eq!(scan.lagging, requests[0].lagging);
}

#[tokio::test]
async fn test_postop_failures_below_quorum_fail_transaction() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(6);
    cluster.replicas[0].set_setxattr_budget(Some(1));
    cluster.replicas[1].set_setxattr_budget(Some(1));

    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(6))
        .await;
    assert!(matches!(
        outcome,
        Outcome::Failure(AfrError::AttributeStore { .. })
    ));
}

#[tokio::test]
async fn test_fop_timeout_keeps_marks() {
    let mut config = test_config("vol", 3);
    config.call_timeout_ms = 50;
    let mut cluster = TestCluster::with_config(config);
    let inode = InodeId::new(13);
    cluster.replicas[1].set_fop_fault(FopFault::Hang);

    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(13))
        .await;
    assert_eq!(outcome, Outcome::PartialSuccess(vec![ReplicaId::new(1)]));
    // Liveness untouched by a timeout.
    assert!(cluster.engine.replica_set().is_up(1));
    assert_eq!(cluster.pending(0, inode).await.get(1, PendingClass::Data), 1);
    assert_eq!(cluster.heal.drain().len(), 1);
}

#[tokio::test]
async fn test_lock_conflict_with_other_engine() {
    let first = TestCluster::new("vol", 3);
    let mut second_config = first.engine.config().clone();
    second_config.lock_timeout_ms = 100;
    let second = TestCluster::from_replicas(second_config, first.replicas.clone());
    let inode = InodeId::new(21);

    let holder = {
        let engine = first.engine.clone();
        tokio::spawn(async move {
            let body = Arc::new(IntervalBody::new(Duration::from_millis(400)));
            engine
                .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 100)), body)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = second
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(50, 10)), write_fop(21))
        .await;
    assert_eq!(outcome, Outcome::Failure(AfrError::LockConflict { inode: 21 }));
    assert_eq!(second.engine.metrics().lock_failures, 1);

    assert_eq!(holder.await.expect("join"), Outcome::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_ranges_never_run_together() {
    let cluster = TestCluster::new("vol", 3);
    let body = Arc::new(IntervalBody::new(Duration::from_millis(10)));
    let inode = InodeId::new(100);
    // Every range covers offset 5.
    let ranges = [(0, 10), (5, 10), (0, 0), (4, 2), (3, 4), (0, 100), (5, 1), (2, 8)];

    let tasks: Vec<_> = ranges
        .iter()
        .map(|&(start, len)| {
            let engine = cluster.engine.clone();
            let body = body.clone();
            tokio::spawn(async move {
                engine
                    .run_transaction(TxnRequest::data(inode, ByteRange::new(start, len)), body.clone())
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.expect("join"), Outcome::Success);
    }

    let mut intervals = body.intervals();
    assert_eq!(intervals.len(), ranges.len());
    intervals.sort_by_key(|(_, start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(
            pair[0].2 <= pair[1].1,
            "{} and {} overlapped",
            pair[0].0,
            pair[1].0
        );
    }
    for i in 0..3 {
        assert!(cluster.pending(i, inode).await.is_clean());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disjoint_targets_run_concurrently() {
    let cluster = TestCluster::new("vol", 3);
    let body = Arc::new(IntervalBody::new(Duration::from_millis(200)));

    let a = {
        let engine = cluster.engine.clone();
        let body = body.clone();
        tokio::spawn(async move {
            engine
                .run_transaction(TxnRequest::data(InodeId::new(1), ByteRange::new(0, 10)), body.clone())
                .await
        })
    };
    let b = {
        let engine = cluster.engine.clone();
        let body = body.clone();
        tokio::spawn(async move {
            engine
                .run_transaction(TxnRequest::data(InodeId::new(1), ByteRange::new(10, 10)), body.clone())
                .await
        })
    };
    assert!(a.await.expect("join").is_success());
    assert!(b.await.expect("join").is_success());

    let intervals = body.intervals();
    let (x, y) = (&intervals[0], &intervals[1]);
    assert!(x.1 < y.2 && y.1 < x.2, "disjoint ranges were serialized");
}

#[tokio::test]
async fn test_crash_between_preop_and_postop_recovers_marks() {
    let mut config = test_config("vol", 3);
    config.call_timeout_ms = 60_000;
    let cluster = TestCluster::with_config(config);
    let inode = InodeId::new(77);
    for r in &cluster.replicas {
        r.set_fop_fault(FopFault::Hang);
    }

    let task = {
        let engine = cluster.engine.clone();
        tokio::spawn(async move {
            engine
                .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(77))
                .await
        })
    };

    // Wait until every pre-op mark is durable, then crash: only the
    // replicas' durable state survives into the restarted cluster.
    for _ in 0..200 {
        if cluster
            .replicas
            .iter()
            .all(|r| r.xattr(inode, "trusted.afr.pending").is_some())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    assert!(task.await.is_err());

    let mut restarted = cluster.restart();
    for i in 0..3 {
        let m = restarted.pending(i, inode).await;
        assert_eq!(m.accused().len(), 2, "marks lost on replica {}", i);
    }

    let report = restarted.engine.recover(&[InodeId::new(1), inode]).await;
    assert_eq!(report.inodes_needing_heal(), vec![inode]);
    let scan = report.scan_for(inode).expect("scanned");
    assert_eq!(
        scan.lagging,
        vec![ReplicaId::new(0), ReplicaId::new(1), ReplicaId::new(2)]
    );
    assert_eq!(scan.split_brain_candidates.len(), 3);

    let requests = restarted.heal.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].reason, HealReason::RecoveryScan);
    assert_eq!(restarted.engine.metrics().heal_notifications, 1);
}

#[tokio::test]
async fn test_cancel_during_locking() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(31);

    let holder = {
        let engine = cluster.engine.clone();
        tokio::spawn(async move {
            let body = Arc::new(IntervalBody::new(Duration::from_millis(300)));
            engine
                .run_transaction(TxnRequest::metadata(inode), body)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let waiter = {
        let engine = cluster.engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .execute(TxnRequest::metadata(inode), write_fop(31), Some(cancel))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = waiter.await.expect("join");
    assert_eq!(report.outcome, Outcome::Failure(AfrError::Cancelled));
    assert!(!report.visited(TxnState::PreOp));
    assert!(holder.await.expect("join").is_success());
    assert_eq!(cluster.engine.metrics().cancellations, 1);
    assert_eq!(cluster.engine.metrics().lock_failures, 0);
}

#[tokio::test]
async fn test_cancel_after_preop_is_ignored() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(32);
    let token = CancellationToken::new();
    let body = Arc::new(CancellingBody {
        token: token.clone(),
    });

    let report = cluster
        .engine
        .execute(TxnRequest::metadata(inode), body, Some(token))
        .await;
    assert_eq!(report.outcome, Outcome::Success);
    assert!(report.cancel_requested_late);
    assert!(report.visited(TxnState::PostOp));
    assert!(cluster.pending(0, inode).await.is_clean());
}

#[tokio::test]
async fn test_all_replicas_unreachable() {
    let cluster = TestCluster::new("vol", 3);
    for r in &cluster.replicas {
        r.set_unreachable(true);
    }
    let report = cluster
        .engine
        .execute(TxnRequest::metadata(InodeId::new(1)), write_fop(1), None)
        .await;
    assert_eq!(report.outcome, Outcome::Failure(AfrError::ReplicaUnreachable));
    assert!(!report.visited(TxnState::PreOp));
    assert!(report.visited(TxnState::Unlocking));
}

#[tokio::test]
async fn test_two_volumes_are_independent() {
    let vol_a = TestCluster::new("alpha", 3);
    let vol_b = TestCluster::new("beta", 2);
    let inode = InodeId::new(1);
    vol_b.replicas[1].set_fop_fault(FopFault::Errno(5));

    let (a, b) = tokio::join!(
        vol_a
            .engine
            .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(1)),
        vol_b
            .engine
            .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(1)),
    );
    assert_eq!(a, Outcome::Success);
    assert_eq!(
        b,
        Outcome::Failure(AfrError::QuorumFailure {
            succeeded: 1,
            required: 2
        })
    );
    assert_eq!(vol_a.engine.metrics().full_success, 1);
    assert_eq!(vol_a.engine.metrics().failed, 0);
    assert_eq!(vol_b.engine.metrics().failed, 1);
    assert!(vol_a.engine.format_metrics().contains("volume=\"alpha\""));
}

#[tokio::test]
async fn test_lock_refused_by_one_replica_marks_it() {
    let mut cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(15);
    cluster.replicas[2].set_unreachable(true);

    let report = cluster
        .engine
        .execute(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(15), None)
        .await;
    assert_eq!(report.outcome, Outcome::PartialSuccess(vec![ReplicaId::new(2)]));
    assert_eq!(
        report.outcomes[2],
        ReplicaOutcome::Error(ReplicaError::Unreachable)
    );
    assert!(cluster.replicas[2].fop_log().is_empty());

    for survivor in [0, 1] {
        let m = cluster.pending(survivor, inode).await;
        assert_eq!(m.get(2, PendingClass::Data), 1, "survivor {}", survivor);
        assert_eq!(m.get(1 - survivor, PendingClass::Data), 0);
    }

    let requests = cluster.heal.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].lagging, vec![ReplicaId::new(2)]);
    assert_eq!(requests[0].reason, HealReason::PostOp);
}

#[tokio::test]
async fn test_slow_lock_reply_leaves_no_lock_behind() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(16);
    // Granted on the replica, but the reply arrives after the call timeout.
    cluster.replicas[2].set_lock_reply_delay(Some(Duration::from_millis(800)));

    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(16))
        .await;
    assert_eq!(outcome, Outcome::PartialSuccess(vec![ReplicaId::new(2)]));
    assert!(cluster.replicas.iter().all(|r| r.held_locks(inode).is_empty()));

    cluster.replicas[2].set_lock_reply_delay(None);
    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(16))
        .await;
    // r2 is not excluded by an orphaned lock of the first transaction.
    assert_eq!(outcome, Outcome::Success);
    assert_eq!(cluster.replicas[2].fop_log().len(), 1);
}

#[tokio::test]
async fn test_abandoned_transaction_runs_to_completion() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(9);
    for r in &cluster.replicas {
        r.set_fop_delay(Some(Duration::from_millis(200)));
    }

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        cluster
            .engine
            .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(9)),
    )
    .await;
    assert!(abandoned.is_err());

    wait_until_idle(&cluster.engine).await;
    for (i, replica) in cluster.replicas.iter().enumerate() {
        assert!(replica.held_locks(inode).is_empty(), "lock left on replica {}", i);
        assert_eq!(replica.fop_log().len(), 1);
        assert!(cluster.pending(i, inode).await.is_clean());
    }
    assert_eq!(cluster.engine.metrics().full_success, 1);

    for r in &cluster.replicas {
        r.set_fop_delay(None);
    }
    let outcome = cluster
        .engine
        .run_transaction(TxnRequest::data(inode, ByteRange::new(0, 10)), write_fop(9))
        .await;
    assert_eq!(outcome, Outcome::Success);
}

#[tokio::test]
async fn test_abandoned_while_queued_never_runs() {
    let cluster = TestCluster::new("vol", 3);
    let inode = InodeId::new(10);

    let holder = {
        let engine = cluster.engine.clone();
        tokio::spawn(async move {
            let body = Arc::new(IntervalBody::new(Duration::from_millis(200)));
            engine
                .run_transaction(TxnRequest::metadata(inode), body)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        cluster
            .engine
            .run_transaction(TxnRequest::metadata(inode), write_fop(10)),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(holder.await.expect("join").is_success());

    wait_until_idle(&cluster.engine).await;
    assert!(cluster.replicas.iter().all(|r| r.fop_log().len() == 1));
    assert!(cluster.replicas.iter().all(|r| r.held_locks(inode).is_empty()));
    assert_eq!(cluster.engine.metrics().cancellations, 1);
}
