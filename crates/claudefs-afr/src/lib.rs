#![warn(missing_docs)]

//! ClaudeFS replication transactions: Locked fan-out to replicas, pending changelog, quorum, self-heal triggering
//!
//! Transaction path: Lock → Pre-op marks → Fan-out → Quorum → Post-op resolve → Unlock → Heal notify
//! Recovery path:    Read leftover marks → Accused replicas → Heal notify

pub mod changelog;
pub mod config;
pub mod error;
pub mod fanout;
pub mod heal;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod pending;
pub mod quorum;
pub mod recovery;
pub mod replica;
pub mod transaction;
pub mod types;

pub use config::{AfrConfig, QuorumTable};
pub use error::{AfrError, ReplicaError, Result};
pub use fanout::{FopBody, FopContext, ReplicaOutcome, TransactionBody};
pub use heal::{ChannelHealNotifier, HealNotifier, HealQueue, HealReason, HealRequest, NoopHealNotifier};
pub use memory::{FopFault, MemoryReplica};
pub use metrics::{AfrMetrics, AfrMetricsSnapshot};
pub use pending::{PendingCodec, PendingCounts, PendingMatrix};
pub use quorum::{QuorumDecision, QuorumPolicy};
pub use recovery::{InodeScan, RecoveryReport, SplitBrainCandidate};
pub use replica::{FopRequest, Replica, ReplicaHandle, ReplicaReply, ReplicaRequest};
pub use transaction::{Outcome, TransactionEngine, TransactionReport, TxnRequest, TxnState};
pub use types::{ByteRange, InodeId, LockScope, LockTarget, PendingClass, ReplicaId, TxnId, TxnType};
