//! Per-volume engine configuration.
//!
//! One `AfrConfig` describes one replicated volume: its ordered replica
//! membership, timeouts and the quorum policy for each transaction type.
//! Several engines with different configs can live in one process.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{AfrError, Result};
use crate::quorum::QuorumPolicy;
use crate::types::TxnType;

/// Default xattr namespace for pending changelog keys.
pub const DEFAULT_XATTR_PREFIX: &str = "trusted.afr";

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_retry_backoff_ms() -> u64 {
    20
}

fn default_xattr_prefix() -> String {
    DEFAULT_XATTR_PREFIX.to_string()
}

/// Quorum policy per transaction type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumTable {
    /// Policy for data transactions.
    pub data: QuorumPolicy,
    /// Policy for metadata transactions.
    pub metadata: QuorumPolicy,
    /// Policy for entry transactions.
    pub entry: QuorumPolicy,
    /// Policy for create transactions.
    pub create: QuorumPolicy,
}

impl QuorumTable {
    /// Returns the policy configured for `txn_type`.
    pub fn policy_for(&self, txn_type: TxnType) -> QuorumPolicy {
        match txn_type {
            TxnType::Data => self.data,
            TxnType::Metadata => self.metadata,
            TxnType::Entry => self.entry,
            TxnType::Create => self.create,
        }
    }
}

impl Default for QuorumTable {
    fn default() -> Self {
        Self {
            data: QuorumPolicy::Majority,
            metadata: QuorumPolicy::Majority,
            entry: QuorumPolicy::AllUp,
            create: QuorumPolicy::AllUp,
        }
    }
}

/// Configuration of one replicated volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AfrConfig {
    /// Volume name, used in logs and heal requests.
    pub volume: String,
    /// Ordered replica names; position is the replica index.
    pub replicas: Vec<String>,
    /// Lock owner identity of this engine. 0 picks a random one at startup.
    #[serde(default)]
    pub client_id: u64,
    /// Timeout for a single replica call in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Maximum time to wait for a transaction lock in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Base backoff between replica lock retries in milliseconds.
    #[serde(default = "default_lock_retry_backoff_ms")]
    pub lock_retry_backoff_ms: u64,
    /// Namespace of the pending changelog keys.
    #[serde(default = "default_xattr_prefix")]
    pub xattr_prefix: String,
    /// Quorum policy per transaction type.
    #[serde(default)]
    pub quorum: QuorumTable,
}

impl AfrConfig {
    /// Creates a config with default timeouts and policies.
    pub fn new(volume: &str, replicas: &[&str]) -> Self {
        Self {
            volume: volume.to_string(),
            replicas: replicas.iter().map(|r| r.to_string()).collect(),
            client_id: 0,
            call_timeout_ms: default_call_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_backoff_ms: default_lock_retry_backoff_ms(),
            xattr_prefix: default_xattr_prefix(),
            quorum: QuorumTable::default(),
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: AfrConfig = toml::from_str(s).map_err(|e| AfrError::Config {
            msg: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AfrError::Config {
            msg: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks membership, timeouts and policies for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.volume.is_empty() {
            return Err(config_err("volume name is empty"));
        }
        if self.replicas.is_empty() {
            return Err(config_err("replica set is empty"));
        }
        if self.replicas.len() > u16::MAX as usize {
            return Err(config_err("too many replicas"));
        }
        let mut seen = HashSet::new();
        for name in &self.replicas {
            if name.is_empty() {
                return Err(config_err("replica name is empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(config_err(&format!("duplicate replica name {:?}", name)));
            }
        }
        if self.call_timeout_ms == 0 || self.lock_timeout_ms == 0 {
            return Err(config_err("timeouts must be non-zero"));
        }
        if self.xattr_prefix.is_empty() {
            return Err(config_err("xattr prefix is empty"));
        }
        for txn_type in [TxnType::Data, TxnType::Metadata, TxnType::Entry, TxnType::Create] {
            if let QuorumPolicy::Fixed(k) = self.quorum.policy_for(txn_type) {
                if k == 0 || k > self.replicas.len() {
                    return Err(config_err(&format!(
                        "{} quorum {} outside 1..={}",
                        txn_type,
                        k,
                        self.replicas.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of replicas in the set.
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Lock wait timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Base lock retry backoff.
    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }
}

fn config_err(msg: &str) -> AfrError {
    AfrError::Config {
        msg: msg.to_string(),
    }
}
