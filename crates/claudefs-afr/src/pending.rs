//! Pending changelog: the per-replica matrix of unconfirmed operations.
//!
//! Each replica stores, per inode, one counter triplet (data, metadata,
//! entry) for every replica in the set. A nonzero cell on replica A for
//! replica B means "A has seen an operation sent to B that is not yet known
//! to have been applied there". The self slot is always zero.
//!
//! On-disk value (key `<prefix>.pending`, one atomic write per replica):
//!
//! ```text
//! +---------+----------------+------------------------------------------+
//! | version | replica count  | count x (data u32, metadata u32, entry u32)|
//! |  1 byte |  u16 BE        | big-endian, indexed by replica position  |
//! +---------+----------------+------------------------------------------+
//! ```
//!
//! Everything here is a pure transform; `changelog` performs the I/O.

use serde::{Deserialize, Serialize};

use crate::error::{AfrError, Result};
use crate::types::{InodeId, PendingClass, ReplicaId};

/// Current changelog value format version.
pub const PENDING_FORMAT_VERSION: u8 = 1;

/// Size of one encoded counter triplet.
pub const TRIPLET_LEN: usize = 12;

const HEADER_LEN: usize = 3;

/// Counters for one replica row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingCounts([u32; 3]);

impl PendingCounts {
    /// Creates a triplet from explicit counts.
    pub fn new(data: u32, metadata: u32, entry: u32) -> Self {
        PendingCounts([data, metadata, entry])
    }

    /// Counter for `class`.
    pub fn get(&self, class: PendingClass) -> u32 {
        self.0[class.index()]
    }

    /// Adds `delta` to the counter for `class`, saturating at both ends.
    pub fn apply_delta(&mut self, class: PendingClass, delta: i64) {
        let cell = &mut self.0[class.index()];
        let next = (*cell as i64).saturating_add(delta);
        *cell = next.clamp(0, u32::MAX as i64) as u32;
    }

    /// Returns true if every counter is zero.
    pub fn is_clean(&self) -> bool {
        self.0.iter().all(|c| *c == 0)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        for c in self.0 {
            out.extend_from_slice(&c.to_be_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut counts = [0u32; 3];
        for (i, chunk) in bytes.chunks_exact(4).take(3).enumerate() {
            counts[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        PendingCounts(counts)
    }
}

/// The pending matrix as stored on one replica (its `owner`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMatrix {
    owner: usize,
    rows: Vec<PendingCounts>,
}

impl PendingMatrix {
    /// All-zero matrix, the state of a freshly created object.
    pub fn clean(owner: usize, replica_count: usize) -> Self {
        Self {
            owner,
            rows: vec![PendingCounts::default(); replica_count],
        }
    }

    /// Replica this view is stored on.
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the matrix has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for replica `index`.
    pub fn row(&self, index: usize) -> PendingCounts {
        self.rows.get(index).copied().unwrap_or_default()
    }

    /// Cell for replica `index` in column `class`.
    pub fn get(&self, index: usize, class: PendingClass) -> u32 {
        self.row(index).get(class)
    }

    /// Returns true if no replica is marked pending.
    pub fn is_clean(&self) -> bool {
        self.rows.iter().all(|r| r.is_clean())
    }

    /// Replicas this view marks as lagging in any column.
    pub fn accused(&self) -> Vec<ReplicaId> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(i, r)| *i != self.owner && !r.is_clean())
            .map(|(i, _)| ReplicaId::from(i))
            .collect()
    }

    /// Sets a cell directly. Writes to the owner row are ignored.
    pub fn set(&mut self, index: usize, class: PendingClass, value: u32) {
        if index == self.owner {
            return;
        }
        if let Some(row) = self.rows.get_mut(index) {
            row.0[class.index()] = value;
        }
    }

    /// Applies one replica's delta to this view.
    pub fn apply(&mut self, delta: &ReplicaDelta) {
        for (peer, d) in delta.peers.iter().enumerate() {
            if peer == self.owner || *d == 0 {
                continue;
            }
            if let Some(row) = self.rows.get_mut(peer) {
                row.apply_delta(delta.class, *d);
            }
        }
    }
}

/// What became of the operation on one peer, as input to `resolve_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerResult {
    /// The peer applied the operation.
    Applied,
    /// The peer definitely did not apply it (error code, or never sent).
    NotApplied,
    /// The outcome is unknown (timeout, transport loss mid-call).
    Unknown,
    /// The peer was down when the transaction started.
    Down,
}

/// Counter changes to apply on one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaDelta {
    /// Replica the delta is written to.
    pub replica: usize,
    /// Column changed.
    pub class: PendingClass,
    /// Signed change per peer, indexed by replica position.
    pub peers: Vec<i64>,
}

impl ReplicaDelta {
    /// Returns true if the delta changes nothing.
    pub fn is_noop(&self) -> bool {
        self.peers.iter().all(|d| *d == 0)
    }
}

/// Per-replica changelog updates for one inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSet {
    /// Inode whose changelog is updated.
    pub inode: InodeId,
    /// One entry per replica that needs a write.
    pub deltas: Vec<ReplicaDelta>,
}

impl WriteSet {
    /// Delta destined for `replica`, if any.
    pub fn delta_for(&self, replica: usize) -> Option<&ReplicaDelta> {
        self.deltas.iter().find(|d| d.replica == replica)
    }

    /// Returns true if nothing needs to be written.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Encodes and decodes pending matrices and computes their updates.
#[derive(Debug, Clone)]
pub struct PendingCodec {
    key: String,
    replica_count: usize,
}

impl PendingCodec {
    /// Codec for a set of `replica_count` replicas using keys under `prefix`.
    pub fn new(prefix: &str, replica_count: usize) -> Self {
        Self {
            key: format!("{}.pending", prefix),
            replica_count,
        }
    }

    /// Attribute key holding the matrix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of replicas in the set.
    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Serializes `matrix` into its attribute value.
    pub fn encode(&self, matrix: &PendingMatrix) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + TRIPLET_LEN * self.replica_count);
        out.push(PENDING_FORMAT_VERSION);
        out.extend_from_slice(&(self.replica_count as u16).to_be_bytes());
        for i in 0..self.replica_count {
            if i == matrix.owner {
                PendingCounts::default().encode_into(&mut out);
            } else {
                matrix.row(i).encode_into(&mut out);
            }
        }
        out
    }

    /// Parses an attribute value stored on replica `owner`.
    ///
    /// A missing value decodes to the clean matrix.
    pub fn decode(&self, owner: usize, value: Option<&[u8]>) -> Result<PendingMatrix> {
        let bytes = match value {
            None => return Ok(PendingMatrix::clean(owner, self.replica_count)),
            Some(b) => b,
        };
        if bytes.len() < HEADER_LEN {
            return Err(codec_err(format!("value too short: {} bytes", bytes.len())));
        }
        if bytes[0] != PENDING_FORMAT_VERSION {
            return Err(codec_err(format!("unsupported version {}", bytes[0])));
        }
        let count = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        if count != self.replica_count {
            return Err(codec_err(format!(
                "value covers {} replicas, set has {}",
                count, self.replica_count
            )));
        }
        let body = &bytes[HEADER_LEN..];
        if body.len() != count * TRIPLET_LEN {
            return Err(codec_err(format!(
                "body is {} bytes, expected {}",
                body.len(),
                count * TRIPLET_LEN
            )));
        }
        let mut matrix = PendingMatrix::clean(owner, count);
        for (i, chunk) in body.chunks_exact(TRIPLET_LEN).enumerate() {
            if i != owner {
                matrix.rows[i] = PendingCounts::decode(chunk);
            }
        }
        Ok(matrix)
    }

    /// Pre-op marks.
    ///
    /// Every replica in `writers` gets +1 in `class` for every other replica
    /// in `up`.
    pub fn mark_pending(&self, inode: InodeId, class: PendingClass, writers: &[bool], up: &[bool]) -> WriteSet {
        let deltas = (0..self.replica_count)
            .filter(|r| flag(writers, *r))
            .map(|r| ReplicaDelta {
                replica: r,
                class,
                peers: (0..self.replica_count)
                    .map(|p| if p != r && flag(up, p) { 1 } else { 0 })
                    .collect(),
            })
            .filter(|d| !d.is_noop())
            .collect();
        WriteSet { inode, deltas }
    }

    /// Post-op resolution.
    ///
    /// `writers` are the replicas holding a durable pre-op mark, `marked` the
    /// peers that mark covers, `results` what became of the operation on each
    /// replica. Applied peers are cleared; peers that missed an operation some
    /// replica may have applied stay (or become) marked; if nothing could
    /// have been applied anywhere, definite non-appliers are cleared too.
    pub fn resolve_pending(
        &self,
        inode: InodeId,
        class: PendingClass,
        writers: &[bool],
        marked: &[bool],
        results: &[PeerResult],
    ) -> WriteSet {
        let maybe_applied = results
            .iter()
            .any(|r| matches!(r, PeerResult::Applied | PeerResult::Unknown));

        let deltas = (0..self.replica_count)
            .filter(|r| flag(writers, *r))
            .map(|r| ReplicaDelta {
                replica: r,
                class,
                peers: (0..self.replica_count)
                    .map(|p| {
                        if p == r {
                            return 0;
                        }
                        let result = results.get(p).copied().unwrap_or(PeerResult::Down);
                        if flag(marked, p) {
                            match result {
                                PeerResult::Applied => -1,
                                PeerResult::NotApplied if !maybe_applied => -1,
                                _ => 0,
                            }
                        } else if maybe_applied && result != PeerResult::Applied {
                            1
                        } else {
                            0
                        }
                    })
                    .collect(),
            })
            .filter(|d| !d.is_noop())
            .collect();
        WriteSet { inode, deltas }
    }
}

fn flag(v: &[bool], i: usize) -> bool {
    v.get(i).copied().unwrap_or(false)
}

fn codec_err(msg: String) -> AfrError {
    AfrError::Codec { msg }
}
