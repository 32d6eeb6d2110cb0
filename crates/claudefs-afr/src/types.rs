//! Core identifiers and lock scopes shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an inode on the replicated volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// Creates a new InodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a replica within its replica set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(u16);

impl ReplicaId {
    /// Creates a new ReplicaId from a raw index.
    pub fn new(id: u16) -> Self {
        ReplicaId(id)
    }

    /// Returns the index of this replica in its set.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for ReplicaId {
    fn from(index: usize) -> Self {
        ReplicaId(index as u16)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Unique identifier of one transaction within an engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    /// Creates a new transaction ID from a raw u64 value.
    pub fn new(id: u64) -> Self {
        TxnId(id)
    }

    /// Returns the raw u64 value of this transaction ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Kind of filesystem operation a transaction carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnType {
    /// File content change (write, truncate, fallocate).
    Data,
    /// Inode attribute change (setattr, setxattr, chmod).
    Metadata,
    /// Directory namespace change (unlink, rename, link, rmdir).
    Entry,
    /// Creation of a new name in a directory (create, mkdir, mknod, symlink).
    Create,
}

impl TxnType {
    /// Pending changelog column touched by this transaction type.
    pub fn pending_class(&self) -> PendingClass {
        match self {
            TxnType::Data => PendingClass::Data,
            TxnType::Metadata => PendingClass::Metadata,
            TxnType::Entry | TxnType::Create => PendingClass::Entry,
        }
    }
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnType::Data => write!(f, "data"),
            TxnType::Metadata => write!(f, "metadata"),
            TxnType::Entry => write!(f, "entry"),
            TxnType::Create => write!(f, "create"),
        }
    }
}

/// Column of the pending matrix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PendingClass {
    /// File content.
    Data,
    /// Inode attributes.
    Metadata,
    /// Directory entries.
    Entry,
}

impl PendingClass {
    /// All classes in on-disk order.
    pub const ALL: [PendingClass; 3] = [
        PendingClass::Data,
        PendingClass::Metadata,
        PendingClass::Entry,
    ];

    /// Column index in the on-disk triplet.
    pub fn index(&self) -> usize {
        match self {
            PendingClass::Data => 0,
            PendingClass::Metadata => 1,
            PendingClass::Entry => 2,
        }
    }
}

/// Half-open byte range `[start, start + len)`. A zero length extends to end of file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte covered.
    pub start: u64,
    /// Number of bytes covered, 0 meaning "through end of file".
    pub len: u64,
}

impl ByteRange {
    /// Creates a range covering `len` bytes from `start`.
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Range covering the whole file.
    pub fn whole_file() -> Self {
        Self { start: 0, len: 0 }
    }

    /// Exclusive end offset, or None when the range is open-ended.
    pub fn end(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.start.saturating_add(self.len))
        }
    }

    /// Returns true if the two ranges share at least one byte.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        let self_before_other = self.end().is_some_and(|end| end <= other.start);
        let other_before_self = other.end().is_some_and(|end| end <= self.start);
        !self_before_other && !other_before_self
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, EOF)", self.start),
        }
    }
}

/// Granularity of a transaction lock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockScope {
    /// Byte-range lock on file content.
    Range(ByteRange),
    /// Whole-inode lock.
    Inode,
    /// Entry lock on a directory, for one name or (None) the whole directory.
    Entry {
        /// Name within the directory, None for every name.
        name: Option<String>,
    },
}

impl LockScope {
    /// Returns true if holding both scopes at once would break exclusivity.
    ///
    /// Entry locks live in their own domain and never conflict with inode or
    /// range locks on the same directory inode.
    pub fn conflicts_with(&self, other: &LockScope) -> bool {
        match (self, other) {
            (LockScope::Range(a), LockScope::Range(b)) => a.overlaps(b),
            (LockScope::Inode, LockScope::Inode)
            | (LockScope::Inode, LockScope::Range(_))
            | (LockScope::Range(_), LockScope::Inode) => true,
            (LockScope::Entry { name: a }, LockScope::Entry { name: b }) => match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            },
            (LockScope::Entry { .. }, _) | (_, LockScope::Entry { .. }) => false,
        }
    }
}

/// What a transaction locks: a scope on one inode.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockTarget {
    /// Inode carrying the lock (the parent directory for entry locks).
    pub inode: InodeId,
    /// Scope of the lock on that inode.
    pub scope: LockScope,
}

impl LockTarget {
    /// Returns true if the two targets overlap.
    pub fn conflicts_with(&self, other: &LockTarget) -> bool {
        self.inode == other.inode && self.scope.conflicts_with(&other.scope)
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            LockScope::Range(r) => write!(f, "inode {} range {}", self.inode, r),
            LockScope::Inode => write!(f, "inode {}", self.inode),
            LockScope::Entry { name: Some(n) } => write!(f, "dir {} entry {:?}", self.inode, n),
            LockScope::Entry { name: None } => write!(f, "dir {} all entries", self.inode),
        }
    }
}

/// Identity of a lock holder as seen by replicas.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    /// Client (engine instance) identifier.
    pub client: u64,
    /// Transaction holding the lock.
    pub txn: TxnId,
}
