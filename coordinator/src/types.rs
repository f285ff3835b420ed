//! Wire types shared by every coordinator backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing counter assigned by the backend to every mutation.
pub type Revision = i64;

/// Backend-managed lease handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub i64);

impl LeaseId {
    /// Raw numeric value.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored key with its value and bookkeeping revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Full key
    pub key: String,
    /// Raw value bytes
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    /// Matching keys, sorted by key
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: Revision,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResponse {
    /// Store revision after the delete
    pub revision: Revision,
    /// Number of keys removed (0 when the key was already gone)
    pub deleted: u64,
}

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Lease handle
    pub id: LeaseId,
    /// TTL the backend actually granted
    pub ttl_secs: i64,
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change delivered by a watch.
///
/// For deletes `kv.value` is empty and `kv.mod_revision` is the revision of
/// the delete itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

impl WatchEvent {
    /// Revision the event happened at.
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

/// Ordered group of events delivered together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
}

impl WatchBatch {
    /// Highest revision in the batch.
    pub fn last_revision(&self) -> Option<Revision> {
        self.events.last().map(WatchEvent::revision)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
