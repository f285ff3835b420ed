//! Membership snapshot and the change events folded into it.

use std::collections::{BTreeMap, VecDeque};

use coordinator::Revision;

use crate::types::InstanceRecord;

/// Tombstones kept per snapshot unless configured otherwise
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 1024;

/// A change to the member set of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChangeEvent {
    /// Instance registered or its record replaced
    Put {
        instance_id: String,
        record: InstanceRecord,
        revision: Revision,
    },
    /// Instance removed (deregistered or lease lapsed)
    Delete {
        instance_id: String,
        revision: Revision,
    },
}

impl MembershipChangeEvent {
    pub fn revision(&self) -> Revision {
        match self {
            MembershipChangeEvent::Put { revision, .. } => *revision,
            MembershipChangeEvent::Delete { revision, .. } => *revision,
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            MembershipChangeEvent::Put { instance_id, .. } => instance_id,
            MembershipChangeEvent::Delete { instance_id, .. } => instance_id,
        }
    }
}

/// Locally cached view of which instances of a service are live.
///
/// Built from a listing at `base_revision`, then advanced by change events.
/// An event is stale, and ignored, when its revision is at or below the
/// listing revision or at or below the last revision applied to the same
/// instance. Deletes leave a tombstone revision so a late put cannot
/// resurrect the instance.
///
/// Only the most recent `tombstone_limit` tombstones are kept. Evicting one
/// raises a stale floor to its revision, and every event at or below the
/// floor is stale, so memory follows live membership rather than churn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    service: String,
    revision: Revision,
    base_revision: Revision,
    instances: BTreeMap<String, InstanceRecord>,
    applied: BTreeMap<String, Revision>,
    tombstones: VecDeque<(String, Revision)>,
    tombstone_limit: usize,
    stale_floor: Revision,
}

impl MembershipSnapshot {
    /// Snapshot with no members and revision 0.
    pub fn empty(service: impl Into<String>) -> Self {
        Self::from_listing(service, 0, std::iter::empty())
    }

    /// Build from a listing served at `revision`.
    ///
    /// Entries are `(instance_id, record, mod_revision)`.
    pub fn from_listing(
        service: impl Into<String>,
        revision: Revision,
        entries: impl IntoIterator<Item = (String, InstanceRecord, Revision)>,
    ) -> Self {
        let mut instances = BTreeMap::new();
        let mut applied = BTreeMap::new();
        for (instance_id, record, mod_revision) in entries {
            applied.insert(instance_id.clone(), mod_revision);
            instances.insert(instance_id, record);
        }

        Self {
            service: service.into(),
            revision,
            base_revision: revision,
            instances,
            applied,
            tombstones: VecDeque::new(),
            tombstone_limit: DEFAULT_TOMBSTONE_LIMIT,
            stale_floor: 0,
        }
    }

    /// Keep at most `limit` tombstones (at least one).
    pub fn with_tombstone_limit(mut self, limit: usize) -> Self {
        self.tombstone_limit = limit.max(1);
        self.evict_tombstones();
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Highest revision reflected in the snapshot.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Revision of the listing the snapshot was built from.
    pub fn base_revision(&self) -> Revision {
        self.base_revision
    }

    pub fn instances(&self) -> &BTreeMap<String, InstanceRecord> {
        &self.instances
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.instances.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance ids in sorted order.
    pub fn instance_ids(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    /// `host:port` of every member, sorted by instance id.
    pub fn endpoints(&self) -> Vec<String> {
        self.instances.values().map(InstanceRecord::endpoint).collect()
    }

    /// Number of deleted instances still remembered.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Same members with the same records, regardless of revisions.
    pub fn same_members(&self, other: &MembershipSnapshot) -> bool {
        self.instances == other.instances
    }

    /// Whether applying `event` would be a no-op.
    pub fn is_stale(&self, event: &MembershipChangeEvent) -> bool {
        let revision = event.revision();
        if revision <= self.base_revision || revision <= self.stale_floor {
            return true;
        }
        self.applied
            .get(event.instance_id())
            .is_some_and(|last| revision <= *last)
    }

    /// Apply one event. Returns false if it was stale.
    pub fn apply(&mut self, event: &MembershipChangeEvent) -> bool {
        if self.is_stale(event) {
            return false;
        }

        match event {
            MembershipChangeEvent::Put {
                instance_id,
                record,
                revision,
            } => {
                self.instances.insert(instance_id.clone(), record.clone());
                self.applied.insert(instance_id.clone(), *revision);
            }
            MembershipChangeEvent::Delete {
                instance_id,
                revision,
            } => {
                self.instances.remove(instance_id);
                self.applied.insert(instance_id.clone(), *revision);
                self.tombstones.push_back((instance_id.clone(), *revision));
                self.evict_tombstones();
            }
        }

        self.revision = self.revision.max(event.revision());
        true
    }

    fn evict_tombstones(&mut self) {
        while self.tombstones.len() > self.tombstone_limit {
            let Some((instance_id, revision)) = self.tombstones.pop_front() else {
                break;
            };
            // A later put or delete owns the entry now
            if self.applied.get(&instance_id) == Some(&revision) {
                self.applied.remove(&instance_id);
            }
            self.stale_floor = self.stale_floor.max(revision);
        }
    }
}
