//! In-process coordinator backend.
//!
//! Implements the full [`CoordinatorClient`] contract in memory: a global
//! revision counter, TTL leases bound to keys, prefix watches with history
//! replay and compaction. Faults can be injected for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::stream::{WatchSender, WatchStream};
use crate::traits::{CoordinatorClient, CoordinatorError};
use crate::types::*;

/// Configuration for the in-memory coordinator.
#[derive(Debug, Clone)]
pub struct MemoryCoordinatorConfig {
    /// Maximum number of events kept for watch replay
    pub history_limit: usize,
}

impl Default for MemoryCoordinatorConfig {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
        }
    }
}

/// In-memory coordinator.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: MemoryCoordinatorConfig,
    state: Mutex<Store>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_puts: AtomicU32,
    fail_gets: AtomicU32,
    fail_keep_alives: AtomicBool,
    put_attempts: AtomicU64,
    keep_alive_attempts: AtomicU64,
}

struct LeaseEntry {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    sender: WatchSender,
}

#[derive(Default)]
struct Store {
    revision: Revision,
    next_lease: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchEvent>,
    // Events at or below this revision are no longer replayable
    compact_revision: Revision,
    watchers: Vec<Watcher>,
}

impl Store {
    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> WatchEvent {
        self.revision += 1;
        let revision = self.revision;

        let previous = self.kvs.get(key).cloned();
        if let Some(old_lease) = previous.as_ref().and_then(|kv| kv.lease) {
            if Some(old_lease) != lease {
                if let Some(entry) = self.leases.get_mut(&old_lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(entry) = self.leases.get_mut(&id) {
                entry.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: previous.map(|kv| kv.create_revision).unwrap_or(revision),
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());

        WatchEvent {
            kind: EventKind::Put,
            kv,
        }
    }

    fn delete(&mut self, key: &str) -> Option<WatchEvent> {
        let removed = self.kvs.remove(key)?;
        if let Some(entry) = removed.lease.and_then(|id| self.leases.get_mut(&id)) {
            entry.keys.remove(key);
        }

        self.revision += 1;
        Some(WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: removed.key,
                value: Vec::new(),
                create_revision: removed.create_revision,
                mod_revision: self.revision,
                lease: removed.lease,
            },
        })
    }

    /// Drop a lease and delete every key bound to it.
    fn drop_lease(&mut self, id: LeaseId) -> Option<Vec<WatchEvent>> {
        let entry = self.leases.remove(&id)?;
        Some(entry.keys.iter().filter_map(|key| self.delete(key)).collect())
    }

    fn purge_expired(&mut self, now: Instant, history_limit: usize) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            debug!(lease_id = %id, "Lease expired");
            if let Some(events) = self.drop_lease(*id) {
                self.record(events, history_limit);
            }
        }

        expired.len()
    }

    /// Append events to history and fan them out to matching watchers.
    fn record(&mut self, events: Vec<WatchEvent>, history_limit: usize) {
        if events.is_empty() {
            return;
        }

        for event in &events {
            self.history.push_back(event.clone());
        }
        while self.history.len() > history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.compact_revision = evicted.revision();
            }
        }

        self.watchers.retain(|watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.kv.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(WatchBatch { events: matching }).is_ok()
        });
    }
}

impl MemoryCoordinator {
    /// Create a new empty coordinator.
    pub fn new() -> Self {
        Self::with_config(MemoryCoordinatorConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(config: MemoryCoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(Store::default()),
                faults: Faults::default(),
            }),
        }
    }

    /// Spawn a task that purges expired leases every `interval`.
    ///
    /// The task stops on its own once every clone of the coordinator is dropped.
    pub fn spawn_expiry_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let Some(inner) = weak.upgrade() else {
                    trace!("Coordinator dropped, reaper exiting");
                    break;
                };
                let mut state = inner.state.lock().await;
                let purged = state.purge_expired(Instant::now(), inner.config.history_limit);
                if purged > 0 {
                    debug!(purged, "Reaped expired leases");
                }
            }
        })
    }

    /// Make every call fail with `Unavailable` (or restore service).
    pub fn set_available(&self, available: bool) {
        self.inner
            .faults
            .unavailable
            .store(!available, Ordering::SeqCst);
        info!(available, "Coordinator availability changed");
    }

    /// Fail the next `n` puts with `Unavailable`.
    pub fn fail_next_puts(&self, n: u32) {
        self.inner.faults.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` prefix reads with `Unavailable`.
    pub fn fail_next_gets(&self, n: u32) {
        self.inner.faults.fail_gets.store(n, Ordering::SeqCst);
    }

    /// Make keepalives fail with `Unavailable` while set.
    pub fn fail_keep_alives(&self, fail: bool) {
        self.inner
            .faults
            .fail_keep_alives
            .store(fail, Ordering::SeqCst);
    }

    /// Drop every open watch, ending their streams.
    pub async fn disconnect_watchers(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let count = state.watchers.len();
        state.watchers.clear();
        info!(count, "Disconnected watchers");
        count
    }

    /// Number of watches still attached.
    pub async fn watcher_count(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        state.watchers.retain(|w| !w.sender.is_closed());
        state.watchers.len()
    }

    /// Number of put calls made, including failed ones.
    pub fn put_attempts(&self) -> u64 {
        self.inner.faults.put_attempts.load(Ordering::SeqCst)
    }

    /// Number of keepalive calls made, including failed ones.
    pub fn keep_alive_attempts(&self) -> u64 {
        self.inner.faults.keep_alive_attempts.load(Ordering::SeqCst)
    }

    /// Current store revision.
    pub async fn revision(&self) -> Revision {
        self.inner.state.lock().await.revision
    }

    /// Whether a lease is still alive.
    pub async fn lease_exists(&self, id: LeaseId) -> bool {
        let mut state = self.inner.state.lock().await;
        state.purge_expired(Instant::now(), self.inner.config.history_limit);
        state.leases.contains_key(&id)
    }

    fn check_available(&self) -> Result<(), CoordinatorError> {
        if self.inner.faults.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Unavailable(
                "coordinator offline".to_string(),
            ));
        }
        Ok(())
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinatorClient for MemoryCoordinator {
    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse, CoordinatorError> {
        self.check_available()?;
        if Self::take_fault(&self.inner.faults.fail_gets) {
            return Err(CoordinatorError::Unavailable("injected get failure".to_string()));
        }

        let mut state = self.inner.state.lock().await;
        state.purge_expired(Instant::now(), self.inner.config.history_limit);

        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();

        Ok(GetResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, CoordinatorError> {
        self.inner.faults.put_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if Self::take_fault(&self.inner.faults.fail_puts) {
            return Err(CoordinatorError::Unavailable("injected put failure".to_string()));
        }
        if key.is_empty() {
            return Err(CoordinatorError::InvalidArgument("empty key".to_string()));
        }

        let mut state = self.inner.state.lock().await;
        let limit = self.inner.config.history_limit;
        state.purge_expired(Instant::now(), limit);

        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(CoordinatorError::LeaseNotFound(id));
            }
        }

        let event = state.put(key, value, lease);
        let revision = event.revision();
        state.record(vec![event], limit);

        trace!(key, revision, "Put");
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<DeleteResponse, CoordinatorError> {
        self.check_available()?;

        let mut state = self.inner.state.lock().await;
        let limit = self.inner.config.history_limit;
        state.purge_expired(Instant::now(), limit);

        match state.delete(key) {
            Some(event) => {
                let revision = event.revision();
                state.record(vec![event], limit);
                Ok(DeleteResponse {
                    revision,
                    deleted: 1,
                })
            }
            None => Ok(DeleteResponse {
                revision: state.revision,
                deleted: 0,
            }),
        }
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseGrant, CoordinatorError> {
        self.check_available()?;
        if ttl_secs <= 0 {
            return Err(CoordinatorError::InvalidArgument(format!(
                "ttl must be positive, got {ttl_secs}"
            )));
        }

        let mut state = self.inner.state.lock().await;
        state.next_lease += 1;
        let id = LeaseId(state.next_lease);
        state.leases.insert(
            id,
            LeaseEntry {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
            },
        );

        debug!(lease_id = %id, ttl_secs, "Granted lease");
        Ok(LeaseGrant { id, ttl_secs })
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<i64, CoordinatorError> {
        self.inner
            .faults
            .keep_alive_attempts
            .fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.inner.faults.fail_keep_alives.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Unavailable(
                "injected keepalive failure".to_string(),
            ));
        }

        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        state.purge_expired(now, self.inner.config.history_limit);

        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(CoordinatorError::LeaseNotFound(lease))?;
        entry.deadline = now + Duration::from_secs(entry.ttl_secs as u64);

        Ok(entry.ttl_secs)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        self.check_available()?;

        let mut state = self.inner.state.lock().await;
        let limit = self.inner.config.history_limit;
        state.purge_expired(Instant::now(), limit);

        let events = state
            .drop_lease(lease)
            .ok_or(CoordinatorError::LeaseNotFound(lease))?;
        state.record(events, limit);

        debug!(lease_id = %lease, "Revoked lease");
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
        from_revision: Revision,
    ) -> Result<WatchStream, CoordinatorError> {
        self.check_available()?;

        let mut state = self.inner.state.lock().await;
        state.purge_expired(Instant::now(), self.inner.config.history_limit);

        // Revision 0 and below mean "from the first revision"
        let start = from_revision.max(1);
        if start <= state.compact_revision {
            return Err(CoordinatorError::Compacted {
                requested: from_revision,
                compacted: state.compact_revision + 1,
            });
        }

        let (sender, stream) = WatchStream::channel();

        // Replay under the same lock so nothing lands between backfill and live
        let backlog: Vec<WatchEvent> = state
            .history
            .iter()
            .filter(|e| e.revision() >= start && e.kv.key.starts_with(prefix))
            .cloned()
            .collect();
        if !backlog.is_empty() {
            let _ = sender.send(WatchBatch { events: backlog });
        }

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });

        debug!(prefix, from_revision, "Watch opened");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_put_get_delete_revisions() {
        let store = MemoryCoordinator::new();

        let r1 = store.put("services/order/1", b"a".to_vec(), None).await.unwrap();
        let r2 = store.put("services/order/2", b"b".to_vec(), None).await.unwrap();
        store.put("services/orders/9", b"x".to_vec(), None).await.unwrap();
        assert!(r2 > r1);

        let listed = store.get_prefix("services/order/").await.unwrap();
        assert_eq!(listed.kvs.len(), 2);
        assert_eq!(listed.revision, 3);

        let deleted = store.delete("services/order/1").await.unwrap();
        assert_eq!(deleted.deleted, 1);
        assert_eq!(deleted.revision, 4);

        let again = store.delete("services/order/1").await.unwrap();
        assert_eq!(again.deleted, 0);
        assert_eq!(again.revision, 4);
    }

    #[tokio::test]
    async fn test_put_preserves_create_revision() {
        let store = MemoryCoordinator::new();
        store.put("k", b"1".to_vec(), None).await.unwrap();
        store.put("k", b"2".to_vec(), None).await.unwrap();

        let kv = &store.get_prefix("k").await.unwrap().kvs[0];
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);
        assert_eq!(kv.value, b"2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_keys() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(2).await.unwrap();
        store
            .put("services/order/1", b"a".to_vec(), Some(lease.id))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.get_prefix("services/").await.unwrap().kvs.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get_prefix("services/").await.unwrap().kvs.is_empty());
        assert_eq!(
            store.keep_alive_once(lease.id).await,
            Err(CoordinatorError::LeaseNotFound(lease.id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(2).await.unwrap();
        store.put("k", b"a".to_vec(), Some(lease.id)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(store.keep_alive_once(lease.id).await, Ok(2));
        }

        assert_eq!(store.get_prefix("k").await.unwrap().kvs.len(), 1);
        assert_eq!(store.keep_alive_attempts(), 5);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryCoordinator::new();
        let result = store.put("k", b"a".to_vec(), Some(LeaseId(42))).await;
        assert_eq!(result, Err(CoordinatorError::LeaseNotFound(LeaseId(42))));
    }

    #[tokio::test]
    async fn test_grant_rejects_non_positive_ttl() {
        let store = MemoryCoordinator::new();
        assert_err!(store.grant(0).await);
        assert_ok!(store.grant(1).await);
    }

    #[tokio::test]
    async fn test_revoke_emits_deletes() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(30).await.unwrap();
        store.put("p/a", b"1".to_vec(), Some(lease.id)).await.unwrap();
        store.put("p/b", b"2".to_vec(), Some(lease.id)).await.unwrap();

        let mut watch = store.watch("p/", 3).await.unwrap();
        store.revoke(lease.id).await.unwrap();

        let batch = watch.next().await.unwrap();
        assert_eq!(batch.events.len(), 2);
        assert!(batch.events.iter().all(|e| e.kind == EventKind::Delete));
        assert!(store.get_prefix("p/").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_watch_replays_history_then_streams() {
        let store = MemoryCoordinator::new();
        store.put("p/a", b"1".to_vec(), None).await.unwrap();
        store.put("q/x", b"1".to_vec(), None).await.unwrap();
        store.put("p/b", b"2".to_vec(), None).await.unwrap();

        let mut watch = store.watch("p/", 2).await.unwrap();

        let backlog = watch.next().await.unwrap();
        assert_eq!(backlog.events.len(), 1);
        assert_eq!(backlog.events[0].kv.key, "p/b");

        store.delete("p/a").await.unwrap();
        let live = watch.next().await.unwrap();
        assert_eq!(live.events[0].kind, EventKind::Delete);
        assert_eq!(live.events[0].revision(), 4);
    }

    #[tokio::test]
    async fn test_watch_compacted_revision() {
        let store = MemoryCoordinator::with_config(MemoryCoordinatorConfig { history_limit: 2 });
        for i in 0..5 {
            store.put(&format!("p/{i}"), b"v".to_vec(), None).await.unwrap();
        }

        let result = store.watch("p/", 1).await;
        assert!(matches!(result, Err(CoordinatorError::Compacted { .. })));
        assert_ok!(store.watch("p/", 4).await);
    }

    #[tokio::test]
    async fn test_watch_from_zero_replays_everything() {
        let store = MemoryCoordinator::new();
        assert_ok!(store.watch("p/", 0).await);

        store.put("p/a", b"1".to_vec(), None).await.unwrap();
        store.put("p/b", b"2".to_vec(), None).await.unwrap();
        let mut watch = assert_ok!(store.watch("p/", 0).await);
        let backlog = watch.next().await.unwrap();
        assert_eq!(backlog.events.len(), 2);
        assert_eq!(backlog.events[0].revision(), 1);

        let compacted = MemoryCoordinator::with_config(MemoryCoordinatorConfig { history_limit: 1 });
        compacted.put("p/a", b"1".to_vec(), None).await.unwrap();
        compacted.put("p/b", b"2".to_vec(), None).await.unwrap();
        assert!(matches!(
            compacted.watch("p/", 0).await,
            Err(CoordinatorError::Compacted { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let store = MemoryCoordinator::new();
        let mut watch = store.watch("p/", 1).await.unwrap();
        assert_eq!(store.watcher_count().await, 1);

        store.disconnect_watchers().await;
        assert!(watch.next().await.is_none());
        assert_eq!(store.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryCoordinator::new();

        store.fail_next_puts(2);
        assert_err!(store.put("k", b"a".to_vec(), None).await);
        assert_err!(store.put("k", b"a".to_vec(), None).await);
        assert_ok!(store.put("k", b"a".to_vec(), None).await);
        assert_eq!(store.put_attempts(), 3);

        store.set_available(false);
        let err = store.get_prefix("k").await.unwrap_err();
        assert!(err.is_transient());
        store.set_available(true);
        assert_ok!(store.get_prefix("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_purges_without_traffic() {
        let store = MemoryCoordinator::new();
        let reaper = store.spawn_expiry_reaper(Duration::from_millis(100));

        let lease = store.grant(1).await.unwrap();
        store.put("p/a", b"1".to_vec(), Some(lease.id)).await.unwrap();
        let mut watch = store.watch("p/", 2).await.unwrap();

        let batch = watch.next().await.unwrap();
        assert_eq!(batch.events[0].kind, EventKind::Delete);

        drop(store);
        drop(watch);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reaper.is_finished());
    }
}
