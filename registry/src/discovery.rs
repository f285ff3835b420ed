//! Discoverer - resolves and tracks the live members of a service.
//!
//! ## Tracking
//!
//! A tracker task lists the service prefix, then watches it from the listing
//! revision + 1 so nothing in between is missed. Each ready batch of changes
//! is folded into a copy of the current [`MembershipSnapshot`] and published
//! whole, so readers never observe a partially applied batch.
//!
//! When the watch ends or cannot be opened the tracker reports
//! `Disconnected`, re-lists and resumes. After `max_resync_attempts` failed
//! attempts it reports `Unrecoverable` and stops updating.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use coordinator::{CoordinatorClient, EventKind, Revision, WatchEvent, WatchStream};

use crate::config::{BackoffConfig, DiscoveryConfig};
use crate::snapshot::{MembershipChangeEvent, MembershipSnapshot};
use crate::types::{validate_name, InstanceRecord, KeyLayout, RegistryError, Result};

/// Most change events folded into one published snapshot
const MAX_BATCH: usize = 256;

/// State of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackStatus {
    /// Initial listing in progress
    Syncing,
    /// Watching; the snapshot is current
    Live,
    /// Watch lost; re-listing
    Disconnected,
    /// Resync budget exhausted; the snapshot is frozen
    Unrecoverable,
    /// Stopped on request
    Stopped,
}

impl TrackStatus {
    /// The tracker no longer updates its snapshot.
    pub fn is_final(self) -> bool {
        matches!(self, TrackStatus::Unrecoverable | TrackStatus::Stopped)
    }
}

/// Notifications from a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Initial listing applied
    Synced {
        service: String,
        revision: Revision,
        members: usize,
    },
    /// Watch ended; `revision` is the last one applied
    Disconnected { service: String, revision: Revision },
    /// Snapshot rebuilt from a fresh listing after a disconnect
    Resynced {
        service: String,
        revision: Revision,
        members: usize,
    },
    /// Gave up after `attempts` failed listings
    Unrecoverable { service: String, attempts: u32 },
}

pin_project! {
    /// Decoded change stream for one service.
    ///
    /// Ends only when the underlying watch ends. A record that fails to decode
    /// is reported as a delete of its instance, matching how `list` skips it.
    pub struct MembershipStream {
        #[pin]
        inner: WatchStream,
        service: String,
        layout: KeyLayout,
        pending: VecDeque<MembershipChangeEvent>,
    }
}

impl MembershipStream {
    fn new(inner: WatchStream, service: String, layout: KeyLayout) -> Self {
        Self {
            inner,
            service,
            layout,
            pending: VecDeque::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Highest backend revision received so far.
    pub fn last_revision(&self) -> Option<Revision> {
        self.inner.last_revision()
    }
}

impl Stream for MembershipStream {
    type Item = MembershipChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }

            match futures::ready!(this.inner.as_mut().poll_next(cx)) {
                Some(batch) => {
                    for event in batch.events {
                        if let Some(change) = decode_event(this.layout, this.service, event) {
                            this.pending.push_back(change);
                        }
                    }
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

fn decode_event(
    layout: &KeyLayout,
    service: &str,
    event: WatchEvent,
) -> Option<MembershipChangeEvent> {
    let revision = event.revision();
    let instance_id = layout.instance_id(service, &event.kv.key)?.to_string();

    match event.kind {
        EventKind::Put => match InstanceRecord::decode(&event.kv.key, &event.kv.value) {
            Ok(record) => Some(MembershipChangeEvent::Put {
                instance_id,
                record,
                revision,
            }),
            Err(e) => {
                warn!(error = %e, "Undecodable record, treating instance as absent");
                Some(MembershipChangeEvent::Delete {
                    instance_id,
                    revision,
                })
            }
        },
        EventKind::Delete => Some(MembershipChangeEvent::Delete {
            instance_id,
            revision,
        }),
    }
}

/// List `service` once.
async fn list_once(
    client: &dyn CoordinatorClient,
    layout: &KeyLayout,
    service: &str,
) -> Result<MembershipSnapshot> {
    let response = client.get_prefix(&layout.service_prefix(service)).await?;

    let entries = response.kvs.into_iter().filter_map(|kv| {
        let instance_id = layout.instance_id(service, &kv.key)?.to_string();
        match InstanceRecord::decode(&kv.key, &kv.value) {
            Ok(record) => Some((instance_id, record, kv.mod_revision)),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable record");
                None
            }
        }
    });

    Ok(MembershipSnapshot::from_listing(
        service,
        response.revision,
        entries,
    ))
}

/// List with up to `attempts` tries, sleeping per `backoff` in between.
async fn list_with_retry(
    client: &dyn CoordinatorClient,
    layout: &KeyLayout,
    service: &str,
    attempts: u32,
    backoff: &BackoffConfig,
) -> Result<MembershipSnapshot> {
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match list_once(client, layout, service).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(service, attempt, error = %e, "Listing failed, retrying");
                tokio::time::sleep(backoff.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolves service members and keeps live views of them.
pub struct Discoverer {
    client: Arc<dyn CoordinatorClient>,
    layout: KeyLayout,
    config: DiscoveryConfig,
    tracked: DashMap<String, TrackedMembership>,
}

impl Discoverer {
    /// Create a discoverer over `client`.
    pub fn new(client: Arc<dyn CoordinatorClient>, layout: KeyLayout, config: DiscoveryConfig) -> Self {
        Self {
            client,
            layout,
            config,
            tracked: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Current members of `service`.
    pub async fn list(&self, service: &str) -> Result<MembershipSnapshot> {
        validate_name("service name", service)?;
        list_with_retry(
            &*self.client,
            &self.layout,
            service,
            self.config.list_attempts,
            &self.config.backoff,
        )
        .await
    }

    /// Changes to `service` from `from_revision` on.
    pub async fn watch(&self, service: &str, from_revision: Revision) -> Result<MembershipStream> {
        validate_name("service name", service)?;
        let stream = self
            .client
            .watch(&self.layout.service_prefix(service), from_revision)
            .await?;
        Ok(MembershipStream::new(
            stream,
            service.to_string(),
            self.layout.clone(),
        ))
    }

    /// Live view of `service`, maintained in the background.
    ///
    /// Returns at once; the first snapshot is empty until the initial listing
    /// lands. Repeated calls share one tracker while it is running.
    pub fn track(&self, service: &str) -> Result<TrackedMembership> {
        validate_name("service name", service)?;

        let tracked = match self.tracked.entry(service.to_string()) {
            Entry::Occupied(entry) if !entry.get().status().is_final() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let tracked = self.spawn_tracker(service);
                entry.insert(tracked.clone());
                tracked
            }
            Entry::Vacant(entry) => entry.insert(self.spawn_tracker(service)).clone(),
        };
        Ok(tracked)
    }

    /// Stop tracking `service`. Returns false if it was not tracked.
    pub async fn untrack(&self, service: &str) -> bool {
        match self.tracked.remove(service) {
            Some((_, tracked)) => {
                tracked.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every tracker.
    pub async fn untrack_all(&self) {
        let services: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        for service in services {
            self.untrack(&service).await;
        }
    }

    /// Services with a tracker, running or not.
    pub fn tracked_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    fn spawn_tracker(&self, service: &str) -> TrackedMembership {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MembershipSnapshot::empty(service)));
        let (status_tx, status_rx) = watch::channel(TrackStatus::Syncing);
        let (events, _) = broadcast::channel(self.config.event_buffer.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let tracker = Tracker {
            client: Arc::clone(&self.client),
            layout: self.layout.clone(),
            config: self.config.clone(),
            service: service.to_string(),
            snapshot: snapshot_tx,
            status: status_tx,
            events: events.clone(),
        };
        info!(service, "Tracking service membership");
        let task = tokio::spawn(tracker.run(cancel_rx));

        TrackedMembership {
            shared: Arc::new(TrackerShared {
                service: service.to_string(),
                max_resync_attempts: self.config.max_resync_attempts,
                snapshot: snapshot_rx,
                status: status_rx,
                events,
                cancel: Mutex::new(Some(cancel_tx)),
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }
}

/// Live, locally cached membership of one service.
///
/// Cheap to clone; clones observe the same tracker.
#[derive(Clone)]
pub struct TrackedMembership {
    shared: Arc<TrackerShared>,
}

struct TrackerShared {
    service: String,
    max_resync_attempts: u32,
    snapshot: watch::Receiver<Arc<MembershipSnapshot>>,
    status: watch::Receiver<TrackStatus>,
    events: broadcast::Sender<DiscoveryEvent>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TrackedMembership {
    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// Latest complete snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        Arc::clone(&self.shared.snapshot.borrow())
    }

    pub fn status(&self) -> TrackStatus {
        *self.shared.status.borrow()
    }

    /// Wait for the next published snapshot. `None` once the tracker has ended.
    pub async fn changed(&self) -> Option<Arc<MembershipSnapshot>> {
        let mut rx = self.shared.snapshot.clone();
        drop(rx.borrow_and_update());
        rx.changed().await.ok()?;
        let snapshot = Arc::clone(&rx.borrow_and_update());
        Some(snapshot)
    }

    /// Wait until a snapshot satisfies `predicate`.
    ///
    /// Fails if the tracker ends before that happens.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<Arc<MembershipSnapshot>>
    where
        F: FnMut(&MembershipSnapshot) -> bool,
    {
        let mut rx = self.shared.snapshot.clone();
        let result = rx.wait_for(|snapshot| predicate(snapshot.as_ref())).await;
        match result {
            Ok(snapshot) => Ok(Arc::clone(&snapshot)),
            Err(_) if self.status() == TrackStatus::Unrecoverable => Err(RegistryError::Unrecoverable {
                service: self.shared.service.clone(),
                attempts: self.shared.max_resync_attempts,
            }),
            Err(_) => Err(RegistryError::Disconnected {
                service: self.shared.service.clone(),
            }),
        }
    }

    /// Receiver observing status changes.
    pub fn status_receiver(&self) -> watch::Receiver<TrackStatus> {
        self.shared.status.clone()
    }

    /// Subscribe to tracker notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the tracker and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let cancel = self
            .shared
            .cancel
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or_default();
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }

        let task = self.shared.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(service = %self.shared.service, error = %e, "Tracker task panicked");
            }
        }
    }
}

/// Background task owning the write side of one [`TrackedMembership`].
struct Tracker {
    client: Arc<dyn CoordinatorClient>,
    layout: KeyLayout,
    config: DiscoveryConfig,
    service: String,
    snapshot: watch::Sender<Arc<MembershipSnapshot>>,
    status: watch::Sender<TrackStatus>,
    events: broadcast::Sender<DiscoveryEvent>,
}

/// Why a watch session ended.
enum SessionEnd {
    Disconnected(Revision),
    Cancelled,
}

impl Tracker {
    async fn run(self, mut cancel: oneshot::Receiver<()>) {
        let mut resyncing = false;

        loop {
            let connected = tokio::select! {
                _ = &mut cancel => {
                    self.finish(TrackStatus::Stopped);
                    return;
                }
                connected = self.connect() => connected,
            };

            let (snapshot, stream) = match connected {
                Ok(connected) => connected,
                Err(attempts) => {
                    error!(service = %self.service, attempts, "Membership tracking unrecoverable");
                    let _ = self.events.send(DiscoveryEvent::Unrecoverable {
                        service: self.service.clone(),
                        attempts,
                    });
                    self.finish(TrackStatus::Unrecoverable);
                    return;
                }
            };

            let (revision, members) = (snapshot.revision(), snapshot.len());
            let snapshot = Arc::new(snapshot);
            self.snapshot.send_replace(Arc::clone(&snapshot));
            self.status.send_replace(TrackStatus::Live);

            let event = if resyncing {
                info!(service = %self.service, revision, members, "Membership resynced");
                DiscoveryEvent::Resynced {
                    service: self.service.clone(),
                    revision,
                    members,
                }
            } else {
                info!(service = %self.service, revision, members, "Membership synced");
                DiscoveryEvent::Synced {
                    service: self.service.clone(),
                    revision,
                    members,
                }
            };
            let _ = self.events.send(event);

            match self.follow(snapshot, stream, &mut cancel).await {
                SessionEnd::Cancelled => {
                    self.finish(TrackStatus::Stopped);
                    return;
                }
                SessionEnd::Disconnected(revision) => {
                    warn!(service = %self.service, revision, "Membership watch disconnected");
                    self.status.send_replace(TrackStatus::Disconnected);
                    let _ = self.events.send(DiscoveryEvent::Disconnected {
                        service: self.service.clone(),
                        revision,
                    });
                    resyncing = true;
                }
            }
        }
    }

    /// List then open a watch right after the listing revision.
    ///
    /// Each failed list or failed watch open uses one attempt of the budget.
    async fn connect(&self) -> std::result::Result<(MembershipSnapshot, MembershipStream), u32> {
        let attempts = self.config.max_resync_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.backoff.delay_for(attempt - 1)).await;
            }

            let snapshot = match list_once(&*self.client, &self.layout, &self.service).await {
                Ok(snapshot) => snapshot.with_tombstone_limit(self.config.tombstone_limit),
                Err(e) => {
                    warn!(service = %self.service, attempt, error = %e, "Membership listing failed");
                    continue;
                }
            };

            let prefix = self.layout.service_prefix(&self.service);
            match self.client.watch(&prefix, snapshot.revision() + 1).await {
                Ok(stream) => {
                    let stream =
                        MembershipStream::new(stream, self.service.clone(), self.layout.clone());
                    return Ok((snapshot, stream));
                }
                Err(e) => {
                    warn!(service = %self.service, attempt, error = %e, "Opening membership watch failed");
                }
            }
        }

        Err(attempts)
    }

    /// Fold the stream into the snapshot until it ends or we are cancelled.
    async fn follow(
        &self,
        mut current: Arc<MembershipSnapshot>,
        stream: MembershipStream,
        cancel: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let mut batches = stream.ready_chunks(MAX_BATCH);

        loop {
            let batch = tokio::select! {
                _ = &mut *cancel => return SessionEnd::Cancelled,
                batch = batches.next() => batch,
            };
            let Some(batch) = batch else {
                return SessionEnd::Disconnected(current.revision());
            };

            let mut next = MembershipSnapshot::clone(&current);
            let received = batch.len();
            let applied = batch.iter().filter(|event| next.apply(event)).count();
            debug!(
                service = %self.service,
                received,
                applied,
                revision = next.revision(),
                "Applied membership changes"
            );

            if applied > 0 {
                current = Arc::new(next);
                self.snapshot.send_replace(Arc::clone(&current));
            }
        }
    }

    fn finish(&self, status: TrackStatus) {
        debug!(service = %self.service, status = ?status, "Tracker exiting");
        self.status.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator::{MemoryCoordinator, MemoryCoordinatorConfig};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(30);

    fn discoverer(store: &MemoryCoordinator, config: DiscoveryConfig) -> Discoverer {
        Discoverer::new(Arc::new(store.clone()), KeyLayout::default(), config)
    }

    async fn put_record(store: &MemoryCoordinator, service: &str, id: &str, host: &str) -> Revision {
        let record = InstanceRecord::new(host, 8080).encode().unwrap();
        store
            .put(&format!("services/{service}/{id}"), record, None)
            .await
            .unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<DiscoveryEvent>) -> DiscoveryEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_list_decodes_members() {
        let store = MemoryCoordinator::new();
        put_record(&store, "order", "1", "host1").await;
        put_record(&store, "order", "2", "host2").await;
        put_record(&store, "orders", "9", "other").await;
        store
            .put("services/order/3", b"garbage".to_vec(), None)
            .await
            .unwrap();

        let snapshot = discoverer(&store, DiscoveryConfig::default())
            .list("order")
            .await
            .unwrap();

        assert_eq!(snapshot.instance_ids(), vec!["1", "2"]);
        assert_eq!(snapshot.get("2").unwrap().host, "host2");
        assert_eq!(snapshot.revision(), store.revision().await);
    }

    #[tokio::test]
    async fn test_list_includes_records_from_other_writers() {
        let store = MemoryCoordinator::new();
        store
            .put("services/order/1", br#"{"host":"host1","port":8080}"#.to_vec(), None)
            .await
            .unwrap();
        store
            .put(
                "services/order/2",
                br#"{"host":"host2","port":8080,"metadata":{"weight":5}}"#.to_vec(),
                None,
            )
            .await
            .unwrap();

        let snapshot = discoverer(&store, DiscoveryConfig::default())
            .list("order")
            .await
            .unwrap();

        assert_eq!(snapshot.instance_ids(), vec!["1", "2"]);
        assert_eq!(snapshot.get("1").unwrap().endpoint(), "host1:8080");
        assert_eq!(snapshot.get("2").unwrap().metadata["weight"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_retries_transient_failures() {
        let store = MemoryCoordinator::new();
        put_record(&store, "order", "1", "host1").await;
        let discoverer = discoverer(&store, DiscoveryConfig::default());

        store.fail_next_gets(2);
        assert_eq!(discoverer.list("order").await.unwrap().len(), 1);

        store.fail_next_gets(3);
        assert!(matches!(
            discoverer.list("order").await,
            Err(RegistryError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_decodes_changes() {
        let store = MemoryCoordinator::new();
        let discoverer = discoverer(&store, DiscoveryConfig::default());
        let start = store.revision().await + 1;

        let put_rev = put_record(&store, "order", "1", "host1").await;
        let deleted = store.delete("services/order/1").await.unwrap();
        put_record(&store, "billing", "1", "host9").await;

        let mut stream = discoverer.watch("order", start).await.unwrap();
        match stream.next().await.unwrap() {
            MembershipChangeEvent::Put {
                instance_id,
                record,
                revision,
            } => {
                assert_eq!(instance_id, "1");
                assert_eq!(record.host, "host1");
                assert_eq!(revision, put_rev);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            stream.next().await.unwrap(),
            MembershipChangeEvent::Delete {
                instance_id: "1".to_string(),
                revision: deleted.revision,
            }
        );
        assert_eq!(stream.last_revision(), Some(deleted.revision));
    }

    #[tokio::test]
    async fn test_watch_from_zero_on_fresh_store() {
        let store = MemoryCoordinator::new();
        let discoverer = discoverer(&store, DiscoveryConfig::default());
        let mut stream = discoverer.watch("order", 0).await.unwrap();

        let revision = put_record(&store, "order", "1", "host1").await;
        assert!(matches!(
            stream.next().await.unwrap(),
            MembershipChangeEvent::Put { revision: r, .. } if r == revision
        ));
    }

    #[tokio::test]
    async fn test_watch_treats_garbage_as_delete() {
        let store = MemoryCoordinator::new();
        let discoverer = discoverer(&store, DiscoveryConfig::default());
        let mut stream = discoverer.watch("order", 1).await.unwrap();

        let revision = store
            .put("services/order/1", b"garbage".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap(),
            MembershipChangeEvent::Delete {
                instance_id: "1".to_string(),
                revision,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_follows_changes() {
        let store = MemoryCoordinator::new();
        put_record(&store, "order", "1", "host1").await;
        let discoverer = discoverer(&store, DiscoveryConfig::default());

        let tracked = discoverer.track("order").unwrap();
        let mut events = tracked.subscribe();
        assert!(matches!(
            next_event(&mut events).await,
            DiscoveryEvent::Synced { members: 1, .. }
        ));
        assert_eq!(tracked.status(), TrackStatus::Live);

        put_record(&store, "order", "2", "host2").await;
        store.delete("services/order/1").await.unwrap();

        let snapshot = timeout(WAIT, tracked.wait_for(|s| s.instance_ids() == vec!["2"]))
            .await
            .unwrap()
            .unwrap();
        let fresh = discoverer.list("order").await.unwrap();
        assert!(snapshot.same_members(&fresh));
        assert_eq!(snapshot.revision(), fresh.revision());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_reports_next_snapshot() {
        let store = MemoryCoordinator::new();
        let discoverer = discoverer(&store, DiscoveryConfig::default());
        let tracked = discoverer.track("order").unwrap();
        let mut events = tracked.subscribe();
        next_event(&mut events).await;

        let waiter = {
            let tracked = tracked.clone();
            tokio::spawn(async move { tracked.changed().await })
        };
        tokio::task::yield_now().await;
        put_record(&store, "order", "1", "host1").await;

        let snapshot = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
        assert!(snapshot.contains("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_is_shared_per_service() {
        let store = MemoryCoordinator::new();
        let discoverer = discoverer(&store, DiscoveryConfig::default());

        let first = discoverer.track("order").unwrap();
        let second = discoverer.track("order").unwrap();
        discoverer.track("billing").unwrap();

        assert!(Arc::ptr_eq(&first.shared, &second.shared));
        assert_eq!(discoverer.tracked_services(), vec!["billing", "order"]);

        assert!(discoverer.untrack("order").await);
        assert!(!discoverer.untrack("order").await);
        assert_eq!(first.status(), TrackStatus::Stopped);

        discoverer.untrack_all().await;
        assert!(discoverer.tracked_services().is_empty());
        assert_eq!(store.watcher_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resyncs_after_disconnect() {
        let store = MemoryCoordinator::new();
        put_record(&store, "order", "1", "host1").await;
        let discoverer = discoverer(&store, DiscoveryConfig::default());

        let tracked = discoverer.track("order").unwrap();
        let mut events = tracked.subscribe();
        next_event(&mut events).await;

        assert_eq!(store.disconnect_watchers().await, 1);
        put_record(&store, "order", "2", "host2").await;
        store.delete("services/order/1").await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            DiscoveryEvent::Disconnected { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            DiscoveryEvent::Resynced { .. }
        ));

        let snapshot = timeout(WAIT, tracked.wait_for(|s| s.instance_ids() == vec!["2"]))
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.same_members(&discoverer.list("order").await.unwrap()));
        assert_eq!(tracked.status(), TrackStatus::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_exhaustion_is_unrecoverable() {
        let store = MemoryCoordinator::new();
        put_record(&store, "order", "1", "host1").await;
        let config = DiscoveryConfig {
            max_resync_attempts: 2,
            ..Default::default()
        };
        let discoverer = discoverer(&store, config);

        let tracked = discoverer.track("order").unwrap();
        let mut events = tracked.subscribe();
        next_event(&mut events).await;

        store.set_available(false);
        store.disconnect_watchers().await;

        assert!(matches!(
            next_event(&mut events).await,
            DiscoveryEvent::Disconnected { .. }
        ));
        assert_eq!(
            next_event(&mut events).await,
            DiscoveryEvent::Unrecoverable {
                service: "order".to_string(),
                attempts: 2,
            }
        );
        assert_eq!(tracked.status(), TrackStatus::Unrecoverable);
        assert!(tracked.snapshot().contains("1"));
        assert!(matches!(
            tracked.wait_for(|s| s.len() == 5).await,
            Err(RegistryError::Unrecoverable { attempts: 2, .. })
        ));

        // A fresh track replaces the dead tracker
        store.set_available(true);
        let revived = discoverer.track("order").unwrap();
        assert!(!Arc::ptr_eq(&revived.shared, &tracked.shared));
        timeout(WAIT, revived.wait_for(|s| s.contains("1")))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_compacted_watch_relists() {
        let store = MemoryCoordinator::with_config(MemoryCoordinatorConfig { history_limit: 2 });
        put_record(&store, "order", "1", "host1").await;
        let discoverer = discoverer(&store, DiscoveryConfig::default());

        // Replay from revision 1 is gone once history rolls over
        for i in 0..5 {
            put_record(&store, "billing", &i.to_string(), "host").await;
        }
        assert!(discoverer.watch("order", 1).await.is_err());

        let tracked = discoverer.track("order").unwrap();
        timeout(WAIT, tracked.wait_for(|s| s.contains("1")))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_invalid_service() {
        let store = MemoryCoordinator::new();
        let discoverer = discoverer(&store, DiscoveryConfig::default());

        assert!(matches!(
            discoverer.track(""),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(discoverer.list("a/b").await.is_err());
    }
}
