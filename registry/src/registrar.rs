//! Registrar - publishes instances under a service name, bound to a lease.
//!
//! ## Registration Flow
//!
//! 1. Grant a lease through the [`LeaseManager`]
//! 2. Write the record at `<prefix>/<service>/<instance>` bound to the lease,
//!    retrying up to `max_attempts` times
//! 3. Start the lease keepalive
//! 4. Supervise: when the lease expires, run the whole flow again
//!
//! A registration that exhausts its attempts releases the lease it was
//! granted, so no record is left behind.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use coordinator::{CoordinatorClient, CoordinatorError, LeaseId};

use crate::config::{LeaseConfig, RegistrationConfig};
use crate::lease::{KeepAliveHandle, Lease, LeaseManager, LeaseState};
use crate::types::{validate_name, InstanceRecord, KeyLayout, RegistryError, Result, ServiceKey};

/// Capacity of the registrar-wide event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications about supervised registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// Initial registration succeeded
    Registered { key: ServiceKey, lease_id: LeaseId },
    /// The lease backing a registration expired or was revoked
    LeaseLost {
        key: ServiceKey,
        lease_id: LeaseId,
        state: LeaseState,
    },
    /// Visibility restored under a fresh lease
    Reregistered { key: ServiceKey, lease_id: LeaseId },
    /// A re-registration attempt exhausted its retries; supervision continues
    Failed { service: String, error: String },
    /// Registration removed on request
    Deregistered { key: ServiceKey },
}

/// Current state of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Record is published under a live lease
    Active { key: ServiceKey, lease_id: LeaseId },
    /// Lease was lost; re-registration in progress
    Recovering { last_key: ServiceKey },
    /// Stopped
    Deregistered,
}

/// What to publish, kept for re-registration.
struct RegistrationRequest {
    service: String,
    instance_id: Option<String>,
    payload: Vec<u8>,
    ttl_secs: i64,
}

impl RegistrationRequest {
    fn key_for(&self, lease: LeaseId) -> Result<ServiceKey> {
        match &self.instance_id {
            Some(id) => ServiceKey::new(self.service.clone(), id.clone()),
            None => ServiceKey::for_lease(self.service.clone(), lease),
        }
    }
}

/// A record written under a kept-alive lease.
struct ActiveRegistration {
    key: ServiceKey,
    keep_alive: KeepAliveHandle,
}

/// Fans registration events out to the registrar and the handle.
struct Notifier {
    registrar: broadcast::Sender<RegistrationEvent>,
    handle: broadcast::Sender<RegistrationEvent>,
}

impl Notifier {
    fn send(&self, event: RegistrationEvent) {
        // No subscribers is fine
        let _ = self.handle.send(event.clone());
        let _ = self.registrar.send(event);
    }
}

struct RegistrarInner {
    client: Arc<dyn CoordinatorClient>,
    leases: LeaseManager,
    layout: KeyLayout,
    config: RegistrationConfig,
    request_timeout: Duration,
    events: broadcast::Sender<RegistrationEvent>,
}

/// Handle to a supervised registration.
///
/// Cheap to clone. The registration stays up until
/// [`Registrar::deregister`] is called or the registrar shuts down.
#[derive(Clone)]
pub struct RegistrationHandle {
    id: u64,
    service: String,
    status: watch::Receiver<RegistrationStatus>,
    events: broadcast::Sender<RegistrationEvent>,
    control: Arc<HandleControl>,
}

impl fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

struct HandleControl {
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl RegistrationHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current status.
    pub fn status(&self) -> RegistrationStatus {
        self.status.borrow().clone()
    }

    /// Key the record is currently published at.
    pub fn current_key(&self) -> Option<ServiceKey> {
        match &*self.status.borrow() {
            RegistrationStatus::Active { key, .. } => Some(key.clone()),
            _ => None,
        }
    }

    /// Lease currently backing the record.
    pub fn current_lease(&self) -> Option<LeaseId> {
        match &*self.status.borrow() {
            RegistrationStatus::Active { lease_id, .. } => Some(*lease_id),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.status.borrow(), RegistrationStatus::Active { .. })
    }

    /// Subscribe to events of this registration.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.events.subscribe()
    }

    /// Receiver observing status changes.
    pub fn status_receiver(&self) -> watch::Receiver<RegistrationStatus> {
        self.status.clone()
    }

    /// Stop supervision and tear the registration down. Idempotent.
    async fn shutdown(&self) -> Result<()> {
        let sender = self
            .control
            .shutdown
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or_default();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }

        let task = self.control.task.lock().await.take();
        match task {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!(service = %self.service, error = %e, "Supervision task panicked");
                Ok(())
            }),
            None => Ok(()),
        }
    }
}

/// Registers service instances and keeps them visible.
pub struct Registrar {
    inner: Arc<RegistrarInner>,
    next_id: AtomicU64,
    registrations: DashMap<u64, RegistrationHandle>,
}

impl Registrar {
    /// Create a registrar over `client`.
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        layout: KeyLayout,
        lease_config: LeaseConfig,
        config: RegistrationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let request_timeout = lease_config.request_timeout();
        Self {
            inner: Arc::new(RegistrarInner {
                leases: LeaseManager::new(Arc::clone(&client), lease_config),
                client,
                layout,
                config,
                request_timeout,
                events,
            }),
            next_id: AtomicU64::new(1),
            registrations: DashMap::new(),
        }
    }

    /// Subscribe to registration events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.inner.events.subscribe()
    }

    /// Lease manager used for every registration.
    pub fn leases(&self) -> &LeaseManager {
        &self.inner.leases
    }

    /// Number of live registrations.
    pub fn active_count(&self) -> usize {
        self.registrations.len()
    }

    /// Register an instance whose id is derived from its lease.
    pub async fn register(
        &self,
        service: &str,
        record: InstanceRecord,
        ttl_secs: i64,
    ) -> Result<RegistrationHandle> {
        self.start(service, None, record, ttl_secs).await
    }

    /// Register an instance under a caller-chosen id.
    pub async fn register_instance(
        &self,
        service: &str,
        instance_id: &str,
        record: InstanceRecord,
        ttl_secs: i64,
    ) -> Result<RegistrationHandle> {
        self.start(service, Some(instance_id.to_string()), record, ttl_secs)
            .await
    }

    /// Stop a registration, revoke its lease and delete its key. Idempotent.
    pub async fn deregister(&self, handle: &RegistrationHandle) -> Result<()> {
        self.registrations.remove(&handle.id);
        handle.shutdown().await
    }

    /// Deregister everything; returns how many registrations were stopped.
    pub async fn deregister_all(&self) -> usize {
        let ids: Vec<u64> = self.registrations.iter().map(|entry| *entry.key()).collect();
        let mut stopped = 0;
        for id in ids {
            if let Some((_, handle)) = self.registrations.remove(&id) {
                if let Err(e) = handle.shutdown().await {
                    warn!(service = %handle.service, error = %e, "Deregistration incomplete");
                }
                stopped += 1;
            }
        }
        info!(stopped, "Deregistered all instances");
        stopped
    }

    async fn start(
        &self,
        service: &str,
        instance_id: Option<String>,
        record: InstanceRecord,
        ttl_secs: i64,
    ) -> Result<RegistrationHandle> {
        validate_name("service name", service)?;
        if let Some(id) = &instance_id {
            validate_name("instance id", id)?;
        }
        if ttl_secs <= 0 {
            return Err(RegistryError::InvalidTtl(ttl_secs));
        }

        let request = Arc::new(RegistrationRequest {
            service: service.to_string(),
            instance_id,
            payload: record.encode()?,
            ttl_secs,
        });

        let active = self.inner.establish(&request).await?;
        let (key, lease_id) = (active.key.clone(), active.keep_alive.lease().id);
        let _ = self.inner.events.send(RegistrationEvent::Registered {
            key: key.clone(),
            lease_id,
        });

        let (status_tx, status_rx) =
            watch::channel(RegistrationStatus::Active { key, lease_id });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let notifier = Notifier {
            registrar: self.inner.events.clone(),
            handle: events.clone(),
        };
        let task = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            request,
            active,
            status_tx,
            notifier,
            shutdown_rx,
        ));

        let handle = RegistrationHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            service: service.to_string(),
            status: status_rx,
            events,
            control: Arc::new(HandleControl {
                shutdown: Mutex::new(Some(shutdown_tx)),
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        };
        self.registrations.insert(handle.id, handle.clone());
        Ok(handle)
    }
}

impl RegistrarInner {
    /// Grant a lease and write the record, retrying the write.
    async fn establish(&self, request: &RegistrationRequest) -> Result<ActiveRegistration> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut lease: Option<Lease> = None;
        let mut last_error = String::from("no attempt made");
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            if attempts > 1 {
                let delay = self.config.backoff.delay_for(attempts - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let current = match lease {
                Some(current) => current,
                None => match self.leases.grant(request.ttl_secs).await {
                    Ok(granted) => *lease.insert(granted),
                    Err(e) if e.is_transient() => {
                        warn!(service = %request.service, attempt = attempts, error = %e, "Lease grant failed");
                        last_error = e.to_string();
                        continue;
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        break;
                    }
                },
            };

            let key = request.key_for(current.id)?;
            let raw_key = self.layout.key(&key);
            let put = tokio::time::timeout(
                self.request_timeout,
                self.client
                    .put(&raw_key, request.payload.clone(), Some(current.id)),
            )
            .await
            .unwrap_or_else(|_| Err(CoordinatorError::Unavailable("put timed out".to_string())));

            match put {
                Ok(revision) => {
                    info!(
                        key = %raw_key,
                        lease_id = %current.id,
                        revision,
                        attempt = attempts,
                        "Instance registered"
                    );
                    return Ok(ActiveRegistration {
                        key,
                        keep_alive: self.leases.start_keep_alive(current),
                    });
                }
                Err(CoordinatorError::LeaseNotFound(id)) => {
                    warn!(key = %raw_key, lease_id = %id, "Lease lapsed before write, granting a new one");
                    last_error = format!("lease {id} not found");
                    lease = None;
                }
                Err(e) if e.is_transient() => {
                    warn!(key = %raw_key, attempt = attempts, error = %e, "Registration write failed");
                    last_error = e.to_string();
                }
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        if let Some(granted) = lease {
            self.leases.release(granted).await;
        }

        error!(service = %request.service, attempts, error = %last_error, "Registration failed");
        Err(RegistryError::RegistrationFailed {
            service: request.service.clone(),
            attempts,
            last_error,
        })
    }

    /// Stop renewal, revoke the lease and delete the key.
    async fn teardown(&self, active: ActiveRegistration) -> Result<()> {
        let lease_id = active.keep_alive.lease().id;
        self.leases.stop(active.keep_alive).await;

        let raw_key = self.layout.key(&active.key);
        let deleted =
            tokio::time::timeout(self.request_timeout, self.client.delete(&raw_key))
                .await
                .unwrap_or_else(|_| {
                    Err(CoordinatorError::Unavailable("delete timed out".to_string()))
                })?;

        info!(key = %raw_key, lease_id = %lease_id, deleted = deleted.deleted, "Instance deregistered");
        Ok(())
    }
}

async fn supervise(
    inner: Arc<RegistrarInner>,
    request: Arc<RegistrationRequest>,
    mut active: ActiveRegistration,
    status: watch::Sender<RegistrationStatus>,
    notifier: Notifier,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        let state = tokio::select! {
            _ = &mut shutdown => {
                let key = active.key.clone();
                let result = inner.teardown(active).await;
                status.send_replace(RegistrationStatus::Deregistered);
                notifier.send(RegistrationEvent::Deregistered { key });
                return result;
            }
            state = active.keep_alive.state_changed() => state,
        };
        if state.is_live() {
            continue;
        }

        let lost_key = active.key.clone();
        let lost_lease = active.keep_alive.lease().id;
        warn!(key = %lost_key, lease_id = %lost_lease, state = ?state, "Registration lost its lease");
        notifier.send(RegistrationEvent::LeaseLost {
            key: lost_key.clone(),
            lease_id: lost_lease,
            state,
        });
        status.send_replace(RegistrationStatus::Recovering {
            last_key: lost_key.clone(),
        });
        // The backend already dropped the record along with the lease
        inner.leases.stop(active.keep_alive).await;

        let mut failures: u32 = 0;
        active = loop {
            let pending = inner.establish(&request);
            tokio::pin!(pending);
            let attempt = tokio::select! {
                _ = &mut shutdown => {
                    // Settle the in-flight attempt and remove whatever it published
                    let result = match pending.await {
                        Ok(restored) => inner.teardown(restored).await,
                        Err(_) => Ok(()),
                    };
                    status.send_replace(RegistrationStatus::Deregistered);
                    notifier.send(RegistrationEvent::Deregistered { key: lost_key });
                    return result;
                }
                attempt = &mut pending => attempt,
            };

            match attempt {
                Ok(restored) => {
                    info!(
                        key = %restored.key,
                        lease_id = %restored.keep_alive.lease().id,
                        failures,
                        "Registration restored"
                    );
                    notifier.send(RegistrationEvent::Reregistered {
                        key: restored.key.clone(),
                        lease_id: restored.keep_alive.lease().id,
                    });
                    status.send_replace(RegistrationStatus::Active {
                        key: restored.key.clone(),
                        lease_id: restored.keep_alive.lease().id,
                    });
                    break restored;
                }
                Err(e) => {
                    failures += 1;
                    notifier.send(RegistrationEvent::Failed {
                        service: request.service.clone(),
                        error: e.to_string(),
                    });
                    debug!(service = %request.service, failures, "Retrying re-registration after delay");
                    tokio::select! {
                        _ = &mut shutdown => {
                            status.send_replace(RegistrationStatus::Deregistered);
                            notifier.send(RegistrationEvent::Deregistered { key: lost_key });
                            return Ok(());
                        }
                        _ = tokio::time::sleep(inner.config.reregister_delay()) => {}
                    }
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use coordinator::MemoryCoordinator;
    use tokio::time::Instant;

    fn registrar(store: &MemoryCoordinator, config: RegistrationConfig) -> Registrar {
        Registrar::new(
            Arc::new(store.clone()),
            KeyLayout::default(),
            LeaseConfig::default(),
            config,
        )
    }

    fn record() -> InstanceRecord {
        InstanceRecord::new("host1", 80)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_publishes_under_lease_key() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        let published = record().with_metadata("zone", "eu-1");
        let handle = registrar
            .register("order", published.clone(), 30)
            .await
            .unwrap();
        let lease = handle.current_lease().unwrap();
        let key = handle.current_key().unwrap();

        assert_eq!(key.instance_id, lease.to_string());
        assert!(handle.is_active());

        let listed = store.get_prefix("services/order/").await.unwrap();
        assert_eq!(listed.kvs.len(), 1);
        assert_eq!(listed.kvs[0].key, format!("services/order/{lease}"));
        assert_eq!(listed.kvs[0].lease, Some(lease));
        assert_eq!(
            InstanceRecord::decode(&listed.kvs[0].key, &listed.kvs[0].value).unwrap(),
            published
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_instance_uses_given_id() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        let handle = registrar
            .register_instance("order", "1", record(), 30)
            .await
            .unwrap();
        assert_eq!(handle.current_key().unwrap().to_string(), "order:1");
        assert_eq!(
            store.get_prefix("services/order/1").await.unwrap().kvs.len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retried_until_success() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        store.fail_next_puts(2);
        let handle = registrar.register("order", record(), 30).await.unwrap();

        assert!(handle.is_active());
        assert_eq!(store.put_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_release_lease() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        store.fail_next_puts(3);
        let err = registrar.register("order", record(), 30).await.unwrap_err();

        match err {
            RegistryError::RegistrationFailed {
                service, attempts, ..
            } => {
                assert_eq!(service, "order");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.put_attempts(), 3);
        assert!(!store.lease_exists(LeaseId(1)).await);
        assert!(store.get_prefix("services/").await.unwrap().kvs.is_empty());
        assert_eq!(registrar.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let store = MemoryCoordinator::new();
        let config = RegistrationConfig {
            backoff: BackoffConfig {
                initial_delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: 1_000,
            },
            ..Default::default()
        };
        let registrar = registrar(&store, config);

        store.fail_next_puts(2);
        let started = Instant::now();
        registrar.register("order", record(), 30).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_failures_count_as_attempts() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        store.set_available(false);
        let err = registrar.register("order", record(), 30).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::RegistrationFailed { attempts: 3, .. }
        ));
        assert_eq!(store.put_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregisters_after_lease_loss() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());
        let mut events = registrar.subscribe();

        let handle = registrar.register("order", record(), 3).await.unwrap();
        let first_lease = handle.current_lease().unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::Registered { .. }
        ));

        store.revoke(first_lease).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::LeaseLost { lease_id, state: LeaseState::Expired, .. } if lease_id == first_lease
        ));
        let restored = match events.recv().await.unwrap() {
            RegistrationEvent::Reregistered { lease_id, .. } => lease_id,
            other => panic!("unexpected event: {other:?}"),
        };

        assert_ne!(restored, first_lease);
        assert_eq!(handle.current_lease(), Some(restored));
        let listed = store.get_prefix("services/order/").await.unwrap();
        assert_eq!(listed.kvs.len(), 1);
        assert_eq!(listed.kvs[0].key, format!("services/order/{restored}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reregistration_keeps_supervising() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());
        let mut events = registrar.subscribe();

        let handle = registrar
            .register_instance("order", "1", record(), 3)
            .await
            .unwrap();
        events.recv().await.unwrap();

        store.fail_next_puts(3);
        store.revoke(handle.current_lease().unwrap()).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::LeaseLost { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::Failed { .. }
        ));
        assert!(matches!(
            handle.status(),
            RegistrationStatus::Recovering { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::Reregistered { .. }
        ));
        assert!(handle.is_active());
        assert_eq!(
            store.get_prefix("services/order/1").await.unwrap().kvs.len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_during_recovery_cleans_up_attempt() {
        let store = MemoryCoordinator::new();
        let config = RegistrationConfig {
            backoff: BackoffConfig {
                initial_delay_ms: 1_000,
                multiplier: 1.0,
                max_delay_ms: 1_000,
            },
            ..Default::default()
        };
        let registrar = registrar(&store, config);

        let handle = registrar
            .register_instance("order", "1", record(), 3)
            .await
            .unwrap();
        let mut events = handle.subscribe();
        let first = handle.current_lease().unwrap();

        store.fail_next_puts(1);
        store.revoke(first).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::LeaseLost { .. }
        ));

        // Recovery has granted a lease and is backing off after a failed write
        tokio::time::sleep(Duration::from_millis(500)).await;
        let pending = LeaseId(first.0 + 1);
        assert!(store.lease_exists(pending).await);

        registrar.deregister(&handle).await.unwrap();
        assert_eq!(handle.status(), RegistrationStatus::Deregistered);
        assert!(!store.lease_exists(pending).await);
        assert!(store.get_prefix("services/").await.unwrap().kvs.is_empty());

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::Deregistered { .. }
        ));
    }

    #[tokio::test]
    async fn test_handle_debug_shows_status() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        let handle = registrar
            .register_instance("order", "1", record(), 30)
            .await
            .unwrap();
        let printed = format!("{handle:?}");
        assert!(printed.contains("RegistrationHandle"));
        assert!(printed.contains("\"order\""));
        assert!(printed.contains("Active"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_is_idempotent() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        let handle = registrar.register("order", record(), 30).await.unwrap();
        let lease = handle.current_lease().unwrap();
        let key = handle.current_key().unwrap();
        let mut events = handle.subscribe();

        registrar.deregister(&handle).await.unwrap();
        assert_eq!(handle.status(), RegistrationStatus::Deregistered);
        assert_eq!(
            events.recv().await.unwrap(),
            RegistrationEvent::Deregistered { key }
        );
        assert!(store.get_prefix("services/").await.unwrap().kvs.is_empty());
        assert!(!store.lease_exists(lease).await);

        registrar.deregister(&handle).await.unwrap();
        assert_eq!(registrar.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_all() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        registrar.register("order", record(), 30).await.unwrap();
        registrar.register("order", record(), 30).await.unwrap();
        registrar.register("billing", record(), 30).await.unwrap();

        assert_eq!(registrar.deregister_all().await, 3);
        assert!(store.get_prefix("services/").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let store = MemoryCoordinator::new();
        let registrar = registrar(&store, RegistrationConfig::default());

        assert!(matches!(
            registrar.register("order", record(), 0).await,
            Err(RegistryError::InvalidTtl(0))
        ));
        assert!(matches!(
            registrar.register("a/b", record(), 5).await,
            Err(RegistryError::InvalidName(_))
        ));
        assert_eq!(store.put_attempts(), 0);
    }
}
