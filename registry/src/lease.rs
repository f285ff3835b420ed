//! Lease lifecycle - grant, renew until stopped, detect expiry.
//!
//! Each kept-alive lease gets its own renewal task. State transitions
//! (Granted -> Renewing -> Expired | Revoked) are published on the lease's
//! [`KeepAliveHandle`] and on the manager-wide broadcast channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use coordinator::{CoordinatorClient, CoordinatorError, LeaseId};

use crate::config::LeaseConfig;
use crate::types::{RegistryError, Result};

/// Capacity of the manager-wide event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    /// Granted, not yet renewed
    Granted,
    /// At least one renewal succeeded
    Renewing,
    /// No renewal succeeded within the TTL, or the backend lost the lease
    Expired,
    /// Released on purpose
    Revoked,
}

impl LeaseState {
    /// Keys bound to the lease are visible.
    pub fn is_live(self) -> bool {
        matches!(self, LeaseState::Granted | LeaseState::Renewing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

/// A granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl_secs: i64,
    /// When the grant was answered; the backend's TTL runs from here
    pub granted_at: Instant,
}

impl Lease {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(0) as u64)
    }
}

/// A state transition of one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseEvent {
    pub lease_id: LeaseId,
    pub state: LeaseState,
}

/// Publishes transitions for one lease to its handle and to the manager.
struct StatePublisher {
    lease_id: LeaseId,
    state: watch::Sender<LeaseState>,
    events: broadcast::Sender<LeaseEvent>,
}

impl StatePublisher {
    /// Move to `next`; terminal states are final.
    fn publish(&self, next: LeaseState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next || current.is_terminal() {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            debug!(lease_id = %self.lease_id, state = ?next, "Lease state changed");
            // No subscribers is fine
            let _ = self.events.send(LeaseEvent {
                lease_id: self.lease_id,
                state: next,
            });
        }
        changed
    }

    fn current(&self) -> LeaseState {
        *self.state.borrow()
    }
}

/// Handle to a running renewal loop.
///
/// Dropping the handle cancels the loop without revoking the lease; use
/// [`LeaseManager::stop`] to also release it.
pub struct KeepAliveHandle {
    lease: Lease,
    publisher: Arc<StatePublisher>,
    state_rx: watch::Receiver<LeaseState>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveHandle {
    pub fn lease(&self) -> Lease {
        self.lease
    }

    /// Current state.
    pub fn state(&self) -> LeaseState {
        self.publisher.current()
    }

    /// Wait for the next transition and return the new state.
    pub async fn state_changed(&mut self) -> LeaseState {
        // The publisher lives as long as the handle, so the sender never closes
        let _ = self.state_rx.changed().await;
        *self.state_rx.borrow_and_update()
    }

    /// Error if the lease is no longer live.
    pub fn check(&self) -> Result<()> {
        match self.state() {
            LeaseState::Expired => Err(RegistryError::LeaseExpired(self.lease.id)),
            LeaseState::Revoked => Err(RegistryError::LeaseRevoked(self.lease.id)),
            _ => Ok(()),
        }
    }

    /// Whether the renewal task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

/// Grants leases and keeps them alive.
pub struct LeaseManager {
    client: Arc<dyn CoordinatorClient>,
    config: LeaseConfig,
    events: broadcast::Sender<LeaseEvent>,
}

impl LeaseManager {
    /// Create a new lease manager.
    pub fn new(client: Arc<dyn CoordinatorClient>, config: LeaseConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            config,
            events,
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Subscribe to state transitions of every lease this manager owns.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    /// Request a new lease.
    pub async fn grant(&self, ttl_secs: i64) -> Result<Lease> {
        if ttl_secs <= 0 {
            return Err(RegistryError::InvalidTtl(ttl_secs));
        }

        let grant = tokio::time::timeout(self.config.request_timeout(), self.client.grant(ttl_secs))
            .await
            .map_err(|_| RegistryError::BackendUnavailable("lease grant timed out".to_string()))??;

        let lease = Lease {
            id: grant.id,
            ttl_secs: grant.ttl_secs,
            granted_at: Instant::now(),
        };
        let _ = self.events.send(LeaseEvent {
            lease_id: lease.id,
            state: LeaseState::Granted,
        });

        debug!(lease_id = %lease.id, ttl_secs = lease.ttl_secs, "Lease granted");
        Ok(lease)
    }

    /// Start renewing `lease` in the background.
    pub fn start_keep_alive(&self, lease: Lease) -> KeepAliveHandle {
        let (state_tx, state_rx) = watch::channel(LeaseState::Granted);
        let publisher = Arc::new(StatePublisher {
            lease_id: lease.id,
            state: state_tx,
            events: self.events.clone(),
        });
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let interval = self.config.keep_alive_interval(lease.ttl_secs);
        info!(
            lease_id = %lease.id,
            ttl_secs = lease.ttl_secs,
            interval_ms = interval.as_millis() as u64,
            "Starting lease keepalive"
        );

        let task = tokio::spawn(run_keep_alive(
            Arc::clone(&self.client),
            lease,
            interval,
            self.config.request_timeout(),
            Arc::clone(&publisher),
            cancel_rx,
        ));

        KeepAliveHandle {
            lease,
            publisher,
            state_rx,
            cancel: Some(cancel_tx),
            task: Some(task),
        }
    }

    /// Cancel renewal and revoke the lease (best effort).
    ///
    /// Returns the final state: `Revoked`, or `Expired` if the lease had
    /// already lapsed.
    pub async fn stop(&self, mut handle: KeepAliveHandle) -> LeaseState {
        if let Some(cancel) = handle.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                warn!(lease_id = %handle.lease.id, error = %e, "Keepalive task panicked");
            }
        }

        self.revoke(handle.lease.id).await;
        handle.publisher.publish(LeaseState::Revoked);
        handle.publisher.current()
    }

    /// Revoke a lease that has no renewal loop (best effort).
    pub async fn release(&self, lease: Lease) {
        self.revoke(lease.id).await;
        let _ = self.events.send(LeaseEvent {
            lease_id: lease.id,
            state: LeaseState::Revoked,
        });
    }

    async fn revoke(&self, id: LeaseId) {
        match tokio::time::timeout(self.config.request_timeout(), self.client.revoke(id)).await {
            Ok(Ok(())) => debug!(lease_id = %id, "Lease revoked"),
            Ok(Err(CoordinatorError::LeaseNotFound(_))) => {
                debug!(lease_id = %id, "Lease already gone")
            }
            Ok(Err(e)) => {
                warn!(lease_id = %id, error = %e, "Lease revoke failed, it will lapse on its own")
            }
            Err(_) => warn!(lease_id = %id, "Lease revoke timed out, it will lapse on its own"),
        }
    }
}

async fn run_keep_alive(
    client: Arc<dyn CoordinatorClient>,
    lease: Lease,
    interval: Duration,
    request_timeout: Duration,
    publisher: Arc<StatePublisher>,
    mut cancel: oneshot::Receiver<()>,
) {
    let ttl = lease.ttl();
    let mut last_renewed = lease.granted_at;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut cancel => {
                debug!(lease_id = %lease.id, "Keepalive cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = &mut cancel => {
                debug!(lease_id = %lease.id, "Keepalive cancelled");
                return;
            }
            result = tokio::time::timeout(request_timeout, client.keep_alive_once(lease.id)) => result,
        };

        match result {
            Ok(Ok(remaining)) => {
                last_renewed = Instant::now();
                trace!(lease_id = %lease.id, remaining, "Lease renewed");
                publisher.publish(LeaseState::Renewing);
            }
            Ok(Err(CoordinatorError::LeaseNotFound(_))) => {
                warn!(lease_id = %lease.id, "Backend no longer knows the lease");
                publisher.publish(LeaseState::Expired);
                return;
            }
            Ok(Err(e)) => {
                warn!(lease_id = %lease.id, error = %e, "Lease renewal failed");
            }
            Err(_) => {
                warn!(lease_id = %lease.id, "Lease renewal timed out");
            }
        }

        if last_renewed.elapsed() >= ttl {
            warn!(
                lease_id = %lease.id,
                ttl_secs = lease.ttl_secs,
                "No successful renewal within TTL"
            );
            publisher.publish(LeaseState::Expired);
            return;
        }
    }
}
