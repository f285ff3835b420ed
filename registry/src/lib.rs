//! Registry - lease-backed service registration and discovery
//!
//! Instances publish a record under `<prefix>/<service>/<instance_id>` bound
//! to a TTL lease; the record disappears when the lease stops being renewed.
//! Consumers list a service, then follow its change stream to keep a local,
//! always-complete view of the live members.
//!
//! - **LeaseManager**: grant, keepalive at ttl/3, expiry detection
//! - **Registrar**: write with retries, re-register when the lease is lost
//! - **Discoverer**: list, watch, and tracked membership with resync
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   put(lease)   ┌─────────────────────────┐
//! │  Registrar   │───────────────▶│                         │
//! └──────┬───────┘                │                         │
//!        │                        │    CoordinatorClient    │
//! ┌──────▼───────┐   keepalive    │  (memory / remote KV)   │
//! │ LeaseManager │───────────────▶│                         │
//! └──────────────┘                │                         │
//!                                 │                         │
//! ┌──────────────┐  list + watch  │                         │
//! │  Discoverer  │◀───────────────│                         │
//! └──────┬───────┘                └─────────────────────────┘
//!        │ Arc<MembershipSnapshot>
//!        ▼
//!   TrackedMembership (readers)
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod lease;
pub mod registrar;
pub mod snapshot;
pub mod types;

// Re-export main types
pub use client::ServiceRegistry;
pub use config::{BackoffConfig, DiscoveryConfig, LeaseConfig, RegistrationConfig, RegistryConfig};
pub use discovery::{DiscoveryEvent, Discoverer, MembershipStream, TrackStatus, TrackedMembership};
pub use lease::{KeepAliveHandle, Lease, LeaseEvent, LeaseManager, LeaseState};
pub use registrar::{RegistrationEvent, RegistrationHandle, RegistrationStatus, Registrar};
pub use snapshot::{MembershipChangeEvent, MembershipSnapshot, DEFAULT_TOMBSTONE_LIMIT};
pub use types::*;
