//! Coordinator - key-value coordination backend contract
//!
//! Defines the primitives the service registry is built on:
//! - Prefix listing with a consistent read revision
//! - Put/delete with optional lease binding
//! - TTL leases (grant, keepalive, revoke) whose expiry removes bound keys
//! - Prefix-scoped watches delivering ordered change batches
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        CoordinatorClient (trait)      │
//! └──────────────────┬───────────────────┘
//!                    │
//!        ┌───────────┴───────────┐
//!        ▼                       ▼
//! ┌──────────────┐       ┌──────────────┐
//! │ Memory       │       │ Remote       │
//! │ Coordinator  │       │ backends     │
//! │ (in-process) │       │ (etcd, ...)  │
//! └──────────────┘       └──────────────┘
//! ```

pub mod memory;
pub mod stream;
pub mod traits;
pub mod types;

// Re-export main types for convenience
pub use memory::{MemoryCoordinator, MemoryCoordinatorConfig};
pub use stream::{WatchSender, WatchStream};
pub use traits::{CoordinatorClient, CoordinatorError};
pub use types::*;
