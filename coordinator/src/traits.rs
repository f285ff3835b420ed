//! Core trait for coordination backends.
//!
//! This module defines the `CoordinatorClient` trait - the only surface the
//! registry talks to. Implementations own their connection; callers share
//! them as `Arc<dyn CoordinatorClient>`.

use async_trait::async_trait;

use crate::stream::WatchStream;
use crate::types::{DeleteResponse, GetResponse, LeaseGrant, LeaseId, Revision};

/// Error types for coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// Backend is unreachable or refused the request
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Lease is unknown to the backend (expired or revoked)
    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    /// Requested watch start revision has been compacted away
    #[error("Revision {requested} compacted (oldest available {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    /// Request was malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoordinatorError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinatorError::Unavailable(_))
    }
}

/// Core trait for coordination backends.
///
/// Every mutation is assigned a revision; watches deliver events in revision
/// order. Keys bound to a lease disappear when the lease expires or is revoked.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// List all keys starting with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse, CoordinatorError>;

    /// Write `value` at `key`, optionally bound to `lease`.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, CoordinatorError>;

    /// Delete `key`. Deleting a missing key succeeds with `deleted == 0`.
    async fn delete(&self, key: &str) -> Result<DeleteResponse, CoordinatorError>;

    /// Grant a lease with the given TTL.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseGrant, CoordinatorError>;

    /// Renew a lease once, returning the remaining TTL in seconds.
    ///
    /// Fails with [`CoordinatorError::LeaseNotFound`] if the lease is gone.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<i64, CoordinatorError>;

    /// Revoke a lease, removing every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError>;

    /// Watch every key under `prefix`, starting at `from_revision` inclusive.
    ///
    /// The returned stream only ends when the connection is lost.
    async fn watch(
        &self,
        prefix: &str,
        from_revision: Revision,
    ) -> Result<WatchStream, CoordinatorError>;
}
