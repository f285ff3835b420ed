//! Core types for the registry crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use coordinator::{CoordinatorError, LeaseId};

/// Address and metadata published for one service instance.
///
/// Stored as JSON at the instance's [`ServiceKey`]. Never mutated while its
/// lease lives; re-registration writes a fresh copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Host name or IP address
    pub host: String,
    /// Port the instance serves on
    pub port: u16,
    /// Arbitrary metadata (version, zone, weight, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the record was built; absent in records written by other clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Create a record for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            metadata: BTreeMap::new(),
            registered_at: Some(Utc::now()),
        }
    }

    /// Add a metadata entry. Any JSON value is accepted.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(RegistryError::Encode)
    }

    /// Deserialize a stored value found at `key`.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| RegistryError::Decode {
            key: key.to_string(),
            source,
        })
    }
}

/// Identity of one registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub service: String,
    pub instance_id: String,
}

impl ServiceKey {
    /// Build a key, validating both components.
    pub fn new(service: impl Into<String>, instance_id: impl Into<String>) -> Result<Self> {
        let service = service.into();
        let instance_id = instance_id.into();
        validate_name("service name", &service)?;
        validate_name("instance id", &instance_id)?;
        Ok(Self {
            service,
            instance_id,
        })
    }

    /// Key whose instance id is the lease id, unique without coordination.
    pub fn for_lease(service: impl Into<String>, lease: LeaseId) -> Result<Self> {
        Self::new(service, lease.to_string())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.instance_id)
    }
}

/// Maps service keys onto backend keys: `<prefix>/<service>/<instance_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// Layout rooted at `prefix` (surrounding slashes are ignored).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix covering every instance of `service`, with trailing slash.
    pub fn service_prefix(&self, service: &str) -> String {
        if self.prefix.is_empty() {
            format!("{service}/")
        } else {
            format!("{}/{service}/", self.prefix)
        }
    }

    /// Full backend key for an instance.
    pub fn key(&self, key: &ServiceKey) -> String {
        format!("{}{}", self.service_prefix(&key.service), key.instance_id)
    }

    /// Instance id of a backend key under `service`, if it belongs there.
    pub fn instance_id<'a>(&self, service: &str, key: &'a str) -> Option<&'a str> {
        let id = key.strip_prefix(&self.service_prefix(service))?;
        (!id.is_empty() && !id.contains('/')).then_some(id)
    }

    /// Recover the service key from a backend key.
    pub fn parse(&self, key: &str) -> Option<ServiceKey> {
        let rest = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)?.strip_prefix('/')?
        };
        let (service, instance_id) = rest.split_once('/')?;
        ServiceKey::new(service, instance_id).ok()
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("services")
    }
}

/// Reject empty names and names containing `/`.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RegistryError::InvalidName(format!("{kind} must not be empty")));
    }
    if name.contains('/') {
        return Err(RegistryError::InvalidName(format!(
            "{kind} '{name}' must not contain '/'"
        )));
    }
    Ok(())
}

/// Error types for the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Backend unreachable after the retry budget
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Lease lapsed or is unknown to the backend
    #[error("Lease {0} expired")]
    LeaseExpired(LeaseId),

    /// Lease was released on purpose
    #[error("Lease {0} revoked")]
    LeaseRevoked(LeaseId),

    /// Registration retry budget exhausted
    #[error("Registration of '{service}' failed after {attempts} attempts: {last_error}")]
    RegistrationFailed {
        service: String,
        attempts: u32,
        last_error: String,
    },

    /// Watch stream for a service ended
    #[error("Watch for '{service}' disconnected")]
    Disconnected { service: String },

    /// Resync budget exhausted; the tracker stopped updating
    #[error("Tracking '{service}' is unrecoverable after {attempts} resync attempts")]
    Unrecoverable { service: String, attempts: u32 },

    /// TTL must be positive
    #[error("Invalid TTL: {0}s")]
    InvalidTtl(i64),

    /// Service name or instance id rejected
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Stored value is not an instance record
    #[error("Failed to decode record at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Record could not be serialized
    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-transient backend error
    #[error("Coordinator error: {0}")]
    Coordinator(CoordinatorError),
}

impl RegistryError {
    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::BackendUnavailable(_))
    }
}

impl From<CoordinatorError> for RegistryError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Unavailable(msg) => RegistryError::BackendUnavailable(msg),
            CoordinatorError::LeaseNotFound(id) => RegistryError::LeaseExpired(id),
            other => RegistryError::Coordinator(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
