//! Configuration for the registry client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::snapshot::DEFAULT_TOMBSTONE_LIMIT;
use crate::types::{KeyLayout, RegistryError, Result};

/// Configuration for registration and discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root of the key layout (`<key_prefix>/<service>/<instance>`)
    pub key_prefix: String,
    /// Lease configuration
    pub lease: LeaseConfig,
    /// Registration configuration
    pub registration: RegistrationConfig,
    /// Discovery configuration
    pub discovery: DiscoveryConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: "services".to_string(),
            lease: LeaseConfig::default(),
            registration: RegistrationConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Key layout derived from `key_prefix`.
    pub fn layout(&self) -> KeyLayout {
        KeyLayout::new(self.key_prefix.clone())
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.lease.ttl_secs <= 0 {
            return Err(RegistryError::Config(format!(
                "lease.ttl_secs must be positive, got {}",
                self.lease.ttl_secs
            )));
        }
        if self.lease.request_timeout_ms == 0 {
            return Err(RegistryError::Config(
                "lease.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.registration.max_attempts == 0 {
            return Err(RegistryError::Config(
                "registration.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.discovery.list_attempts == 0 {
            return Err(RegistryError::Config(
                "discovery.list_attempts must be at least 1".to_string(),
            ));
        }
        if self.discovery.event_buffer == 0 {
            return Err(RegistryError::Config(
                "discovery.event_buffer must be at least 1".to_string(),
            ));
        }
        if self.discovery.tombstone_limit == 0 {
            return Err(RegistryError::Config(
                "discovery.tombstone_limit must be at least 1".to_string(),
            ));
        }
        self.registration.backoff.validate("registration.backoff")?;
        self.discovery.backoff.validate("discovery.backoff")?;
        Ok(())
    }
}

/// Lease configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Default TTL for registrations (seconds)
    pub ttl_secs: i64,
    /// Renewal interval override; defaults to a third of the TTL
    pub keep_alive_interval_ms: Option<u64>,
    /// Upper bound for a single backend call (ms)
    pub request_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            keep_alive_interval_ms: None,
            request_timeout_ms: 5_000,
        }
    }
}

impl LeaseConfig {
    /// Renewal interval for a lease with `ttl_secs`.
    ///
    /// Never longer than ttl/3 so one or two lost round-trips are tolerated.
    pub fn keep_alive_interval(&self, ttl_secs: i64) -> Duration {
        let ceiling = Duration::from_millis((ttl_secs.max(1) as u64 * 1000) / 3);
        let interval = match self.keep_alive_interval_ms {
            Some(ms) => Duration::from_millis(ms).min(ceiling),
            None => ceiling,
        };
        interval.max(Duration::from_millis(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Registration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Write attempts per registration (including the first)
    pub max_attempts: u32,
    /// Delay policy between attempts
    pub backoff: BackoffConfig,
    /// Pause before supervision retries a failed re-registration (ms)
    pub reregister_delay_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::immediate(),
            reregister_delay_ms: 1_000,
        }
    }
}

impl RegistrationConfig {
    pub fn reregister_delay(&self) -> Duration {
        Duration::from_millis(self.reregister_delay_ms)
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Attempts for a single `list` call
    pub list_attempts: u32,
    /// Re-list attempts after a watch disconnects before giving up
    pub max_resync_attempts: u32,
    /// Delay policy between resync attempts
    pub backoff: BackoffConfig,
    /// Capacity of the notification channel per tracker
    pub event_buffer: usize,
    /// Deleted instances each tracked snapshot remembers
    pub tombstone_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            list_attempts: 3,
            max_resync_attempts: 5,
            backoff: BackoffConfig::default(),
            event_buffer: 64,
            tombstone_limit: DEFAULT_TOMBSTONE_LIMIT,
        }
    }
}

/// Exponential backoff between retries.
///
/// Attempt `n` (1-based) waits `initial_delay_ms * multiplier^(n-1)`, capped
/// at `max_delay_ms`. A zero initial delay retries immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry (ms)
    pub initial_delay_ms: u64,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Delay cap (ms)
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl BackoffConfig {
    /// Retry with no delay.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.initial_delay_ms == 0 || attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RegistryError::Config(format!(
                "{section}.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(RegistryError::Config(format!(
                "{section}.initial_delay_ms exceeds max_delay_ms"
            )));
        }
        Ok(())
    }
}
