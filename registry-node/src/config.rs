//! Command line configuration.

use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

use registry::RegistryConfig;

/// Registry node - registers local instances and follows service membership
#[derive(Parser, Debug, Clone)]
#[command(name = "registry-node")]
#[command(about = "Lease-backed service registration and discovery node")]
pub struct Args {
    /// Unique identifier for this node, published as instance metadata
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Service name to register under
    #[arg(long, env = "SERVICE_NAME", default_value = "order")]
    pub service: String,

    /// Host advertised in the instance record
    #[arg(long, env = "ADVERTISE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// First port advertised; further instances use consecutive ports
    #[arg(long, env = "ADVERTISE_PORT", default_value = "8080")]
    pub port: u16,

    /// Number of instances to register
    #[arg(long, env = "INSTANCES", default_value = "2")]
    pub instances: u16,

    /// Lease TTL in seconds (overrides the config file)
    #[arg(long, env = "LEASE_TTL_SECS")]
    pub ttl_secs: Option<i64>,

    /// Key prefix (overrides the config file)
    #[arg(long, env = "KEY_PREFIX")]
    pub key_prefix: Option<String>,

    /// Optional YAML file with the full registry configuration
    #[arg(long, env = "REGISTRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interval for purging expired leases in the in-process coordinator (ms)
    #[arg(long, env = "REAPER_INTERVAL_MS", default_value = "250")]
    pub reaper_interval_ms: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate arguments that clap cannot check on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.instances == 0 {
            return Err("INSTANCES must be at least 1".to_string());
        }
        if self.port.checked_add(self.instances - 1).is_none() {
            return Err(format!(
                "{} instances starting at port {} exceed the port range",
                self.instances, self.port
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err("REAPER_INTERVAL_MS must be positive".to_string());
        }
        Ok(())
    }

    /// Registry configuration: YAML file (if any) with CLI overrides on top.
    pub fn registry_config(&self) -> anyhow::Result<RegistryConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let yaml = std::fs::read_to_string(path)?;
                RegistryConfig::from_yaml(&yaml)?
            }
            None => RegistryConfig::default(),
        };

        if let Some(ttl) = self.ttl_secs {
            config.lease.ttl_secs = ttl;
        }
        if let Some(prefix) = &self.key_prefix {
            config.key_prefix = prefix.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
