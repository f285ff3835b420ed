//! Facade wiring every component to one backend and one config.

use std::sync::Arc;
use tracing::info;

use coordinator::CoordinatorClient;

use crate::config::RegistryConfig;
use crate::discovery::Discoverer;
use crate::registrar::Registrar;
use crate::types::Result;

/// Registrar and discoverer sharing a backend client.
pub struct ServiceRegistry {
    config: RegistryConfig,
    registrar: Registrar,
    discoverer: Discoverer,
}

impl ServiceRegistry {
    /// Validate `config` and build the components.
    pub fn new(client: Arc<dyn CoordinatorClient>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();

        let registrar = Registrar::new(
            Arc::clone(&client),
            layout.clone(),
            config.lease.clone(),
            config.registration.clone(),
        );
        let discoverer = Discoverer::new(client, layout, config.discovery.clone());

        info!(prefix = %config.key_prefix, ttl_secs = config.lease.ttl_secs, "Service registry ready");
        Ok(Self {
            config,
            registrar,
            discoverer,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn discoverer(&self) -> &Discoverer {
        &self.discoverer
    }

    /// Deregister every instance and stop every tracker.
    pub async fn shutdown(&self) {
        let deregistered = self.registrar.deregister_all().await;
        self.discoverer.untrack_all().await;
        info!(deregistered, "Service registry shut down");
    }
}
