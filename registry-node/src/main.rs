//! Registry node - registers instances and follows service membership
//!
//! Runs the registry against the in-process coordinator: registers
//! `INSTANCES` records for `SERVICE_NAME`, tracks the service and logs every
//! membership change until Ctrl-C, then deregisters.

mod config;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Args;
use coordinator::MemoryCoordinator;
use registry::{DiscoveryEvent, InstanceRecord, RegistrationEvent, ServiceRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("registry_node={log_level},registry={log_level},info").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let config = args.registry_config()?;

    info!("======================================");
    info!("  Registry Node");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Service: {}", args.service);
    info!("Instances: {} from {}:{}", args.instances, args.host, args.port);
    info!("Lease TTL: {}s", config.lease.ttl_secs);
    info!("Key prefix: {}", config.key_prefix);
    info!("======================================");

    let store = MemoryCoordinator::new();
    let reaper = store.spawn_expiry_reaper(Duration::from_millis(args.reaper_interval_ms));
    let registry = ServiceRegistry::new(Arc::new(store), config)?;

    let tracked = registry.discoverer().track(&args.service)?;
    let mut discovery_events = tracked.subscribe();
    let mut registration_events = registry.registrar().subscribe();

    let ttl = registry.config().lease.ttl_secs;
    for i in 0..args.instances {
        let record = InstanceRecord::new(args.host.clone(), args.port + i)
            .with_metadata("node_id", args.node_id.to_string())
            .with_metadata("ordinal", i);
        let handle = registry
            .registrar()
            .register(&args.service, record, ttl)
            .await?;
        if let Some(key) = handle.current_key() {
            info!(key = %key, "Instance up");
        }
    }

    let membership = {
        let tracked = tracked.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = tracked.changed().await {
                info!(
                    service = %snapshot.service(),
                    revision = snapshot.revision(),
                    members = ?snapshot.endpoints(),
                    "Membership changed"
                );
            }
        })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            event = discovery_events.recv() => match event {
                Ok(DiscoveryEvent::Unrecoverable { service, attempts }) => {
                    error!(service = %service, attempts, "Membership tracking gave up");
                    break;
                }
                Ok(event) => info!(event = ?event, "Discovery event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Discovery events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = registration_events.recv() => match event {
                Ok(RegistrationEvent::Failed { service, error }) => {
                    warn!(service = %service, error = %error, "Re-registration failed, retrying");
                }
                Ok(event) => info!(event = ?event, "Registration event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Registration events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    registry.shutdown().await;
    membership.abort();
    reaper.abort();
    info!("Registry node stopped");
    Ok(())
}
