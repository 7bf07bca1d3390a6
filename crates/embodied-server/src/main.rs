//! Embodied AI bridge server
//!
//! Loads the YAML configuration, restores host storage, imports the
//! configured entry and runs the bridge until interrupted.

mod import;

use anyhow::{Context as _, Result};
use embodied_bridge::{Bridge, Host};
use embodied_components::{register_persistent_notification_services, PersistentNotificationManager};
use embodied_config::load_server_config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "configuration.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let config = load_server_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.as_deref().unwrap_or("info")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(config_dir = %config.config_dir.display(), "Starting embodied AI bridge");

    let host = Host::new(&config.config_dir);
    host.registries.load_all().await?;
    host.config_entries.load().await?;

    let notifications = Arc::new(PersistentNotificationManager::new());
    register_persistent_notification_services(&host.services, notifications, host.bus.clone());

    let bridge = Bridge::new(host.clone());
    bridge.register_handlers();

    match &config.entry {
        Some(section) => {
            import::import_entry(&host.config_entries, section).await?;
        }
        None => info!("No aiembodied section configured"),
    }

    for result in host.config_entries.setup_all().await {
        if let Err(err) = result {
            warn!(error = %err, "Entry setup failed");
        }
    }
    info!(entries = bridge.runtime_count(), "Embodied AI bridge is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for result in host.config_entries.unload_all().await {
        if let Err(err) = result {
            warn!(error = %err, "Entry unload failed");
        }
    }
    host.registries.save_all().await?;

    Ok(())
}
