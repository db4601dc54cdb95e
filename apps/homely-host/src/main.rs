//! # Homely Host
//!
//! Reference host for the sync engine: loads configuration, installs the
//! log subscriber, runs the coordinator until a shutdown signal arrives and
//! logs every notification.
//!
//! ## Usage
//! ```text
//! homely-host [path/to/homely.toml]
//!
//! HOMELY_USERNAME / HOMELY_PASSWORD   account credentials
//! HOMELY_LOCATIONS                    comma separated location ids
//! RUST_LOG                            log filter (default homely_sync=info,homely_host=info)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use homely_core::{ChangeSet, LocationId, StateChange};
use homely_sync::{ConnectionHealth, HomelyConfig, SyncCoordinatorBuilder, SyncError, SyncListener};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Listener
// =============================================================================

/// Logs every notification from the engine.
struct LoggingListener;

impl SyncListener for LoggingListener {
    fn emit_changes(&self, changes: &ChangeSet) {
        for change in &changes.changes {
            info!(location_id = %changes.location_id, "{}", describe_change(change));
        }
    }

    fn emit_health(&self, location_id: LocationId, health: &ConnectionHealth) {
        info!(
            %location_id,
            state = %health.state,
            failures = health.consecutive_failures,
            "Realtime connection"
        );
    }

    fn emit_error(&self, location_id: Option<LocationId>, error: &SyncError) {
        error!(?location_id, %error, "Homely needs attention");
    }
}

fn describe_change(change: &StateChange) -> String {
    fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
        value
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string())
    }

    match change {
        StateChange::Alarm { old, new, .. } => {
            format!("alarm {} -> {}", show(&old.map(|s| s.as_str())), new.as_str())
        }
        StateChange::Feature {
            device_id,
            feature,
            state,
            old,
            new,
            ..
        } => format!(
            "device {} {}/{}: {} -> {}",
            device_id,
            feature,
            state,
            show(old),
            show(new)
        ),
        StateChange::Online { device_id, new, .. } => {
            format!("device {} {}", device_id, if *new { "online" } else { "offline" })
        }
        StateChange::DeviceAdded { device_id } => format!("device {} added", device_id),
        StateChange::DeviceRemoved { device_id } => format!("device {} removed", device_id),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = HomelyConfig::load(config_path)?;
    info!(
        api = %config.api.base_url,
        locations = config.locations.len(),
        "Configuration loaded"
    );

    let mut coordinator = SyncCoordinatorBuilder::new(config)
        .with_listener(Arc::new(LoggingListener))
        .build()?;

    coordinator.start().await?;
    for location in coordinator.available_locations() {
        info!(
            location_id = %location.id,
            name = %location.name,
            monitored = location.monitored,
            "Location"
        );
    }

    shutdown_signal().await;

    coordinator.stop().await;
    info!("Homely host stopped");
    Ok(())
}

/// Log filter from `RUST_LOG`, defaulting to info for the engine and host.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("homely_sync=info,homely_host=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
