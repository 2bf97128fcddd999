//! multipc-syncd - LAN Stock Sync Daemon
//!
//! This is the composition root that wires together all the components.

use multipc_sync::adapters::outbound::{JsonConfigRepository, SqliteSyncStore};
use multipc_sync::config::load_config;
use multipc_sync::domain::ports::ConfigRepository;
use multipc_sync::infrastructure::{shutdown_signal, ShutdownController};
use multipc_sync::replication::{
    ConnectionManager, Notification, NotificationHub, NotificationKind, NodeIdentity,
};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting multipc-syncd name={} data_dir={}",
        cfg.display_name,
        cfg.data_dir.display()
    );

    // ===== COMPOSITION ROOT =====

    // 1. Node identity
    if cfg.license_key.is_empty() {
        tracing::warn!("MULTIPC_LICENSE_KEY is not set, terminals pair with an empty key");
    }
    std::fs::create_dir_all(&cfg.data_dir)?;
    let identity = NodeIdentity::load_or_create(&cfg.identity_path(), cfg.license_key.as_bytes())?;
    tracing::info!("node id {}", identity.node_id);

    // 2. Outbound adapters
    let store = Arc::new(SqliteSyncStore::open(cfg.store_path())?);
    let config_repo = Arc::new(JsonConfigRepository::new(cfg.network_config_path()));

    // 3. Notifications
    let hub = NotificationHub::new();
    for kind in NotificationKind::ALL {
        hub.subscribe(kind, log_notification);
    }

    // 4. Connection manager
    let network = match config_repo.load().await? {
        Some(saved) => {
            tracing::info!("using saved network config ({})", saved.role);
            saved
        }
        None => cfg.network_config(),
    };
    let manager = ConnectionManager::new(identity, store, config_repo, hub);
    manager.start(network).await?;

    // 5. Run until signalled
    let shutdown = ShutdownController::new();
    shutdown_signal(shutdown).await;

    manager.stop().await?;
    Ok(())
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::Error { message } => tracing::warn!("sync error: {}", message),
        Notification::Reconnecting { attempt } => {
            tracing::info!("reconnecting to master (attempt {})", attempt)
        }
        Notification::SyncCompleted { at_ms } => tracing::info!("sync completed at {}", at_ms),
        Notification::StockUpdated {
            entity,
            quantity,
            version,
        } => match quantity {
            Some(quantity) => tracing::info!("{} = {} (v{})", entity, quantity, version),
            None => tracing::info!("{} deleted (v{})", entity, version),
        },
    }
}
