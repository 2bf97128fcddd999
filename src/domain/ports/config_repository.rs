//! Config Repository Port
//!
//! Persistence for the network mode configuration. The outer application
//! owns where it lives; the connection manager only loads and saves it.

use crate::replication::config::NetworkModeConfig;
use async_trait::async_trait;

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// Load the saved configuration, `None` on first run.
    async fn load(&self) -> anyhow::Result<Option<NetworkModeConfig>>;

    /// Persist the configuration.
    async fn save(&self, config: &NetworkModeConfig) -> anyhow::Result<()>;
}
