//! JSON Config Repository
//!
//! Implements ConfigRepository with a JSON file, plus an in-memory
//! variant for tests and embedding.

use crate::domain::ports::ConfigRepository;
use crate::replication::config::NetworkModeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;

/// Stores the configuration as pretty-printed JSON.
pub struct JsonConfigRepository {
    path: PathBuf,
}

impl JsonConfigRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigRepository for JsonConfigRepository {
    async fn load(&self) -> Result<Option<NetworkModeConfig>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let config = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", self.path.display()))?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    async fn save(&self, config: &NetworkModeConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps the configuration in memory.
#[derive(Default)]
pub struct MemoryConfigRepository {
    config: RwLock<Option<NetworkModeConfig>>,
}

impl MemoryConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigRepository for MemoryConfigRepository {
    async fn load(&self) -> Result<Option<NetworkModeConfig>> {
        Ok(self.config.read().clone())
    }

    async fn save(&self, config: &NetworkModeConfig) -> Result<()> {
        *self.config.write() = Some(config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::NodeRole;

    #[tokio::test]
    async fn test_json_repo_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonConfigRepository::new(dir.path().join("network.json"));
        assert!(repo.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_repo_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonConfigRepository::new(dir.path().join("conf").join("network.json"));

        let config = NetworkModeConfig::master("0.0.0.0:4000".parse().unwrap()).display_name("loja");
        repo.save(&config).await.unwrap();

        let loaded = repo.load().await.unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.role, NodeRole::Master);
    }

    #[tokio::test]
    async fn test_json_repo_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, "{not json").unwrap();

        let repo = JsonConfigRepository::new(path);
        assert!(repo.load().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_repo() {
        let repo = MemoryConfigRepository::new();
        assert!(repo.load().await.unwrap().is_none());

        repo.save(&NetworkModeConfig::standalone()).await.unwrap();
        assert_eq!(
            repo.load().await.unwrap().unwrap().role,
            NodeRole::Standalone
        );
    }
}
