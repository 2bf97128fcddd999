use crate::replication::config::{NetworkModeConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_SYNC_PORT};
use crate::replication::types::NodeRole;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon settings read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: NodeRole,
    pub bind_addr: SocketAddr,
    pub target_addr: Option<SocketAddr>,
    pub discovery_enabled: bool,
    pub discovery_port: u16,
    pub display_name: String,
    pub data_dir: PathBuf,
    pub license_key: String,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: NodeRole::Standalone,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SYNC_PORT)),
            target_addr: None,
            discovery_enabled: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            display_name: "terminal".to_string(),
            data_dir: PathBuf::from("data"),
            license_key: String::new(),
            debug: false,
        }
    }
}

impl Config {
    /// Network configuration used when none has been saved yet.
    pub fn network_config(&self) -> NetworkModeConfig {
        let mut config = NetworkModeConfig::new(self.role)
            .bind_addr(self.bind_addr)
            .display_name(self.display_name.clone());
        if let Some(target) = self.target_addr {
            config = config.target_addr(target);
        }
        if self.discovery_enabled {
            config.discovery(
                SocketAddr::from(([0, 0, 0, 0], self.discovery_port)),
                vec![SocketAddr::from(([255, 255, 255, 255], self.discovery_port))],
            )
        } else {
            config.without_discovery()
        }
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("node.json")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("sync.db")
    }

    pub fn network_config_path(&self) -> PathBuf {
        self.data_dir.join("network.json")
    }
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let role = match std::env::var("MULTIPC_ROLE") {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid MULTIPC_ROLE: {}", e))?,
        Err(_) => defaults.role,
    };

    let bind_addr = match std::env::var("MULTIPC_BIND_ADDR") {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid MULTIPC_BIND_ADDR {}: {}", v, e))?,
        Err(_) => defaults.bind_addr,
    };

    let target_addr = match std::env::var("MULTIPC_TARGET_ADDR") {
        Ok(v) if !v.trim().is_empty() => Some(
            v.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid MULTIPC_TARGET_ADDR {}: {}", v, e))?,
        ),
        _ => None,
    };

    let discovery_enabled = flag("MULTIPC_DISCOVERY", defaults.discovery_enabled);

    let discovery_port = std::env::var("MULTIPC_DISCOVERY_PORT")
        .unwrap_or_else(|_| DEFAULT_DISCOVERY_PORT.to_string())
        .parse()
        .unwrap_or(DEFAULT_DISCOVERY_PORT);

    let display_name = std::env::var("MULTIPC_DISPLAY_NAME")
        .unwrap_or(defaults.display_name);

    let data_dir = std::env::var("MULTIPC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.data_dir);

    let license_key = std::env::var("MULTIPC_LICENSE_KEY").unwrap_or_default();

    let debug = std::env::var("MULTIPC_DEBUG").is_ok();

    Ok(Config {
        role,
        bind_addr,
        target_addr,
        discovery_enabled,
        discovery_port,
        display_name,
        data_dir,
        license_key,
        debug,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    // Env vars are process-wide; tests touching them run under one lock.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn clear_env() {
        for name in [
            "MULTIPC_ROLE",
            "MULTIPC_BIND_ADDR",
            "MULTIPC_TARGET_ADDR",
            "MULTIPC_DISCOVERY",
            "MULTIPC_DISCOVERY_PORT",
            "MULTIPC_DISPLAY_NAME",
            "MULTIPC_DATA_DIR",
            "MULTIPC_LICENSE_KEY",
            "MULTIPC_DEBUG",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.role, NodeRole::Standalone);
        assert_eq!(cfg.bind_addr.port(), 3847);
        assert!(cfg.discovery_enabled);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_load_config_defaults() {
        let _env = ENV_LOCK.lock();
        clear_env();

        let cfg = load_config().unwrap();
        assert_eq!(cfg.role, NodeRole::Standalone);
        assert_eq!(cfg.target_addr, None);
        assert_eq!(cfg.discovery_port, 3848);
        assert_eq!(cfg.display_name, "terminal");
    }

    #[test]
    fn test_load_config_satellite() {
        let _env = ENV_LOCK.lock();
        clear_env();
        std::env::set_var("MULTIPC_ROLE", "Satellite");
        std::env::set_var("MULTIPC_TARGET_ADDR", "192.168.0.5:3847");
        std::env::set_var("MULTIPC_DISCOVERY", "false");
        std::env::set_var("MULTIPC_DISPLAY_NAME", "caixa 3");

        let cfg = load_config().unwrap();
        assert_eq!(cfg.role, NodeRole::Satellite);
        assert_eq!(cfg.target_addr, Some("192.168.0.5:3847".parse().unwrap()));
        assert!(!cfg.discovery_enabled);

        let network = cfg.network_config();
        assert_eq!(network.role, NodeRole::Satellite);
        assert!(!network.discovery_enabled);
        assert_eq!(network.display_name, "caixa 3");
        assert!(network.validate().is_ok());
        clear_env();
    }

    #[test]
    fn test_invalid_role_is_an_error() {
        let _env = ENV_LOCK.lock();
        clear_env();
        std::env::set_var("MULTIPC_ROLE", "leader");
        assert!(load_config().is_err());
        clear_env();
    }

    #[test]
    fn test_discovery_port_parse_error_uses_default() {
        let _env = ENV_LOCK.lock();
        clear_env();
        std::env::set_var("MULTIPC_DISCOVERY_PORT", "not-a-port");
        std::env::set_var("MULTIPC_DEBUG", "1");

        let cfg = load_config().unwrap();
        assert_eq!(cfg.discovery_port, 3848);
        assert!(cfg.debug);
        clear_env();
    }

    #[test]
    fn test_paths_under_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/var/lib/multipc"),
            ..Default::default()
        };
        assert_eq!(cfg.identity_path(), PathBuf::from("/var/lib/multipc/node.json"));
        assert_eq!(cfg.store_path(), PathBuf::from("/var/lib/multipc/sync.db"));
        assert_eq!(cfg.network_config_path(), PathBuf::from("/var/lib/multipc/network.json"));
    }

    #[test]
    fn test_network_config_discovery_targets() {
        let cfg = Config {
            role: NodeRole::Master,
            discovery_port: 4000,
            ..Default::default()
        };
        let network = cfg.network_config();
        assert_eq!(network.announce_targets, vec!["255.255.255.255:4000".parse().unwrap()]);
        assert_eq!(network.sync_port(), 3847);
    }
}
