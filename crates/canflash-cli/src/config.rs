//! Configuration file lookup for canflash

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use canflash_core::config::SocketCanConfig;
use canflash_core::{FlashConfig, TransportConfig};

/// Config file looked up in the working directory
const LOCAL_CONFIG: &str = "canflash.toml";

/// Load the given config file, or the first default location that exists.
///
/// Without any config file the catalog is empty and the mock transport is used.
pub fn load(path: Option<&Path>) -> Result<FlashConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_paths().into_iter().find(|p| p.exists()) {
            Some(path) => path,
            None => {
                tracing::debug!("No config file found, using defaults");
                return Ok(FlashConfig::default());
            }
        },
    };

    FlashConfig::load(&path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// `./canflash.toml`, then the user config directory
fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("canflash").join("config.toml"));
    }
    paths
}

/// Switch the transport to SocketCAN on `interface`, keeping the configured
/// identifier format
pub fn use_interface(config: &mut FlashConfig, interface: &str) {
    let extended_ids = match &config.transport {
        TransportConfig::SocketCan(cfg) => cfg.extended_ids,
        TransportConfig::Mock(_) => false,
    };
    config.transport = TransportConfig::SocketCan(SocketCanConfig {
        interface: interface.to_string(),
        extended_ids,
    });
}
