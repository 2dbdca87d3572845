//! Configuration file handling for the CLI.
//!
//! Reads and writes the JSON chain configuration and resolves the listening
//! port from flags, file, and environment.

use stella_proxy::{ChainConfig, ProxyError, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Port used when nothing else specifies one.
pub const DEFAULT_PORT: u16 = 8080;

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<ChainConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let config: ChainConfig = serde_json::from_str(&content).map_err(|e| {
        ProxyError::Config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
}

/// Write [`ChainConfig::example`] as pretty-printed JSON.
pub fn write_example(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&ChainConfig::example())
        .map_err(|e| ProxyError::Config(format!("failed to serialize example: {}", e)))?;
    fs::write(path, json + "\n").map_err(|e| {
        ProxyError::Config(format!("failed to write {}: {}", path.display(), e))
    })
}

/// Pick the listening port.
///
/// Precedence: `--port`, then a positive `port` in the file, then `$PORT`,
/// then [`DEFAULT_PORT`].
pub fn resolve_port(flag: Option<u16>, config: &ChainConfig, env_port: Option<&str>) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    if let Some(port) = config.port() {
        return port;
    }
    if let Some(raw) = env_port {
        match raw.trim().parse::<u16>() {
            Ok(port) if port > 0 => return port,
            _ => warn!("Ignoring invalid PORT value: {:?}", raw),
        }
    }
    DEFAULT_PORT
}
