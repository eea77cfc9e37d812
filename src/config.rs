// src/config.rs

//! Loads and validates the daemon's compiled-in tunables (SPEC_FULL §D).
//! The daemon proper takes no required configuration file; an optional
//! TOML file overrides these defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_bus_bind_addr() -> String {
    "0.0.0.0:9120".to_string()
}

fn default_client_socket_path() -> String {
    "/var/run/groupd/groupd.socket".to_string()
}

fn default_pidfile_path() -> String {
    "/var/run/groupd/groupd.pid".to_string()
}

fn default_ring_dump_path() -> String {
    "/var/run/groupd/ring.dump".to_string()
}

fn default_node_timeout_ms() -> u64 {
    5_000
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_levels() -> u8 {
    crate::core::MAX_LEVELS
}

fn default_max_members() -> usize {
    crate::core::MAX_MEMBERS
}

/// The handful of tunables the core reads. Absent an override file, the
/// daemon runs with the same defaults the original hardcodes in
/// `gd_internal.h` (`MAX_LEVELS`, `MAX_NODES`, `RETRY_DELAY`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_bus_bind_addr")]
    pub bus_bind_addr: String,

    #[serde(default = "default_client_socket_path")]
    pub client_socket_path: String,

    #[serde(default = "default_pidfile_path")]
    pub pidfile_path: String,

    #[serde(default = "default_ring_dump_path")]
    pub ring_dump_path: String,

    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_levels")]
    pub max_levels: u8,

    #[serde(default = "default_max_members")]
    pub max_members: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bus_bind_addr: default_bus_bind_addr(),
            client_socket_path: default_client_socket_path(),
            pidfile_path: default_pidfile_path(),
            ring_dump_path: default_ring_dump_path(),
            node_timeout_ms: default_node_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_levels: default_max_levels(),
            max_members: default_max_members(),
        }
    }
}

impl Config {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let config = Config::default();
        assert_eq!(config.max_levels, crate::core::MAX_LEVELS);
        assert_eq!(config.max_members, crate::core::MAX_MEMBERS);
    }

    #[tokio::test]
    async fn from_file_overrides_only_specified_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groupd.toml");
        tokio::fs::write(&path, "node_timeout_ms = 9999\n").await.unwrap();
        let config = Config::from_file(&path).await.unwrap();
        assert_eq!(config.node_timeout_ms, 9999);
        assert_eq!(config.max_levels, crate::core::MAX_LEVELS);
    }
}
