//! Broker configuration.
//!
//! Loaded best-effort from a JSON file; every field has a default so a
//! missing or partial file still yields a runnable broker.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::persist::load_json;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub description: String,
    pub enable_authentication: bool,
    pub require_authentication: bool,
    pub enable_ip_whitelist: bool,
    /// Idle threshold for connection cleanup, seconds.
    pub connection_timeout: u64,
    /// Per-frame read timeout, seconds.
    pub read_timeout: u64,
    /// Frame size bound, bytes.
    pub max_message_size: usize,
    pub max_connections: usize,
    pub max_queued_messages_per_user: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6667,
            server_name: "CloakChat Broker".to_string(),
            description: "Welcome to CloakChat!".to_string(),
            enable_authentication: false,
            require_authentication: false,
            enable_ip_whitelist: false,
            connection_timeout: 300,
            read_timeout: 60,
            max_message_size: 65_536,
            max_connections: 1000,
            max_queued_messages_per_user: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &Path) -> Self {
        match load_json::<BrokerConfig>(path) {
            Some(config) => {
                info!(path = %path.display(), "loaded broker config");
                config
            }
            None => {
                info!("no broker config found, using defaults");
                BrokerConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_limits() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 6667);
        assert_eq!(config.max_message_size, 65_536);
        assert_eq!(config.max_queued_messages_per_user, 1000);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 7000, "server_name": "test"}"#).unwrap();
        let config = BrokerConfig::load(&path);
        assert_eq!(config.port, 7000);
        assert_eq!(config.server_name, "test");
        assert_eq!(config.read_timeout, 60);
    }
}
