//! Node configuration stored as `config.json` in the owner directory.
//!
//! Every field has a default, so a missing file or a partial one still
//! yields a usable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use dscuss_shared::constants::{
    DEFAULT_BOOTSTRAP_ADDRESS, DEFAULT_DHT_PORT, DEFAULT_DNS_SEED, DEFAULT_PORT,
    DEFAULT_POW_DIFFICULTY, MAX_POW_DIFFICULTY,
};

use crate::error::{DscussError, Result};

pub const CONFIG_FILE: &str = "config.json";

/// Where the connection provider learns addresses to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// `<nickname>/addresses`, one `host:port` per line.
    File,
    /// Kademlia providers for the subscribed topics.
    Dht,
    /// A records of the DNS seed.
    Dns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface the node listens on.
    pub hostname: String,

    /// TCP port for peer connections. `0` picks a free one.
    pub port: u16,

    pub max_in_connections: usize,
    pub max_out_connections: usize,

    /// Dialled before the address provider reports anything.
    pub bootstrap_addresses: Vec<String>,

    pub address_provider: AddressSource,

    /// UDP port of the Kademlia swarm, used with `"dht"`.
    pub dht_port: u16,

    /// Multiaddrs (with `/p2p/` suffix) of known Kademlia nodes.
    pub dht_bootstrap: Vec<String>,

    /// Resolved with `"dns"`.
    pub dns_seed: String,

    /// Leading zero bits required of a user's proof of work.
    pub pow_difficulty: u32,

    /// Log in without starting the peer subsystem.
    pub offline: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            max_in_connections: 10,
            max_out_connections: 10,
            bootstrap_addresses: vec![DEFAULT_BOOTSTRAP_ADDRESS.into()],
            address_provider: AddressSource::File,
            dht_port: DEFAULT_DHT_PORT,
            dht_bootstrap: Vec::new(),
            dns_seed: DEFAULT_DNS_SEED.into(),
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
            offline: false,
        }
    }
}

impl Config {
    /// Read `<dir>/config.json`, writing the defaults there if it is absent.
    pub fn load_or_init(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Self::default();
            config.save(dir)?;
            info!(path = %path.display(), "wrote default configuration");
            return Ok(config);
        }
        let json = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| DscussError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pow_difficulty > MAX_POW_DIFFICULTY {
            return Err(DscussError::Config(format!(
                "pow_difficulty {} exceeds {MAX_POW_DIFFICULTY}",
                self.pow_difficulty
            )));
        }
        Ok(())
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DscussError::Internal(format!("config serialization: {e}")))?;
        std::fs::write(dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// `host:port` the connection provider listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_init(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(Config::load_or_init(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"port": 9000, "address_provider": "dns", "offline": true}"#,
        )
        .unwrap();
        let config = Config::load_or_init(dir.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.address_provider, AddressSource::Dns);
        assert!(config.offline);
        assert_eq!(config.hostname, "0.0.0.0");
        assert_eq!(config.bootstrap_addresses, vec!["dscuss.org:8004".to_string()]);
        assert_eq!(config.pow_difficulty, 16);
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(Config::load_or_init(dir.path()), Err(DscussError::Config(_))));

        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"address_provider": "carrier"}"#).unwrap();
        assert!(matches!(Config::load_or_init(dir.path()), Err(DscussError::Config(_))));
    }

    #[test]
    fn test_unreachable_difficulty_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"pow_difficulty": 300}"#).unwrap();
        assert!(matches!(Config::load_or_init(dir.path()), Err(DscussError::Config(_))));

        let config = Config {
            pow_difficulty: MAX_POW_DIFFICULTY,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
