//! Configuration sections and loading.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Root configuration, loaded from a single `pofcore.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chain identity
    #[serde(default)]
    pub chain: ChainConfig,

    /// Formulator parameters
    #[serde(default)]
    pub formulator: FormulatorSection,

    /// Mesh networking
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.formulator.address.is_empty() {
            return Err(ConfigError::Invalid(
                "formulator.address must be set".into(),
            ));
        }
        if self.formulator.max_blocks_per_formulator == 0 {
            return Err(ConfigError::Invalid(
                "formulator.max_blocks_per_formulator must be at least 1".into(),
            ));
        }
        if self.network.bind_address.is_empty() {
            return Err(ConfigError::Invalid("network.bind_address must be set".into()));
        }
        for (hash, addr) in &self.network.observers {
            if addr.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "network.observers entry {hash} has an empty address"
                )));
            }
        }
        Ok(())
    }
}

fn default_chain_id() -> u8 {
    1
}

fn default_max_transactions() -> usize {
    5_000
}

fn default_max_blocks() -> u32 {
    10
}

fn default_bind_address() -> String {
    "0.0.0.0:38755".into()
}

fn default_log_level() -> String {
    "info".into()
}

/// Chain identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier carried in headers and handshakes
    #[serde(default = "default_chain_id")]
    pub chain_id: u8,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { chain_id: 1 }
    }
}

/// Formulator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulatorSection {
    /// Hex address this node formulates as
    pub address: String,

    /// Hex signing key; empty means a fresh key is generated at startup
    #[serde(default)]
    pub signing_key: String,

    /// Hex node-mesh identity key; empty means a fresh key is generated
    #[serde(default)]
    pub node_key: String,

    /// Cap on transactions included per block
    #[serde(default = "default_max_transactions")]
    pub max_transactions_per_block: usize,

    /// Cap on consecutive blocks per formulator slot
    #[serde(default = "default_max_blocks")]
    pub max_blocks_per_formulator: u32,
}

impl Default for FormulatorSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            signing_key: String::new(),
            node_key: String::new(),
            max_transactions_per_block: 5_000,
            max_blocks_per_formulator: 10,
        }
    }
}

/// Mesh networking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the node mesh listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Observer set: hex public hash → network address
    #[serde(default)]
    pub observers: HashMap<String, String>,

    /// Seed nodes: hex public hash → network address
    #[serde(default)]
    pub seeds: HashMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:38755".into(),
            observers: HashMap::new(),
            seeds: HashMap::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter, e.g. `info` or `pofcore=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        let mut config = Config::default();
        config.formulator.address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1".into();
        config
    }

    #[test]
    fn test_defaults_fill_sections() {
        let config = minimal();
        assert_eq!(config.chain.chain_id, 1);
        assert_eq!(config.formulator.max_transactions_per_block, 5_000);
        assert_eq!(config.formulator.max_blocks_per_formulator, 10);
        assert_eq!(config.network.bind_address, "0.0.0.0:38755");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_missing_address() {
        let config = Config::default();
        assert!(config.validate().is_err());
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = minimal();
        config.network.observers.insert(
            "0x0101010101010101010101010101010101010101010101010101010101010101".into(),
            "observer-0:38000".into(),
        );
        let raw = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.formulator.address, config.formulator.address);
        assert_eq!(parsed.network.observers.len(), 1);
    }

    #[test]
    fn test_minimal_toml_parses() {
        let raw = r#"
            [formulator]
            address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1"

            [network.observers]
            "0x0101010101010101010101010101010101010101010101010101010101010101" = "observer-0:38000"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.formulator.max_blocks_per_formulator, 10);
    }
}
