//! # PoF Core Config
//!
//! Single-file TOML configuration for PoF Core nodes.
//!
//! All settings live in one `pofcore.toml` with a section per concern:
//! `[chain]`, `[formulator]`, `[network]`, `[logging]`. Every section has
//! sensible defaults so a minimal file only names the formulator address and
//! the observer set.
//!
//! ## Example
//!
//! ```toml
//! [chain]
//! chain_id = 1
//!
//! [formulator]
//! address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1"
//!
//! [network]
//! bind_address = "0.0.0.0:38755"
//!
//! [network.observers]
//! "0x4717…fad" = "observer-0.example.org:38000"
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;

pub use config::{
    ChainConfig, Config, FormulatorSection, LoggingConfig, NetworkConfig,
};

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The TOML could not be serialized
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A setting failed validation
    #[error("invalid config: {0}")]
    Invalid(String),
}
