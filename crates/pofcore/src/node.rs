//! Node wiring.

use pofcore_chain::{Chain, FormulatorRank, MemChain, MemRank};
use pofcore_config::Config;
use pofcore_consensus::{FormulatorConfig, FormulatorNode};
use pofcore_crypto::ecdsa::PrivateKey;
use pofcore_p2p::{MemoryNodeStore, NodePoolStore};
use pofcore_txpool::{AcceptAllValidator, TransactionValidator};
use pofcore_types::{Address, PublicHash, Signature, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Result type alias for node wiring
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur while wiring or running a node
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration was rejected
    #[error("config error: {0}")]
    Config(#[from] pofcore_config::ConfigError),

    /// A hex field in the configuration failed to parse
    #[error("bad {field}: {message}")]
    BadField {
        /// Which configuration field
        field: &'static str,
        /// What went wrong
        message: String,
    },

    /// Key material was rejected
    #[error("key error: {0}")]
    Key(#[from] pofcore_crypto::CryptoError),

    /// The consensus core failed
    #[error(transparent)]
    Consensus(#[from] pofcore_consensus::ConsensusError),
}

fn parse_peer_map(
    field: &'static str,
    entries: &HashMap<String, String>,
) -> Result<HashMap<PublicHash, String>> {
    let mut out = HashMap::with_capacity(entries.len());
    for (hash, addr) in entries {
        let id = hash.parse::<PublicHash>().map_err(|e| NodeError::BadField {
            field,
            message: format!("{hash}: {e}"),
        })?;
        out.insert(id, addr.clone());
    }
    Ok(out)
}

/// A wired PoF Core node.
pub struct Node {
    formulator: FormulatorNode,
    bind_address: String,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("bind_address", &self.bind_address)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Wires a node from configuration against the bundled in-memory chain.
    ///
    /// Keys are taken from the config when present, otherwise generated
    /// fresh (useful for local networks).
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let signing_key = if config.formulator.signing_key.is_empty() {
            PrivateKey::random()
        } else {
            PrivateKey::from_hex(&config.formulator.signing_key)?
        };
        let node_key = if config.formulator.node_key.is_empty() {
            PrivateKey::random()
        } else {
            PrivateKey::from_hex(&config.formulator.node_key)?
        };

        let address = config
            .formulator
            .address
            .parse::<Address>()
            .map_err(|e| NodeError::BadField {
                field: "formulator.address",
                message: e.to_string(),
            })?;

        let genesis_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos() as u64;
        let chain: Arc<dyn Chain> = Arc::new(MemChain::new(config.chain.chain_id, genesis_timestamp));
        let rank: Arc<dyn FormulatorRank> = Arc::new(MemRank::single(address));
        let validator: Arc<dyn TransactionValidator> = Arc::new(AcceptAllValidator);
        let store: Arc<dyn NodePoolStore> = Arc::new(MemoryNodeStore::new());

        Self::with_collaborators(config, signing_key, node_key, chain, rank, validator, store)
    }

    /// Wires a node around the embedder's own collaborators.
    pub fn with_collaborators(
        config: &Config,
        signing_key: PrivateKey,
        node_key: PrivateKey,
        chain: Arc<dyn Chain>,
        rank: Arc<dyn FormulatorRank>,
        validator: Arc<dyn TransactionValidator>,
        store: Arc<dyn NodePoolStore>,
    ) -> Result<Self> {
        let address = config
            .formulator
            .address
            .parse::<Address>()
            .map_err(|e| NodeError::BadField {
                field: "formulator.address",
                message: e.to_string(),
            })?;

        let mut formulator_config = FormulatorConfig::new(address);
        formulator_config.max_transactions_per_block = config.formulator.max_transactions_per_block;
        formulator_config.max_blocks_per_formulator = config.formulator.max_blocks_per_formulator;

        let observers = parse_peer_map("network.observers", &config.network.observers)?;
        let seeds = parse_peer_map("network.seeds", &config.network.seeds)?;

        info!(
            formulator = %address,
            observers = observers.len(),
            seeds = seeds.len(),
            "node wired"
        );

        let formulator = FormulatorNode::new(
            formulator_config,
            signing_key,
            node_key,
            observers,
            seeds,
            chain,
            rank,
            validator,
            store,
        );

        Ok(Self {
            formulator,
            bind_address: config.network.bind_address.clone(),
        })
    }

    /// Validates the wiring.
    pub fn init(&self) -> Result<()> {
        self.formulator.init()?;
        Ok(())
    }

    /// Runs the node until [`Node::close`] is called.
    pub async fn run(&self) -> Result<()> {
        self.formulator.run(&self.bind_address).await?;
        Ok(())
    }

    /// Submits a transaction into the pool and gossips it.
    pub fn add_tx(&self, tx_type: u16, tx: Transaction, sigs: Vec<Signature>) -> Result<()> {
        self.formulator.add_tx(tx_type, tx, sigs)?;
        Ok(())
    }

    /// Shuts the node down.
    pub fn close(&self) {
        self.formulator.close();
    }

    /// The underlying formulator, for embedders needing direct access.
    pub fn formulator(&self) -> &FormulatorNode {
        &self.formulator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        let raw = r#"
            [formulator]
            address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1"

            [network]
            bind_address = "127.0.0.1:0"

            [network.observers]
            "0x0101010101010101010101010101010101010101010101010101010101010101" = "127.0.0.1:38000"
        "#;
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn test_from_config_wires_and_inits() {
        let node = Node::from_config(&sample_config()).unwrap();
        node.init().unwrap();
    }

    #[test]
    fn test_bad_observer_hash_is_reported() {
        let mut config = sample_config();
        config
            .network
            .observers
            .insert("nonsense".into(), "127.0.0.1:1".into());
        let err = Node::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            NodeError::BadField {
                field: "network.observers",
                ..
            }
        ));
    }
}
