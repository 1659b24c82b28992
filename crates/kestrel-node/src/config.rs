//! Node configuration for the Kestrel chain state.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, network,
//! storage backend and UTXO flush sizing.

use std::path::PathBuf;

use kestrel_core::constants::NetworkType;

/// Default number of UTXO rows written per flush transaction.
pub const DEFAULT_UTXO_FLUSH_BATCH: usize = 50_000;

/// Storage engine behind the chain database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbBackend {
    /// Persistent RocksDB store under [`NodeConfig::db_path`].
    #[default]
    RocksDb,
    /// Volatile in-memory store; everything is lost on exit.
    Memory,
}

/// Configuration for a chain state instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Network whose genesis block the chain is rooted at.
    pub network: NetworkType,
    pub db_backend: DbBackend,
    /// Log level filter string (e.g. "info", "debug", "kestrel_node_lib=trace").
    pub log_level: String,
    /// Maximum UTXO rows written per transaction while flushing.
    pub utxo_flush_batch: usize,
}

impl NodeConfig {
    /// Default data directory for `network`: `<data dir>/kestrel/<network>`.
    pub fn default_data_dir(network: NetworkType) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kestrel")
            .join(network.data_dir_suffix())
    }

    /// Defaults for `network`.
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            data_dir: Self::default_data_dir(network),
            network,
            ..Self::default()
        }
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        let network = NetworkType::default();
        Self {
            data_dir: Self::default_data_dir(network),
            network,
            db_backend: DbBackend::default(),
            log_level: "info".to_string(),
            utxo_flush_batch: DEFAULT_UTXO_FLUSH_BATCH,
        }
    }
}
