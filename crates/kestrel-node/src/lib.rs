//! # kestrel-node-lib: Chain state persistence for the Kestrel node.
//!
//! Everything the node keeps on disk about the chain:
//! - [`database`]: transactional bucket store over RocksDB or memory
//! - [`keys`], [`utxo`]: the unspent output set and the UTXO viewpoint
//! - [`spend_journal`]: per-block records of spent outputs, for undo
//! - [`block_index`]: header rows, main-chain hash/height maps, block tree
//! - [`best_state`], [`consistency`], [`metadata`]: singleton records
//! - [`chain::BlockChain`]: bootstrap, recovery, connect and disconnect
//! - [`config::NodeConfig`]: node configuration

pub mod best_state;
pub mod block_index;
pub mod chain;
pub mod config;
pub mod consistency;
pub mod database;
pub mod keys;
pub mod metadata;
pub mod migrate;
pub mod snapshot;
pub mod spend_journal;
pub mod utxo;

pub use chain::BlockChain;
pub use config::{DbBackend, NodeConfig};
pub use database::Database;
