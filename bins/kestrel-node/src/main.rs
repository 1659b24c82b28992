//! Kestrel node binary.
//!
//! Opens the chain state (creating it on first run), recovers from any
//! interrupted UTXO flush, reports the tip and optionally imports or exports
//! a UTXO snapshot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_core::constants::NetworkType;
use kestrel_node_lib::config::DEFAULT_UTXO_FLUSH_BATCH;
use kestrel_node_lib::{BlockChain, DbBackend, NodeConfig};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "kestrel-node",
    version,
    about = "Kestrel node: open, recover and inspect the chain state"
)]
struct Args {
    /// Data directory for chain data
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Storage backend ("rocksdb" or "memory")
    #[arg(long, default_value = "rocksdb", value_parser = ["rocksdb", "memory"])]
    db: String,

    /// Maximum UTXO rows written per flush transaction
    #[arg(long, default_value_t = DEFAULT_UTXO_FLUSH_BATCH)]
    utxo_flush_batch: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Print the chain summary as JSON
    #[arg(long)]
    json: bool,

    /// Load the UTXO set from a snapshot file taken at the current tip
    #[arg(long, conflicts_with = "export_utxo_snapshot")]
    import_utxo_snapshot: Option<PathBuf>,

    /// Write the UTXO set to a snapshot file
    #[arg(long)]
    export_utxo_snapshot: Option<PathBuf>,

    /// Use the public test network
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Use a local regression-test network
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

/// What to do once the chain is open.
struct Actions {
    json: bool,
    log_format: String,
    import: Option<PathBuf>,
    export: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> (NodeConfig, Actions) {
        let network = if self.regtest {
            NetworkType::Regtest
        } else if self.testnet {
            NetworkType::Testnet
        } else {
            NetworkType::Mainnet
        };

        let db_backend = match self.db.as_str() {
            "memory" => DbBackend::Memory,
            _ => DbBackend::RocksDb,
        };

        let config = NodeConfig {
            data_dir: self.data_dir.unwrap_or_else(|| NodeConfig::default_data_dir(network)),
            network,
            db_backend,
            log_level: self.log_level,
            utxo_flush_batch: self.utxo_flush_batch,
        };
        let actions = Actions {
            json: self.json,
            log_format: self.log_format,
            import: self.import_utxo_snapshot,
            export: self.export_utxo_snapshot,
        };
        (config, actions)
    }
}

/// Summary printed after the chain state has been opened.
#[derive(Serialize, Debug)]
struct ChainInfo {
    network: String,
    height: u32,
    hash: String,
    total_txns: u64,
    chain_work: String,
    blocks_indexed: usize,
    utxo_status_at_open: String,
    utxo_status: String,
    chain_type: String,
    prune_height: Option<u32>,
}

impl ChainInfo {
    fn collect(chain: &BlockChain) -> Result<Self> {
        let best = chain.best_state();
        Ok(Self {
            network: format!("{:?}", chain.params().network),
            height: best.height,
            hash: best.hash.to_string(),
            total_txns: best.total_txns,
            chain_work: best.work_sum.to_string(),
            blocks_indexed: chain.block_index().len(),
            utxo_status_at_open: chain.utxo_status().to_string(),
            utxo_status: chain.current_utxo_status()?.to_string(),
            chain_type: format!("{:?}", chain.chain_type()?),
            prune_height: chain.prune_height()?,
        })
    }
}

fn main() {
    let (config, actions) = Args::parse().into_config();
    init_logging(&config.log_level, &actions.log_format);

    info!("Kestrel node v{}", env!("CARGO_PKG_VERSION"));
    info!(network = ?config.network, data_dir = ?config.data_dir, backend = ?config.db_backend, "starting");

    if let Err(e) = run(&config, &actions) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(config: &NodeConfig, actions: &Actions) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let mut chain = BlockChain::from_config(config).context("opening chain state")?;

    if let Some(path) = &actions.import {
        let data = std::fs::read(path)
            .with_context(|| format!("reading utxo snapshot {}", path.display()))?;
        let count = chain
            .import_utxo_snapshot(&data)
            .with_context(|| format!("importing utxo snapshot {}", path.display()))?;
        info!(utxos = count, path = %path.display(), "utxo snapshot imported");
    }

    if let Some(path) = &actions.export {
        let data = chain.export_utxo_snapshot().context("exporting utxo snapshot")?;
        std::fs::write(path, &data)
            .with_context(|| format!("writing utxo snapshot {}", path.display()))?;
        info!(bytes = data.len(), path = %path.display(), "utxo snapshot written");
    }

    let info = ChainInfo::collect(&chain)?;
    if actions.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("network:      {}", info.network);
        println!("tip:          {} (height {})", info.hash, info.height);
        println!("transactions: {}", info.total_txns);
        println!("chain work:   {}", info.chain_work);
        println!("block index:  {} nodes", info.blocks_indexed);
        println!("utxo status:  {} (at open: {})", info.utxo_status, info.utxo_status_at_open);
        println!("chain type:   {}", info.chain_type);
        if let Some(height) = info.prune_height {
            println!("pruned below: {height}");
        }
    }

    chain.database().flush().context("flushing database")?;
    info!("shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber. `format = "json"` selects structured
/// JSON output; anything else is human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
