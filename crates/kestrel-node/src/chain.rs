//! Chain orchestrator: bootstrap, recovery and tip movement.
//!
//! [`BlockChain::open`] either creates a fresh chain state rooted at the
//! network's genesis block or reloads an existing one:
//!
//! 1. migrate stores that predate the block index bucket,
//! 2. rebuild the in-memory block tree from the block index rows,
//! 3. find the tip named by the best chain state and mark its ancestors
//!    valid,
//! 4. check the UTXO consistency marker and replay main-chain blocks into
//!    the UTXO set if a flush was interrupted.
//!
//! Structural problems found on the way (index not rooted at genesis, tip
//! missing from the index, unreplayable UTXO state) are fatal.
//!
//! Connecting or disconnecting a block is a single store transaction that
//! touches the UTXO set, the spend journal, the block index, both main-chain
//! maps and the consistency marker, and rewrites the best chain state last.

use tracing::{debug, info, warn};

use kestrel_core::error::ChainError;
use kestrel_core::genesis::ChainParams;
use kestrel_core::types::{Block, Hash256, OutPoint};
use kestrel_core::work::calc_work;

use crate::best_state::{BestChainState, db_fetch_best_state, db_put_best_state};
use crate::block_index::{
    BLOCK_INDEX_BUCKET, BLOCK_INDEX_VERSION_KEY, BlockIndex, BlockStatus,
    CURRENT_BLOCK_INDEX_VERSION, HASH_INDEX_BUCKET, HEIGHT_INDEX_BUCKET, db_fetch_hash_by_height,
    db_fetch_height_by_hash, db_put_block_index, db_put_block_index_row, db_remove_block_index,
    decode_block_index_key, deserialize_block_index_row,
};
use crate::config::{DEFAULT_UTXO_FLUSH_BATCH, DbBackend, NodeConfig};
use crate::consistency::{IMPORT_ONGOING, UtxoStatus, db_fetch_utxo_status, db_put_utxo_status};
use crate::database::{Database, Tx};
use crate::metadata::{
    ChainType, db_fetch_chain_type, db_fetch_prune_height, db_put_chain_type,
    db_put_prune_height, ensure_version,
};
use crate::migrate::rebuild_block_index;
use crate::snapshot::{append_snapshot_record, parse_utxo_snapshot};
use crate::spend_journal::{
    CURRENT_SPEND_JOURNAL_VERSION, SPEND_JOURNAL_BUCKET, SPEND_JOURNAL_VERSION_KEY, SpentTxOut,
    db_fetch_spend_journal_entry, db_put_spend_journal_entry, db_remove_spend_journal_entry,
};
use crate::utxo::{
    CURRENT_UTXO_SET_VERSION, UTXO_SET_BUCKET, UTXO_SET_VERSION_KEY, UtxoEntry, UtxoViewpoint,
    db_fetch_utxo_entry, db_fetch_utxo_entry_by_hash, db_for_each_utxo, db_put_utxo_entry,
    db_put_utxo_view,
};

/// Status of every block on the main chain.
const MAIN_CHAIN_STATUS: BlockStatus = BlockStatus::DATA_STORED.union(BlockStatus::VALID);

/// Persistent chain state with its in-memory block tree.
///
/// Mutating methods take `&mut self`; callers that share a chain across
/// threads wrap it in their own lock.
pub struct BlockChain {
    db: Database,
    params: &'static ChainParams,
    index: BlockIndex,
    tip: usize,
    best: BestChainState,
    utxo_status_at_open: UtxoStatus,
    utxo_flush_batch: usize,
}

impl BlockChain {
    /// Open the chain state in `db`, creating it if the store is empty.
    pub fn open(db: Database, params: &'static ChainParams) -> Result<Self, ChainError> {
        let initialised = db.view(|tx| Ok::<_, ChainError>(db_fetch_best_state(tx)?.is_some()))?;
        if initialised {
            info!(network = ?params.network, "loading chain state");
            if !db.view(|tx| tx.bucket_exists(BLOCK_INDEX_BUCKET))? {
                db.update(|tx| rebuild_block_index(tx))?;
            }
        } else {
            info!(network = ?params.network, genesis = %params.genesis_hash, "creating chain state");
            db.update(|tx| create_chain_state(tx, params))?;
        }

        db.update(|tx| -> Result<(), ChainError> {
            ensure_version(tx, UTXO_SET_VERSION_KEY, CURRENT_UTXO_SET_VERSION)?;
            ensure_version(tx, SPEND_JOURNAL_VERSION_KEY, CURRENT_SPEND_JOURNAL_VERSION)?;
            ensure_version(tx, BLOCK_INDEX_VERSION_KEY, CURRENT_BLOCK_INDEX_VERSION)?;
            Ok(())
        })?;

        let (mut index, best, tip) = db.view(|tx| load_block_index(tx, params))?;
        promote_ancestors(&mut index, tip);
        if index.has_dirty() {
            let written = db.update(|tx| index.flush_to_db(tx))?;
            debug!(rows = written, "flushed block index");
        }

        info!(
            height = best.height,
            hash = %best.hash,
            total_txns = best.total_txns,
            work = %best.work_sum,
            blocks = index.len(),
            "chain state loaded"
        );

        let mut chain = Self {
            db,
            params,
            index,
            tip,
            best,
            utxo_status_at_open: UtxoStatus::Unset,
            utxo_flush_batch: DEFAULT_UTXO_FLUSH_BATCH,
        };
        chain.reconcile_utxo_set()?;
        Ok(chain)
    }

    /// Open the database described by `config` and load its chain state.
    pub fn from_config(config: &NodeConfig) -> Result<Self, ChainError> {
        let db = match config.db_backend {
            DbBackend::RocksDb => Database::open_rocks(config.db_path())?,
            DbBackend::Memory => Database::in_memory()?,
        };
        let chain = Self::open(db, ChainParams::for_network(config.network))?;
        Ok(chain.with_utxo_flush_batch(config.utxo_flush_batch))
    }

    /// Cap the UTXO rows written per flush transaction.
    pub fn with_utxo_flush_batch(mut self, batch: usize) -> Self {
        self.utxo_flush_batch = batch.max(1);
        self
    }

    /// Check the UTXO consistency marker against the tip and repair the
    /// UTXO set if a flush did not finish.
    fn reconcile_utxo_set(&mut self) -> Result<(), ChainError> {
        let status = self.db.view(|tx| db_fetch_utxo_status(tx))?;
        self.utxo_status_at_open = status;
        let tip = self.best.hash;

        match status {
            UtxoStatus::Unset => {
                info!(%tip, "no utxo consistency marker, assuming the utxo set matches the tip");
                self.db.update(|tx| db_put_utxo_status(tx, UtxoStatus::Consistent(tip)))?;
            }
            UtxoStatus::Consistent(hash) if hash == tip => {}
            UtxoStatus::FlushOngoing(IMPORT_ONGOING) => {
                return Err(ChainError::Assert(format!(
                    "utxo snapshot import at {tip} was interrupted, the utxo set is incomplete; \
                     import the snapshot again into an empty data directory"
                )));
            }
            UtxoStatus::Consistent(from) | UtxoStatus::FlushOngoing(from) => {
                warn!(%status, %tip, "utxo set does not match the tip, replaying blocks");
                self.replay_utxo_set_from(from)?;
                self.db.update(|tx| db_put_utxo_status(tx, UtxoStatus::Consistent(tip)))?;
                info!(%tip, "utxo set repaired");
            }
        }
        Ok(())
    }

    /// Roll the UTXO set forward over every main-chain block after `from`.
    fn replay_utxo_set_from(&self, from: Hash256) -> Result<(), ChainError> {
        let (start, prune_height) = self.db.view(|tx| -> Result<_, ChainError> {
            let start = db_fetch_height_by_hash(tx, &from).map_err(|e| match e {
                ChainError::NotInMainChain(_) => ChainError::Assert(format!(
                    "utxo set state {from} is not on the main chain, cannot replay"
                )),
                other => other,
            })?;
            Ok((start, db_fetch_prune_height(tx)?))
        })?;

        if let Some(prune_height) = prune_height.filter(|&prune_height| start + 1 < prune_height) {
            return Err(ChainError::Assert(format!(
                "utxo set state at height {start} is below prune height {prune_height}, cannot replay"
            )));
        }

        for height in start + 1..=self.best.height {
            self.db.update(|tx| -> Result<(), ChainError> {
                let hash = db_fetch_hash_by_height(tx, height)?;
                let block = tx.fetch_block(&hash)?;
                let mut view = UtxoViewpoint::new();
                view.replay_block(&block, height as i32);
                db_put_utxo_view(tx, &view)?;
                info!(height, %hash, "replayed block into utxo set");
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Extend the main chain with `block`, which must build on the tip.
    pub fn connect_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.main_chain_has_block(&hash)? {
            return Err(ChainError::DuplicateBlock(hash.to_string()));
        }
        if block.header.prev_block != self.best.hash {
            return Err(ChainError::OrphanBlock {
                block: hash.to_string(),
                tip: self.best.hash.to_string(),
            });
        }

        let height = self.best.height + 1;
        let state = BestChainState {
            hash,
            height,
            total_txns: self.best.total_txns + block.transactions.len() as u64,
            work_sum: &self.best.work_sum + calc_work(block.header.bits),
        };

        // A block seen before as a side branch keeps its other bits, but a
        // failed validation no longer applies once it is connected.
        let status = match self.index.lookup(&hash) {
            Some(known) => {
                (self.index.node(known).status
                    - (BlockStatus::VALIDATE_FAILED | BlockStatus::INVALID_ANCESTOR))
                    | MAIN_CHAIN_STATUS
            }
            None => MAIN_CHAIN_STATUS,
        };

        self.db.update(|tx| -> Result<(), ChainError> {
            let mut view = UtxoViewpoint::new();
            let mut stxos = Vec::with_capacity(block.spent_output_count());
            view.fetch_input_utxos(tx, block)?;
            view.connect_transactions(block, height as i32, &mut stxos)?;

            tx.store_block(block)?;
            db_put_block_index_row(tx, &hash, height, &block.header, status)?;
            db_put_block_index(tx, &hash, height)?;
            db_put_utxo_view(tx, &view)?;
            db_put_spend_journal_entry(tx, &hash, &stxos)?;
            db_put_utxo_status(tx, UtxoStatus::Consistent(hash))?;
            db_put_best_state(tx, &state)
        })?;

        let node = self.index.add_node(block.header.clone(), Some(self.tip), status);
        self.index.set_persisted_status(node, status);
        self.tip = node;
        self.best = state;

        info!(height, %hash, txs = block.transactions.len(), "connected block");
        Ok(())
    }

    /// Remove the tip from the main chain, restoring the outputs it spent.
    /// Returns the disconnected block.
    pub fn disconnect_tip(&mut self) -> Result<Block, ChainError> {
        if self.best.height == 0 {
            return Err(ChainError::DisconnectGenesis);
        }
        let hash = self.best.hash;
        let height = self.best.height;
        let parent = self.index.node(self.tip).parent.ok_or_else(|| {
            ChainError::Assert(format!("tip {hash} at height {height} has no parent"))
        })?;
        let parent_node = self.index.node(parent);

        let (block, state) = self.db.update(|tx| -> Result<_, ChainError> {
            let block = tx.fetch_block(&hash)?;
            let stxos = db_fetch_spend_journal_entry(tx, &block)?;

            let mut view = UtxoViewpoint::new();
            view.disconnect_transactions(tx, &block, &stxos)?;
            db_put_utxo_view(tx, &view)?;
            db_remove_spend_journal_entry(tx, &hash)?;
            db_remove_block_index(tx, &hash, height)?;
            db_put_utxo_status(tx, UtxoStatus::Consistent(parent_node.hash))?;

            let total_txns = self
                .best
                .total_txns
                .checked_sub(block.transactions.len() as u64)
                .ok_or_else(|| {
                    ChainError::Assert(format!(
                        "total transaction count {} is below the {} of block {hash}",
                        self.best.total_txns,
                        block.transactions.len()
                    ))
                })?;
            let state = BestChainState {
                hash: parent_node.hash,
                height: parent_node.height,
                total_txns,
                work_sum: parent_node.work_sum.clone(),
            };
            db_put_best_state(tx, &state)?;
            Ok((block, state))
        })?;

        self.tip = parent;
        self.best = state;
        info!(height, %hash, "disconnected block");
        Ok(block)
    }

    /// Write the modified entries of `view` in bounded batches, bracketed by
    /// the consistency marker, leaving the set marked consistent with
    /// `target`.
    pub fn flush_utxo_view(&self, view: &UtxoViewpoint, target: Hash256) -> Result<(), ChainError> {
        let from = match self.db.view(|tx| db_fetch_utxo_status(tx))? {
            UtxoStatus::Consistent(hash) | UtxoStatus::FlushOngoing(hash) => hash,
            UtxoStatus::Unset => self.best.hash,
        };
        self.db.update(|tx| db_put_utxo_status(tx, UtxoStatus::FlushOngoing(from)))?;
        self.write_utxo_batches(view, from, target)
    }

    /// Write the batches of a flush whose ongoing marker is already stored,
    /// then mark the set consistent with `target`.
    fn write_utxo_batches(
        &self,
        view: &UtxoViewpoint,
        from: Hash256,
        target: Hash256,
    ) -> Result<(), ChainError> {
        let modified: Vec<(&OutPoint, &UtxoEntry)> = view.modified_entries().collect();
        for batch in modified.chunks(self.utxo_flush_batch) {
            self.db.update(|tx| -> Result<(), ChainError> {
                for (outpoint, entry) in batch {
                    db_put_utxo_entry(tx, outpoint, entry)?;
                }
                Ok(())
            })?;
            debug!(rows = batch.len(), "flushed utxo batch");
        }

        self.db.update(|tx| db_put_utxo_status(tx, UtxoStatus::Consistent(target)))?;
        info!(rows = modified.len(), %from, %target, "utxo view flushed");
        Ok(())
    }

    /// Load a UTXO snapshot taken at the current tip and mark the store as
    /// fast-synced. Returns the number of imported outputs.
    ///
    /// The store is marked fast-synced and import-ongoing before the first
    /// row is written. If the import does not finish, the next open fails
    /// instead of trusting a partial set.
    pub fn import_utxo_snapshot(&mut self, data: &[u8]) -> Result<usize, ChainError> {
        let records = parse_utxo_snapshot(data)?;
        let mut view = UtxoViewpoint::new();
        for (outpoint, entry) in records {
            view.add_entry(outpoint, entry);
        }
        view.set_best_hash(self.best.hash);

        self.db.update(|tx| -> Result<(), ChainError> {
            db_put_chain_type(tx, ChainType::FastSync)?;
            db_put_utxo_status(tx, UtxoStatus::FlushOngoing(IMPORT_ONGOING))
        })?;
        self.write_utxo_batches(&view, IMPORT_ONGOING, self.best.hash)?;
        info!(utxos = view.len(), tip = %self.best.hash, "imported utxo snapshot");
        Ok(view.len())
    }

    /// Serialize the whole UTXO set as a snapshot.
    pub fn export_utxo_snapshot(&self) -> Result<Vec<u8>, ChainError> {
        let mut buf = Vec::new();
        let mut count = 0usize;
        self.db.view(|tx| {
            db_for_each_utxo(tx, |outpoint, entry| {
                count += 1;
                append_snapshot_record(&mut buf, &outpoint, &entry)
            })
        })?;
        info!(utxos = count, tip = %self.best.hash, "exported utxo snapshot");
        Ok(buf)
    }

    // --- Queries ---

    pub fn params(&self) -> &'static ChainParams {
        self.params
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn block_index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn best_state(&self) -> &BestChainState {
        &self.best
    }

    /// Consistency marker as found when the chain was opened.
    pub fn utxo_status(&self) -> UtxoStatus {
        self.utxo_status_at_open
    }

    /// Consistency marker as currently stored.
    pub fn current_utxo_status(&self) -> Result<UtxoStatus, ChainError> {
        self.db.view(|tx| db_fetch_utxo_status(tx))
    }

    pub fn block_hash_by_height(&self, height: u32) -> Result<Hash256, ChainError> {
        self.db.view(|tx| db_fetch_hash_by_height(tx, height))
    }

    pub fn block_height_by_hash(&self, hash: &Hash256) -> Result<u32, ChainError> {
        self.db.view(|tx| db_fetch_height_by_hash(tx, hash))
    }

    pub fn main_chain_has_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        match self.block_height_by_hash(hash) {
            Ok(_) => Ok(true),
            Err(ChainError::NotInMainChain(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn fetch_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
        Ok(self.db.view(|tx| tx.fetch_block(hash))?)
    }

    pub fn fetch_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
        self.db.view(|tx| db_fetch_utxo_entry(tx, outpoint))
    }

    /// Any unspent output of `txid`.
    pub fn fetch_utxo_by_hash(&self, txid: &Hash256) -> Result<Option<UtxoEntry>, ChainError> {
        self.db.view(|tx| db_fetch_utxo_entry_by_hash(tx, txid))
    }

    /// Outputs spent by the main-chain block `hash`, in spend order.
    pub fn fetch_spend_journal(&self, hash: &Hash256) -> Result<Vec<SpentTxOut>, ChainError> {
        self.db.view(|tx| {
            let block = tx.fetch_block(hash)?;
            db_fetch_spend_journal_entry(tx, &block)
        })
    }

    pub fn chain_type(&self) -> Result<ChainType, ChainError> {
        self.db.view(|tx| db_fetch_chain_type(tx))
    }

    pub fn set_chain_type(&self, chain_type: ChainType) -> Result<(), ChainError> {
        self.db.update(|tx| db_put_chain_type(tx, chain_type))
    }

    pub fn prune_height(&self) -> Result<Option<u32>, ChainError> {
        self.db.view(|tx| db_fetch_prune_height(tx))
    }

    pub fn set_prune_height(&self, height: u32) -> Result<(), ChainError> {
        self.db.update(|tx| db_put_prune_height(tx, height))
    }
}

/// Lay down a fresh chain state rooted at the genesis block. The genesis
/// coinbase output is never added to the UTXO set.
fn create_chain_state(tx: &mut Tx<'_>, params: &ChainParams) -> Result<(), ChainError> {
    for bucket in [
        BLOCK_INDEX_BUCKET,
        HASH_INDEX_BUCKET,
        HEIGHT_INDEX_BUCKET,
        SPEND_JOURNAL_BUCKET,
        UTXO_SET_BUCKET,
    ] {
        tx.create_bucket_if_not_exists(bucket)?;
    }

    ensure_version(tx, UTXO_SET_VERSION_KEY, CURRENT_UTXO_SET_VERSION)?;
    ensure_version(tx, SPEND_JOURNAL_VERSION_KEY, CURRENT_SPEND_JOURNAL_VERSION)?;
    ensure_version(tx, BLOCK_INDEX_VERSION_KEY, CURRENT_BLOCK_INDEX_VERSION)?;

    let genesis = &params.genesis_block;
    let hash = params.genesis_hash;
    db_put_block_index_row(tx, &hash, 0, &genesis.header, MAIN_CHAIN_STATUS)?;
    db_put_block_index(tx, &hash, 0)?;
    db_put_utxo_status(tx, UtxoStatus::Consistent(hash))?;
    tx.store_block(genesis)?;

    let state = BestChainState {
        hash,
        height: 0,
        total_txns: genesis.transactions.len() as u64,
        work_sum: calc_work(genesis.header.bits),
    };
    db_put_best_state(tx, &state)
}

/// Rebuild the block tree from the block index rows. Returns the tree, the
/// best chain state and the arena index of the tip.
fn load_block_index(
    tx: &Tx<'_>,
    params: &ChainParams,
) -> Result<(BlockIndex, BestChainState, usize), ChainError> {
    let best = db_fetch_best_state(tx)?
        .ok_or_else(|| ChainError::Assert("best chain state disappeared".into()))?;

    let mut index = BlockIndex::new();
    let mut last: Option<usize> = None;
    let mut cursor = tx.cursor(BLOCK_INDEX_BUCKET)?;
    let mut row = cursor.first()?;
    while let Some((key, value)) = row {
        let (height, hash) = decode_block_index_key(&key)
            .map_err(|e| e.into_corruption(format!("block index key {}", hex::encode(&key))))?;
        let (header, status) = deserialize_block_index_row(&value)
            .map_err(|e| e.into_corruption(format!("block index row for {hash} at height {height}")))?;

        let parent = match last {
            None => {
                if hash != params.genesis_hash {
                    return Err(ChainError::Assert(format!(
                        "block index is not rooted at genesis: first row is {hash}, want {}",
                        params.genesis_hash
                    )));
                }
                None
            }
            // Rows mostly form a line: try the previous row first.
            Some(prev) if index.node(prev).hash == header.prev_block => Some(prev),
            Some(_) => Some(index.lookup(&header.prev_block).ok_or_else(|| {
                ChainError::Assert(format!(
                    "could not find parent {} of block {hash}",
                    header.prev_block
                ))
            })?),
        };

        let node = index.add_node(header, parent, status);
        if index.node(node).hash != hash || index.node(node).height != height {
            return Err(ChainError::Corruption {
                what: format!("block index row for {hash} at height {height}"),
                detail: format!(
                    "header hashes to {} at height {}",
                    index.node(node).hash,
                    index.node(node).height
                ),
            });
        }
        last = Some(node);
        row = cursor.advance()?;
    }

    if index.is_empty() {
        return Err(ChainError::Assert("block index is empty".into()));
    }
    let tip = index.lookup(&best.hash).ok_or_else(|| {
        ChainError::Assert(format!("cannot find chain tip {} in block index", best.hash))
    })?;
    Ok((index, best, tip))
}

/// Mark every ancestor of `tip` valid. Older versions could drop the flag
/// without the block being invalid.
fn promote_ancestors(index: &mut BlockIndex, tip: usize) {
    let mut current = Some(tip);
    while let Some(idx) = current {
        if !index.node(idx).status.known_valid() {
            let node = index.node(idx);
            info!(height = node.height, hash = %node.hash, "marking main chain block valid");
            index.set_status_flags(idx, BlockStatus::VALID);
        }
        current = index.node(idx).parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::error::DatabaseError;

    fn regtest() -> &'static ChainParams {
        ChainParams::regtest()
    }

    #[test]
    fn fresh_store_is_rooted_at_genesis() {
        let chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        let best = chain.best_state();
        assert_eq!(best.height, 0);
        assert_eq!(best.hash, regtest().genesis_hash);
        assert_eq!(best.total_txns, 1);
        assert_eq!(best.work_sum, calc_work(0x207fffff));
        assert_eq!(chain.block_index().len(), 1);
        assert_eq!(chain.utxo_status(), UtxoStatus::Consistent(regtest().genesis_hash));
        assert_eq!(chain.chain_type().unwrap(), ChainType::Full);
    }

    #[test]
    fn genesis_coinbase_is_not_in_utxo_set() {
        let chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        let coinbase = regtest().genesis_block.transactions[0].txid();
        assert_eq!(chain.fetch_utxo(&OutPoint::new(coinbase, 0)).unwrap(), None);
    }

    #[test]
    fn versions_are_written() {
        let chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        chain
            .database()
            .view(|tx| {
                use crate::metadata::db_fetch_version;
                assert_eq!(db_fetch_version(tx, UTXO_SET_VERSION_KEY)?, Some(2));
                assert_eq!(db_fetch_version(tx, SPEND_JOURNAL_VERSION_KEY)?, Some(1));
                assert_eq!(db_fetch_version(tx, BLOCK_INDEX_VERSION_KEY)?, Some(1));
                Ok::<_, ChainError>(())
            })
            .unwrap();
    }

    /// Coinbase-only block on top of the tip.
    fn coinbase_block(chain: &BlockChain) -> Block {
        use kestrel_core::types::{BlockHeader, Transaction, TxIn, TxOut};
        let height = chain.best.height + 1;
        let transactions = vec![Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint::null(),
                signature_script: height.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut { value: 50, pk_script: vec![0x51] }],
            lock_time: 0,
        }];
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: chain.best.hash,
                merkle_root: kestrel_core::merkle::merkle_root_of(&transactions),
                timestamp: 1_296_688_602 + height * 600,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        }
    }

    fn stored_status(db: &Database, hash: &Hash256, height: u32) -> BlockStatus {
        let row = db
            .view(|tx| tx.get(BLOCK_INDEX_BUCKET, &crate::block_index::block_index_key(hash, height)))
            .unwrap()
            .unwrap();
        deserialize_block_index_row(&row).unwrap().1
    }

    #[test]
    fn connect_leaves_no_index_rows_to_flush() {
        let mut chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        let block = coinbase_block(&chain);
        chain.connect_block(&block).unwrap();

        let node = chain.block_index().lookup(&block.hash()).unwrap();
        assert_eq!(chain.tip, node);
        assert_eq!(chain.block_index().node(node).status, MAIN_CHAIN_STATUS);
        assert!(!chain.index.has_dirty());
        assert_eq!(stored_status(&chain.db, &block.hash(), 1), MAIN_CHAIN_STATUS);
    }

    #[test]
    fn side_branch_block_gets_its_final_status_on_connect() {
        let db = Database::in_memory().unwrap();
        let mut chain = BlockChain::open(db.clone(), regtest()).unwrap();
        let block = coinbase_block(&chain);
        let known = chain.index.add_node(
            block.header.clone(),
            Some(chain.tip),
            BlockStatus::DATA_STORED | BlockStatus::VALIDATE_FAILED,
        );

        chain.connect_block(&block).unwrap();
        assert_eq!(chain.tip, known);
        assert_eq!(chain.block_index().node(known).status, MAIN_CHAIN_STATUS);
        assert!(!chain.index.has_dirty());
        assert_eq!(stored_status(&db, &block.hash(), 1), MAIN_CHAIN_STATUS);
        drop(chain);

        let reopened = BlockChain::open(db, regtest()).unwrap();
        assert_eq!(reopened.best_state().hash, block.hash());
        assert_eq!(reopened.block_index().node(reopened.tip).status, MAIN_CHAIN_STATUS);
    }

    #[test]
    fn cannot_disconnect_genesis() {
        let mut chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        assert!(matches!(chain.disconnect_tip(), Err(ChainError::DisconnectGenesis)));
    }

    #[test]
    fn index_not_rooted_at_genesis_is_fatal() {
        let db = Database::in_memory().unwrap();
        BlockChain::open(db.clone(), regtest()).unwrap();
        // Opening the same store with another network's genesis.
        let err = BlockChain::open(db, ChainParams::mainnet()).err().unwrap();
        assert!(matches!(err, ChainError::Assert(msg) if msg.contains("not rooted at genesis")));
    }

    #[test]
    fn missing_tip_is_fatal() {
        let db = Database::in_memory().unwrap();
        BlockChain::open(db.clone(), regtest()).unwrap();
        db.update(|tx| {
            db_put_best_state(
                tx,
                &BestChainState {
                    hash: Hash256([0xee; 32]),
                    height: 5,
                    total_txns: 6,
                    work_sum: 12u32.into(),
                },
            )
        })
        .unwrap();
        let err = BlockChain::open(db, regtest()).err().unwrap();
        assert!(matches!(err, ChainError::Assert(msg) if msg.contains("cannot find chain tip")));
    }

    #[test]
    fn dropped_valid_flag_is_restored() {
        let db = Database::in_memory().unwrap();
        BlockChain::open(db.clone(), regtest()).unwrap();
        let genesis = &regtest().genesis_block;
        db.update(|tx| {
            db_put_block_index_row(tx, &genesis.hash(), 0, &genesis.header, BlockStatus::DATA_STORED)
        })
        .unwrap();

        let chain = BlockChain::open(db.clone(), regtest()).unwrap();
        assert!(chain.block_index().node(0).status.known_valid());
        let row = db
            .view(|tx| {
                tx.get(
                    BLOCK_INDEX_BUCKET,
                    &crate::block_index::block_index_key(&genesis.hash(), 0),
                )
            })
            .unwrap()
            .unwrap();
        assert_eq!(deserialize_block_index_row(&row).unwrap().1, MAIN_CHAIN_STATUS);
    }

    #[test]
    fn unset_marker_is_initialised() {
        let db = Database::in_memory().unwrap();
        BlockChain::open(db.clone(), regtest()).unwrap();
        db.update(|tx| {
            tx.delete(
                crate::database::METADATA_BUCKET,
                crate::consistency::UTXO_STATE_CONSISTENCY_KEY.to_vec(),
            )
        })
        .unwrap();

        let chain = BlockChain::open(db, regtest()).unwrap();
        assert_eq!(chain.utxo_status(), UtxoStatus::Unset);
        assert_eq!(
            chain.current_utxo_status().unwrap(),
            UtxoStatus::Consistent(regtest().genesis_hash)
        );
    }

    #[test]
    fn marker_off_main_chain_is_fatal() {
        let db = Database::in_memory().unwrap();
        BlockChain::open(db.clone(), regtest()).unwrap();
        db.update(|tx| db_put_utxo_status(tx, UtxoStatus::FlushOngoing(Hash256([0x77; 32]))))
            .unwrap();
        let err = BlockChain::open(db, regtest()).err().unwrap();
        assert!(matches!(err, ChainError::Assert(msg) if msg.contains("not on the main chain")));
    }

    #[test]
    fn queries_outside_main_chain() {
        let chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        assert!(matches!(chain.block_hash_by_height(1), Err(ChainError::NotInMainChain(_))));
        assert!(!chain.main_chain_has_block(&Hash256([1; 32])).unwrap());
        assert!(chain.main_chain_has_block(&regtest().genesis_hash).unwrap());
        let err = chain.fetch_block(&Hash256([1; 32])).unwrap_err();
        assert!(matches!(err, ChainError::Database(DatabaseError::BlockNotFound(_))));
    }

    #[test]
    fn chain_type_and_prune_height_setters() {
        let chain = BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap();
        assert_eq!(chain.prune_height().unwrap(), None);
        chain.set_prune_height(10).unwrap();
        chain.set_chain_type(ChainType::Pruned).unwrap();
        assert_eq!(chain.prune_height().unwrap(), Some(10));
        assert_eq!(chain.chain_type().unwrap(), ChainType::Pruned);
    }

    #[test]
    fn from_config_uses_memory_backend() {
        let config = NodeConfig {
            db_backend: DbBackend::Memory,
            network: kestrel_core::constants::NetworkType::Regtest,
            utxo_flush_batch: 0,
            ..NodeConfig::default()
        };
        let chain = BlockChain::from_config(&config).unwrap();
        assert_eq!(chain.best_state().hash, regtest().genesis_hash);
        assert_eq!(chain.utxo_flush_batch, 1);
    }
}
