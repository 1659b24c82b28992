//! UTXO set records and the in-memory UTXO viewpoint.
//!
//! An entry is stored under its outpoint key as
//! `vlq(height << 1 | coinbase) || compressed txout`. Spent entries are
//! never stored: spending an output deletes its row.
//!
//! Snapshot imports use a second, flat "commitment" layout:
//!
//! ```text
//! txid(32) || index(4 LE) || height << 1 | coinbase (4 LE) || amount(8 LE) || script
//! ```

use std::collections::HashMap;

use kestrel_core::compress::{
    append_vlq, compressed_txout_size, decode_compressed_txout, deserialize_vlq,
    put_compressed_txout, serialize_size_vlq,
};
use kestrel_core::constants::{HASH_SIZE, MAX_MONEY, is_unspendable};
use kestrel_core::error::ChainError;
use kestrel_core::types::{Block, Hash256, OutPoint, Transaction};

use crate::database::Tx;
use crate::keys::{decode_outpoint_key, first_output_key, outpoint_key};
use crate::spend_journal::SpentTxOut;

/// Bucket holding the unspent output set, keyed by outpoint key.
pub const UTXO_SET_BUCKET: &[u8] = b"utxosetv2";
/// Metadata key of the UTXO set format version.
pub const UTXO_SET_VERSION_KEY: &[u8] = b"utxosetversion";
pub const CURRENT_UTXO_SET_VERSION: u32 = 2;

/// Fixed-size prefix of a commitment record, before the script.
pub const COMMITMENT_HEADER_SIZE: usize = HASH_SIZE + 4 + 4 + 8;

/// One unspent output.
#[derive(Debug, Clone)]
pub struct UtxoEntry {
    amount: i64,
    pk_script: Vec<u8>,
    block_height: i32,
    is_coinbase: bool,
    spent: bool,
    modified: bool,
}

impl UtxoEntry {
    pub fn new(amount: i64, pk_script: Vec<u8>, block_height: i32, is_coinbase: bool) -> Self {
        Self {
            amount,
            pk_script,
            block_height,
            is_coinbase,
            spent: false,
            modified: false,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn pk_script(&self) -> &[u8] {
        &self.pk_script
    }

    pub fn block_height(&self) -> i32 {
        self.block_height
    }

    pub fn is_coinbase(&self) -> bool {
        self.is_coinbase
    }

    pub fn is_spent(&self) -> bool {
        self.spent
    }

    /// Whether the entry differs from what is stored.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Mark the output spent. Spending twice is a no-op.
    pub fn spend(&mut self) {
        if self.spent {
            return;
        }
        self.spent = true;
        self.modified = true;
    }

    fn header_code(&self) -> u64 {
        header_code(self.block_height, self.is_coinbase)
    }
}

// Equality is about the output itself; the dirty flag is bookkeeping.
impl PartialEq for UtxoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.amount == other.amount
            && self.pk_script == other.pk_script
            && self.block_height == other.block_height
            && self.is_coinbase == other.is_coinbase
            && self.spent == other.spent
    }
}

impl Eq for UtxoEntry {}

fn header_code(height: i32, is_coinbase: bool) -> u64 {
    (u64::from(height as u32) << 1) | u64::from(is_coinbase)
}

fn split_header_code(code: u64) -> Result<(i32, bool), ChainError> {
    let height = i32::try_from(code >> 1)
        .map_err(|_| ChainError::Deserialize(format!("block height {} overflows", code >> 1)))?;
    Ok((height, code & 1 == 1))
}

/// Serialize an unspent entry. Serializing a spent entry is a bug in the
/// caller and fails with [`ChainError::Assert`].
pub fn serialize_utxo_entry(entry: &UtxoEntry) -> Result<Vec<u8>, ChainError> {
    if entry.is_spent() {
        return Err(ChainError::Assert(
            "attempt to serialize a spent utxo entry".into(),
        ));
    }
    let code = entry.header_code();
    let size = serialize_size_vlq(code) + compressed_txout_size(entry.amount, &entry.pk_script)?;
    let mut buf = Vec::with_capacity(size);
    append_vlq(&mut buf, code);
    put_compressed_txout(&mut buf, entry.amount, &entry.pk_script)?;
    Ok(buf)
}

pub fn deserialize_utxo_entry(serialized: &[u8]) -> Result<UtxoEntry, ChainError> {
    let (code, offset) = deserialize_vlq(serialized)?;
    if offset >= serialized.len() {
        return Err(ChainError::Deserialize(
            "unexpected end of data after header".into(),
        ));
    }
    let (block_height, is_coinbase) = split_header_code(code)?;

    let (amount, pk_script, _) =
        decode_compressed_txout(&serialized[offset..]).map_err(|e| match e {
            ChainError::Deserialize(detail) => {
                ChainError::Deserialize(format!("unable to decode utxo: {detail}"))
            }
            other => other,
        })?;

    Ok(UtxoEntry::new(amount, pk_script, block_height, is_coinbase))
}

/// Serialize `entry` in the flat commitment layout.
pub fn serialize_utxo_commitment(outpoint: &OutPoint, entry: &UtxoEntry) -> Result<Vec<u8>, ChainError> {
    if entry.is_spent() {
        return Err(ChainError::Assert(format!(
            "attempt to commit spent utxo {outpoint}"
        )));
    }
    let code = u32::try_from(entry.header_code()).map_err(|_| {
        ChainError::Assert(format!("height {} does not fit a commitment", entry.block_height))
    })?;
    let mut buf = Vec::with_capacity(COMMITMENT_HEADER_SIZE + entry.pk_script.len());
    buf.extend_from_slice(outpoint.txid.as_bytes());
    buf.extend_from_slice(&outpoint.index.to_le_bytes());
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&entry.amount.to_le_bytes());
    buf.extend_from_slice(&entry.pk_script);
    Ok(buf)
}

/// Parse a commitment record. Everything after the fixed header is the
/// output script.
pub fn deserialize_utxo_commitment(serialized: &[u8]) -> Result<(OutPoint, UtxoEntry), ChainError> {
    if serialized.len() < COMMITMENT_HEADER_SIZE {
        return Err(ChainError::Deserialize(format!(
            "utxo commitment too short: {} < {COMMITMENT_HEADER_SIZE} bytes",
            serialized.len()
        )));
    }
    let le_u32 = |at: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&serialized[at..at + 4]);
        u32::from_le_bytes(bytes)
    };

    let txid = Hash256::from_slice(&serialized[..HASH_SIZE])
        .ok_or_else(|| ChainError::Deserialize("bad commitment txid".into()))?;
    let index = le_u32(HASH_SIZE);
    let (block_height, is_coinbase) = split_header_code(u64::from(le_u32(HASH_SIZE + 4)))?;
    let mut amount = [0u8; 8];
    amount.copy_from_slice(&serialized[HASH_SIZE + 8..COMMITMENT_HEADER_SIZE]);
    let amount = i64::from_le_bytes(amount);
    if !(0..=MAX_MONEY).contains(&amount) {
        return Err(ChainError::Deserialize(format!(
            "commitment amount {amount} out of range"
        )));
    }

    let entry = UtxoEntry::new(
        amount,
        serialized[COMMITMENT_HEADER_SIZE..].to_vec(),
        block_height,
        is_coinbase,
    );
    Ok((OutPoint::new(txid, index), entry))
}

/// Point lookup of one unspent output.
pub fn db_fetch_utxo_entry(tx: &Tx<'_>, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
    let key = outpoint_key(outpoint);
    let Some(serialized) = tx.get(UTXO_SET_BUCKET, &key)? else {
        return Ok(None);
    };
    deserialize_utxo_entry(&serialized)
        .map(Some)
        .map_err(|e| e.into_corruption(format!("utxo entry {outpoint}")))
}

/// Any unspent output of `txid`, the one with the lowest index.
pub fn db_fetch_utxo_entry_by_hash(tx: &Tx<'_>, txid: &Hash256) -> Result<Option<UtxoEntry>, ChainError> {
    let seek = first_output_key(txid);
    let mut cursor = tx.cursor(UTXO_SET_BUCKET)?;
    let Some((key, serialized)) = cursor.seek(&seek)? else {
        return Ok(None);
    };
    // The seek may land on a later transaction.
    if !key.starts_with(txid.as_bytes()) {
        return Ok(None);
    }
    deserialize_utxo_entry(&serialized)
        .map(Some)
        .map_err(|e| e.into_corruption(format!("utxo entry under key {}", hex::encode(&key))))
}

/// Write `entry`, or delete its row if it has been spent.
pub fn db_put_utxo_entry(tx: &mut Tx<'_>, outpoint: &OutPoint, entry: &UtxoEntry) -> Result<(), ChainError> {
    // The transaction keeps the key until commit, so it leaves the pool.
    let key = outpoint_key(outpoint).into_vec();
    if entry.is_spent() {
        tx.delete(UTXO_SET_BUCKET, key)?;
        return Ok(());
    }
    let serialized = serialize_utxo_entry(entry)?;
    tx.put(UTXO_SET_BUCKET, key, serialized)?;
    Ok(())
}

/// Write every modified entry of `view`.
pub fn db_put_utxo_view(tx: &mut Tx<'_>, view: &UtxoViewpoint) -> Result<(), ChainError> {
    for (outpoint, entry) in view.modified_entries() {
        db_put_utxo_entry(tx, outpoint, entry)?;
    }
    Ok(())
}

/// Visit every stored entry in key order.
pub fn db_for_each_utxo<F>(tx: &Tx<'_>, mut f: F) -> Result<(), ChainError>
where
    F: FnMut(OutPoint, UtxoEntry) -> Result<(), ChainError>,
{
    let mut cursor = tx.cursor(UTXO_SET_BUCKET)?;
    let mut row = cursor.first()?;
    while let Some((key, serialized)) = row {
        let outpoint = decode_outpoint_key(&key)
            .map_err(|e| e.into_corruption(format!("utxo key {}", hex::encode(&key))))?;
        let entry = deserialize_utxo_entry(&serialized)
            .map_err(|e| e.into_corruption(format!("utxo entry {outpoint}")))?;
        f(outpoint, entry)?;
        row = cursor.advance()?;
    }
    Ok(())
}

/// A working set of UTXO entries layered over the stored set.
///
/// Blocks are connected and disconnected against a viewpoint; the modified
/// entries are then written back in one go.
#[derive(Debug, Clone, Default)]
pub struct UtxoViewpoint {
    entries: HashMap<OutPoint, UtxoEntry>,
    best_hash: Hash256,
}

impl UtxoViewpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block whose state the viewpoint represents.
    pub fn best_hash(&self) -> Hash256 {
        self.best_hash
    }

    pub fn set_best_hash(&mut self, hash: Hash256) {
        self.best_hash = hash;
    }

    pub fn lookup_entry(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    /// Insert `entry` as a pending change.
    pub fn add_entry(&mut self, outpoint: OutPoint, mut entry: UtxoEntry) {
        entry.modified = true;
        self.entries.insert(outpoint, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that must be written back, spent ones included.
    pub fn modified_entries(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter().filter(|(_, entry)| entry.is_modified())
    }

    /// Add the spendable outputs of `tx` as unspent entries created at
    /// `height`. Provably unspendable outputs never enter the set.
    pub fn add_tx_outs(&mut self, tx: &Transaction, height: i32) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.pk_script) {
                continue;
            }
            self.add_entry(
                OutPoint::new(txid, index as u32),
                UtxoEntry::new(output.value, output.pk_script.clone(), height, is_coinbase),
            );
        }
    }

    /// Load the listed outpoints from the store unless already present.
    /// Outpoints missing from the store are left out.
    pub fn fetch_utxos<'o>(
        &mut self,
        tx: &Tx<'_>,
        outpoints: impl IntoIterator<Item = &'o OutPoint>,
    ) -> Result<(), ChainError> {
        for outpoint in outpoints {
            if self.entries.contains_key(outpoint) {
                continue;
            }
            if let Some(entry) = db_fetch_utxo_entry(tx, outpoint)? {
                self.entries.insert(*outpoint, entry);
            }
        }
        Ok(())
    }

    /// Load every output the block's transactions spend, except those
    /// created earlier in the same block.
    pub fn fetch_input_utxos(&mut self, tx: &Tx<'_>, block: &Block) -> Result<(), ChainError> {
        let mut in_flight = HashMap::new();
        for (position, txn) in block.transactions.iter().enumerate() {
            in_flight.insert(txn.txid(), position);
        }

        let mut needed = Vec::new();
        for (position, txn) in block.transactions.iter().enumerate().skip(1) {
            for input in &txn.inputs {
                let origin = &input.previous_output;
                if in_flight
                    .get(&origin.txid)
                    .is_some_and(|&created_at| created_at < position)
                {
                    continue;
                }
                needed.push(*origin);
            }
        }
        self.fetch_utxos(tx, &needed)
    }

    /// Spend the inputs of `txn` and add its outputs. When `stxos` is given,
    /// every spent output is appended to it in spend order.
    pub fn connect_transaction(
        &mut self,
        txn: &Transaction,
        height: i32,
        mut stxos: Option<&mut Vec<SpentTxOut>>,
    ) -> Result<(), ChainError> {
        if txn.is_coinbase() {
            self.add_tx_outs(txn, height);
            return Ok(());
        }

        for input in &txn.inputs {
            let origin = &input.previous_output;
            let entry = self
                .entries
                .get_mut(origin)
                .filter(|entry| !entry.is_spent())
                .ok_or_else(|| ChainError::MissingUtxo(origin.to_string()))?;

            if let Some(stxos) = stxos.as_deref_mut() {
                stxos.push(SpentTxOut {
                    amount: entry.amount(),
                    pk_script: entry.pk_script().to_vec(),
                    height: entry.block_height(),
                    is_coinbase: entry.is_coinbase(),
                });
            }
            entry.spend();
        }

        self.add_tx_outs(txn, height);
        Ok(())
    }

    /// Connect every transaction of `block`, collecting the spent outputs.
    pub fn connect_transactions(
        &mut self,
        block: &Block,
        height: i32,
        stxos: &mut Vec<SpentTxOut>,
    ) -> Result<(), ChainError> {
        for txn in &block.transactions {
            self.connect_transaction(txn, height, Some(&mut *stxos))?;
        }
        self.best_hash = block.hash();
        Ok(())
    }

    /// Undo `block`: spend the outputs it created and restore every output
    /// it consumed from `stxos`.
    ///
    /// Journal records with a zero height come from stores written before
    /// heights were kept for every record; their context is taken from any
    /// other unspent output of the same transaction, looking at outputs
    /// already restored by this block before the store.
    pub fn disconnect_transactions(
        &mut self,
        tx: &Tx<'_>,
        block: &Block,
        stxos: &[SpentTxOut],
    ) -> Result<(), ChainError> {
        let expected = block.spent_output_count();
        if stxos.len() != expected {
            return Err(ChainError::Assert(format!(
                "spend journal of block {} has {} entries, block spends {expected}",
                block.hash(),
                stxos.len()
            )));
        }

        let mut stxo_idx = stxos.len();
        for txn in block.transactions.iter().rev() {
            let txid = txn.txid();
            let is_coinbase = txn.is_coinbase();
            for (index, output) in txn.outputs.iter().enumerate() {
                if is_unspendable(&output.pk_script) {
                    continue;
                }
                let outpoint = OutPoint::new(txid, index as u32);
                let entry = self.entries.entry(outpoint).or_insert_with(|| {
                    UtxoEntry::new(output.value, output.pk_script.clone(), 0, is_coinbase)
                });
                entry.spend();
            }

            if is_coinbase {
                continue;
            }

            for input in txn.inputs.iter().rev() {
                stxo_idx -= 1;
                let stxo = &stxos[stxo_idx];
                let origin = input.previous_output;

                let (height, coinbase) = if stxo.height == 0 {
                    self.sibling_context(tx, &origin.txid)?.ok_or_else(|| {
                        ChainError::Assert(format!(
                            "unable to resurrect legacy stxo {origin}: no other output of its transaction is unspent"
                        ))
                    })?
                } else {
                    (stxo.height, stxo.is_coinbase)
                };

                self.add_entry(
                    origin,
                    UtxoEntry::new(stxo.amount, stxo.pk_script.clone(), height, coinbase),
                );
            }
        }

        self.best_hash = block.header.prev_block;
        Ok(())
    }

    /// Height and coinbase flag of an unspent output of `txid`, from this
    /// view if it holds one, otherwise from the store.
    fn sibling_context(&self, tx: &Tx<'_>, txid: &Hash256) -> Result<Option<(i32, bool)>, ChainError> {
        let pending = self
            .entries
            .iter()
            .find(|(outpoint, entry)| outpoint.txid == *txid && !entry.is_spent());
        if let Some((_, entry)) = pending {
            return Ok(Some((entry.block_height(), entry.is_coinbase())));
        }
        Ok(db_fetch_utxo_entry_by_hash(tx, txid)?
            .map(|entry| (entry.block_height(), entry.is_coinbase())))
    }

    /// Apply `block` without requiring its inputs to be loaded: every
    /// spent outpoint is marked for deletion and every new output for
    /// insertion. Writing the result over a set that already holds some of
    /// the block's effects yields the same rows, so replays are idempotent.
    pub fn replay_block(&mut self, block: &Block, height: i32) {
        for txn in &block.transactions {
            if !txn.is_coinbase() {
                for input in &txn.inputs {
                    let mut tombstone = UtxoEntry::new(0, Vec::new(), 0, false);
                    tombstone.spend();
                    self.entries.insert(input.previous_output, tombstone);
                }
            }
            self.add_tx_outs(txn, height);
        }
        self.best_hash = block.hash();
    }

    /// Forget spent entries and clear dirty flags once the view has been
    /// written back.
    pub fn commit(&mut self) {
        self.entries.retain(|_, entry| !entry.is_spent());
        for entry in self.entries.values_mut() {
            entry.modified = false;
        }
    }
}
