//! The best chain state record: where the tip is and what it took to get
//! there.
//!
//! ```text
//! hash(32) || height(4 LE) || total_txns(8 LE) || work_len(4 LE) || work(BE)
//! ```
//!
//! It is rewritten as the last step of every transaction that moves the
//! tip, so on restart it always agrees with the rest of the store.

use num_bigint::BigUint;
use num_traits::Zero;

use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::ChainError;
use kestrel_core::types::Hash256;

use crate::database::{METADATA_BUCKET, Tx};

pub const CHAIN_STATE_KEY: &[u8] = b"chainstate";

/// Length of the fixed part of the record.
const MIN_BEST_STATE_SIZE: usize = HASH_SIZE + 4 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestChainState {
    pub hash: Hash256,
    pub height: u32,
    /// Transactions in the chain up to and including the tip.
    pub total_txns: u64,
    /// Cumulative proof of work of the chain.
    pub work_sum: BigUint,
}

pub fn serialize_best_chain_state(state: &BestChainState) -> Vec<u8> {
    // Zero has no magnitude bytes.
    let work = if state.work_sum.is_zero() {
        Vec::new()
    } else {
        state.work_sum.to_bytes_be()
    };
    let mut buf = Vec::with_capacity(MIN_BEST_STATE_SIZE + work.len());
    buf.extend_from_slice(state.hash.as_bytes());
    buf.extend_from_slice(&state.height.to_le_bytes());
    buf.extend_from_slice(&state.total_txns.to_le_bytes());
    buf.extend_from_slice(&(work.len() as u32).to_le_bytes());
    buf.extend_from_slice(&work);
    buf
}

pub fn deserialize_best_chain_state(serialized: &[u8]) -> Result<BestChainState, ChainError> {
    let corrupt = |detail: String| ChainError::Corruption {
        what: "best chain state".into(),
        detail,
    };
    if serialized.len() < MIN_BEST_STATE_SIZE {
        return Err(corrupt(format!(
            "{} bytes, want at least {MIN_BEST_STATE_SIZE}",
            serialized.len()
        )));
    }

    let (hash, rest) = serialized.split_at(HASH_SIZE);
    let (height, rest) = rest.split_at(4);
    let (total_txns, rest) = rest.split_at(8);
    let (work_len, work) = rest.split_at(4);

    let hash = Hash256::from_slice(hash).ok_or_else(|| corrupt("bad tip hash".into()))?;
    let height = u32::from_le_bytes([height[0], height[1], height[2], height[3]]);
    let mut txns = [0u8; 8];
    txns.copy_from_slice(total_txns);
    let work_len = u32::from_le_bytes([work_len[0], work_len[1], work_len[2], work_len[3]]) as usize;
    if work_len > work.len() {
        return Err(corrupt(format!(
            "work sum length {work_len} exceeds remaining {} bytes",
            work.len()
        )));
    }

    Ok(BestChainState {
        hash,
        height,
        total_txns: u64::from_le_bytes(txns),
        work_sum: BigUint::from_bytes_be(&work[..work_len]),
    })
}

pub fn db_put_best_state(tx: &mut Tx<'_>, state: &BestChainState) -> Result<(), ChainError> {
    tx.put(
        METADATA_BUCKET,
        CHAIN_STATE_KEY.to_vec(),
        serialize_best_chain_state(state),
    )?;
    Ok(())
}

/// The stored best state, or `None` for a store that was never initialised.
pub fn db_fetch_best_state(tx: &Tx<'_>) -> Result<Option<BestChainState>, ChainError> {
    tx.get(METADATA_BUCKET, CHAIN_STATE_KEY)?
        .map(|serialized| deserialize_best_chain_state(&serialized))
        .transpose()
}
