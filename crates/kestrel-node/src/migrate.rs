//! One-time migration of stores written before the block index bucket
//! existed.
//!
//! Such stores only have the main-chain height → hash map and the block
//! bodies. The block index is rebuilt from those: every main-chain block
//! gets a row with its stored header, marked as stored and valid.

use tracing::{debug, info};

use kestrel_core::error::{ChainError, DatabaseError};
use kestrel_core::types::Hash256;

use crate::block_index::{
    BLOCK_INDEX_BUCKET, BLOCK_INDEX_VERSION_KEY, BlockStatus, CURRENT_BLOCK_INDEX_VERSION,
    HEIGHT_INDEX_BUCKET, db_put_block_index_row,
};
use crate::database::Tx;
use crate::metadata::db_put_version;

/// Create and populate the block index bucket. Returns the number of rows
/// written.
pub fn rebuild_block_index(tx: &mut Tx<'_>) -> Result<usize, ChainError> {
    info!("block index bucket missing, rebuilding it from the main chain");
    tx.create_bucket(BLOCK_INDEX_BUCKET)?;

    let mut main_chain = Vec::new();
    {
        let mut cursor = tx.cursor(HEIGHT_INDEX_BUCKET)?;
        let mut row = cursor.first()?;
        while let Some((key, value)) = row {
            let height: [u8; 4] = key.as_slice().try_into().map_err(|_| ChainError::Corruption {
                what: "height index key".into(),
                detail: format!("{} bytes, want 4", key.len()),
            })?;
            let height = u32::from_be_bytes(height);
            let hash = Hash256::from_slice(&value).ok_or_else(|| ChainError::Corruption {
                what: format!("height index entry for {height}"),
                detail: format!("{} bytes, want 32", value.len()),
            })?;
            main_chain.push((height, hash));
            row = cursor.advance()?;
        }
    }

    if main_chain.is_empty() {
        return Err(ChainError::Assert(
            "cannot rebuild the block index: the height index is empty".into(),
        ));
    }

    let status = BlockStatus::DATA_STORED | BlockStatus::VALID;
    for (expected, (height, hash)) in main_chain.iter().enumerate() {
        if *height as usize != expected {
            return Err(ChainError::Assert(format!(
                "height index has a gap: found {height} where {expected} was expected"
            )));
        }
        let header = tx.fetch_block_header(hash).map_err(|e| match e {
            DatabaseError::BlockNotFound(_) => ChainError::Assert(format!(
                "main chain block {hash} at height {height} is missing from the block store"
            )),
            other => other.into(),
        })?;
        db_put_block_index_row(tx, hash, *height, &header, status)?;
        debug!(height, %hash, "rebuilt block index row");
    }

    db_put_version(tx, BLOCK_INDEX_VERSION_KEY, CURRENT_BLOCK_INDEX_VERSION)?;
    info!(rows = main_chain.len(), "block index rebuilt");
    Ok(main_chain.len())
}
