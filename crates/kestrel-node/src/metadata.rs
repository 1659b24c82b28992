//! Small singleton records in the metadata bucket: bucket format versions,
//! the chain type and the prune height.

use kestrel_core::error::ChainError;

use crate::database::{METADATA_BUCKET, Tx};

pub const CHAIN_TYPE_KEY: &[u8] = b"chaintype";
pub const PRUNE_HEIGHT_KEY: &[u8] = b"pruneheight";

/// How the store has been operated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChainType {
    /// Every block body is retained.
    #[default]
    Full = 0,
    /// Bodies below the prune height have been deleted.
    Pruned = 1,
    /// The UTXO set was imported from a snapshot.
    FastSync = 2,
}

impl ChainType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Full),
            1 => Some(Self::Pruned),
            2 => Some(Self::FastSync),
            _ => None,
        }
    }
}

fn fetch_u32(tx: &Tx<'_>, key: &[u8]) -> Result<Option<u32>, ChainError> {
    let Some(serialized) = tx.get(METADATA_BUCKET, key)? else {
        return Ok(None);
    };
    let bytes: [u8; 4] = serialized.as_slice().try_into().map_err(|_| ChainError::Corruption {
        what: String::from_utf8_lossy(key).into_owned(),
        detail: format!("{} bytes, want 4", serialized.len()),
    })?;
    Ok(Some(u32::from_le_bytes(bytes)))
}

fn put_u32(tx: &mut Tx<'_>, key: &[u8], value: u32) -> Result<(), ChainError> {
    tx.put(METADATA_BUCKET, key.to_vec(), value.to_le_bytes().to_vec())?;
    Ok(())
}

/// Format version stored under `key`, `None` if it was never written.
pub fn db_fetch_version(tx: &Tx<'_>, key: &[u8]) -> Result<Option<u32>, ChainError> {
    fetch_u32(tx, key)
}

pub fn db_put_version(tx: &mut Tx<'_>, key: &[u8], version: u32) -> Result<(), ChainError> {
    put_u32(tx, key, version)
}

/// The version under `key`, writing `current` first if none is stored.
pub fn ensure_version(tx: &mut Tx<'_>, key: &[u8], current: u32) -> Result<u32, ChainError> {
    if let Some(version) = db_fetch_version(tx, key)? {
        return Ok(version);
    }
    db_put_version(tx, key, current)?;
    Ok(current)
}

/// Stored chain type; stores that never wrote one are [`ChainType::Full`].
pub fn db_fetch_chain_type(tx: &Tx<'_>) -> Result<ChainType, ChainError> {
    let Some(serialized) = tx.get(METADATA_BUCKET, CHAIN_TYPE_KEY)? else {
        return Ok(ChainType::Full);
    };
    match serialized.as_slice() {
        [byte] => ChainType::from_u8(*byte).ok_or_else(|| ChainError::Corruption {
            what: "chain type".into(),
            detail: format!("unknown value {byte}"),
        }),
        other => Err(ChainError::Corruption {
            what: "chain type".into(),
            detail: format!("{} bytes, want 1", other.len()),
        }),
    }
}

pub fn db_put_chain_type(tx: &mut Tx<'_>, chain_type: ChainType) -> Result<(), ChainError> {
    tx.put(METADATA_BUCKET, CHAIN_TYPE_KEY.to_vec(), vec![chain_type as u8])?;
    Ok(())
}

/// Height below which block bodies are gone, `None` if never pruned.
pub fn db_fetch_prune_height(tx: &Tx<'_>) -> Result<Option<u32>, ChainError> {
    fetch_u32(tx, PRUNE_HEIGHT_KEY)
}

pub fn db_put_prune_height(tx: &mut Tx<'_>, height: u32) -> Result<(), ChainError> {
    put_u32(tx, PRUNE_HEIGHT_KEY, height)
}
