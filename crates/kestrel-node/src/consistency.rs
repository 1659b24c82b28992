//! UTXO consistency marker.
//!
//! A 33-byte record, `status(1) || hash(32)`, saying which block the stored
//! UTXO set matches. A flush first records where it starts from, then writes
//! its batches, then records the block it reached. A store found with a
//! flush still marked ongoing holds a mix of the two states and has to be
//! repaired before point lookups can be trusted.
//!
//! A snapshot import starts from no block at all and records
//! [`IMPORT_ONGOING`] as its starting point. There is nothing to replay from
//! that state, so a store left with it cannot be repaired.

use std::fmt;

use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::ChainError;
use kestrel_core::types::Hash256;

use crate::database::{METADATA_BUCKET, Tx};

pub const UTXO_STATE_CONSISTENCY_KEY: &[u8] = b"utxostateconsistency";

pub const CONSISTENCY_RECORD_SIZE: usize = 1 + HASH_SIZE;

/// Starting point recorded by a snapshot import. Matches no block.
pub const IMPORT_ONGOING: Hash256 = Hash256::ZERO;

// Zero is reserved so a zeroed record never parses as a state.
const STATUS_UNSET: u8 = 0;
const STATUS_CONSISTENT: u8 = 1;
const STATUS_FLUSH_ONGOING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UtxoStatus {
    /// No marker was ever written.
    #[default]
    Unset,
    /// The UTXO set matches the state after this block.
    Consistent(Hash256),
    /// A flush starting from this block's state was interrupted.
    FlushOngoing(Hash256),
}

impl UtxoStatus {
    pub fn hash(&self) -> Option<Hash256> {
        match self {
            Self::Unset => None,
            Self::Consistent(hash) | Self::FlushOngoing(hash) => Some(*hash),
        }
    }
}

impl fmt::Display for UtxoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Consistent(hash) => write!(f, "consistent at {hash}"),
            Self::FlushOngoing(hash) if *hash == IMPORT_ONGOING => {
                write!(f, "utxo snapshot import ongoing")
            }
            Self::FlushOngoing(hash) => write!(f, "flush ongoing from {hash}"),
        }
    }
}

pub fn serialize_utxo_status(status: UtxoStatus) -> Result<[u8; CONSISTENCY_RECORD_SIZE], ChainError> {
    let (code, hash) = match status {
        UtxoStatus::Unset => {
            return Err(ChainError::Assert("attempt to write an unset utxo status".into()));
        }
        UtxoStatus::Consistent(hash) => (STATUS_CONSISTENT, hash),
        UtxoStatus::FlushOngoing(hash) => (STATUS_FLUSH_ONGOING, hash),
    };
    let mut record = [0u8; CONSISTENCY_RECORD_SIZE];
    record[0] = code;
    record[1..].copy_from_slice(hash.as_bytes());
    Ok(record)
}

pub fn deserialize_utxo_status(serialized: &[u8]) -> Result<UtxoStatus, ChainError> {
    let corrupt = |detail: String| ChainError::Corruption {
        what: "utxo consistency status".into(),
        detail,
    };
    if serialized.len() != CONSISTENCY_RECORD_SIZE {
        return Err(corrupt(format!(
            "{} bytes, want {CONSISTENCY_RECORD_SIZE}",
            serialized.len()
        )));
    }
    let hash = Hash256::from_slice(&serialized[1..]).ok_or_else(|| corrupt("bad hash".into()))?;
    match serialized[0] {
        STATUS_CONSISTENT => Ok(UtxoStatus::Consistent(hash)),
        STATUS_FLUSH_ONGOING => Ok(UtxoStatus::FlushOngoing(hash)),
        STATUS_UNSET => Err(corrupt("reserved unset status was written".into())),
        code => Err(corrupt(format!("unknown status code {code}"))),
    }
}

/// The stored marker; [`UtxoStatus::Unset`] when none was ever written.
pub fn db_fetch_utxo_status(tx: &Tx<'_>) -> Result<UtxoStatus, ChainError> {
    match tx.get(METADATA_BUCKET, UTXO_STATE_CONSISTENCY_KEY)? {
        Some(serialized) => deserialize_utxo_status(&serialized),
        None => Ok(UtxoStatus::Unset),
    }
}

pub fn db_put_utxo_status(tx: &mut Tx<'_>, status: UtxoStatus) -> Result<(), ChainError> {
    let record = serialize_utxo_status(status)?;
    tx.put(METADATA_BUCKET, UTXO_STATE_CONSISTENCY_KEY.to_vec(), record.to_vec())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn round_trip() {
        let hash = Hash256([0x3c; 32]);
        for status in [UtxoStatus::Consistent(hash), UtxoStatus::FlushOngoing(hash)] {
            let record = serialize_utxo_status(status).unwrap();
            assert_eq!(deserialize_utxo_status(&record).unwrap(), status);
            assert_eq!(status.hash(), Some(hash));
        }
        assert_eq!(serialize_utxo_status(UtxoStatus::FlushOngoing(hash)).unwrap()[0], 2);
    }

    #[test]
    fn unset_is_never_written() {
        let err = serialize_utxo_status(UtxoStatus::Unset).unwrap_err();
        assert!(matches!(err, ChainError::Assert(_)));

        let mut record = [0u8; CONSISTENCY_RECORD_SIZE];
        record[1..].copy_from_slice(&[1; 32]);
        assert!(deserialize_utxo_status(&record).unwrap_err().is_fatal());
    }

    #[test]
    fn wrong_length_or_code_is_corruption() {
        let record = serialize_utxo_status(UtxoStatus::Consistent(Hash256::ZERO)).unwrap();
        for len in [0, 1, 32, 34] {
            let mut bytes = record.to_vec();
            bytes.resize(len, 0);
            assert!(matches!(deserialize_utxo_status(&bytes), Err(ChainError::Corruption { .. })));
        }
        let mut bad_code = record;
        bad_code[0] = 9;
        assert!(deserialize_utxo_status(&bad_code).is_err());
    }

    #[test]
    fn absent_marker_is_unset() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.view(|tx| db_fetch_utxo_status(tx)).unwrap(), UtxoStatus::Unset);
        let status = UtxoStatus::FlushOngoing(Hash256([1; 32]));
        db.update(|tx| db_put_utxo_status(tx, status)).unwrap();
        assert_eq!(db.view(|tx| db_fetch_utxo_status(tx)).unwrap(), status);
        assert_eq!(status.to_string(), format!("flush ongoing from {}", Hash256([1; 32])));
    }
}
