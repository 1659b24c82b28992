//! UTXO snapshot files.
//!
//! A snapshot is a plain sequence of records, each `len(4 LE) || commitment`
//! where the commitment uses the flat layout of
//! [`serialize_utxo_commitment`]. Record order carries no meaning.

use std::collections::HashSet;

use kestrel_core::error::ChainError;
use kestrel_core::types::OutPoint;

use crate::utxo::{UtxoEntry, deserialize_utxo_commitment, serialize_utxo_commitment};

/// Append one framed record for `entry` to `buf`.
pub fn append_snapshot_record(
    buf: &mut Vec<u8>,
    outpoint: &OutPoint,
    entry: &UtxoEntry,
) -> Result<(), ChainError> {
    let record = serialize_utxo_commitment(outpoint, entry)?;
    let len = u32::try_from(record.len())
        .map_err(|_| ChainError::Assert(format!("snapshot record for {outpoint} is too large")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&record);
    Ok(())
}

/// Parse every record of a snapshot. An outpoint may appear only once.
pub fn parse_utxo_snapshot(data: &[u8]) -> Result<Vec<(OutPoint, UtxoEntry)>, ChainError> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut offset = 0;

    while offset < data.len() {
        let record_no = records.len();
        let Some(len_bytes) = data.get(offset..offset + 4) else {
            return Err(ChainError::Deserialize(format!(
                "snapshot record {record_no}: truncated length at offset {offset}"
            )));
        };
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        offset += 4;

        let Some(record) = data.get(offset..offset + len) else {
            return Err(ChainError::Deserialize(format!(
                "snapshot record {record_no}: {len} bytes declared, {} left",
                data.len() - offset
            )));
        };
        let (outpoint, entry) = deserialize_utxo_commitment(record).map_err(|e| match e {
            ChainError::Deserialize(detail) => {
                ChainError::Deserialize(format!("snapshot record {record_no}: {detail}"))
            }
            other => other,
        })?;
        if !seen.insert(outpoint) {
            return Err(ChainError::Deserialize(format!(
                "snapshot record {record_no}: duplicate outpoint {outpoint}"
            )));
        }
        records.push((outpoint, entry));
        offset += len;
    }

    Ok(records)
}
