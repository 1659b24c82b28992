//! Spend journal: per-block records of the outputs a block consumed.
//!
//! The journal entry of a block is the concatenation of one record per
//! spent output, written for the block's transactions from last to first
//! and, within each transaction, its inputs from last to first:
//!
//! ```text
//! vlq(height << 1 | coinbase) [|| vlq(0) if height > 0] || compressed txout
//! ```
//!
//! The zero VLQ is a reserved field kept for compatibility with the older
//! on-disk version. The format is not self-describing: the number of
//! records per transaction comes from the block's inputs, so decoding needs
//! the block.
//!
//! Only the record of the *last* remaining output of a creating transaction
//! is guaranteed to carry its height and coinbase flag in stores written by
//! older versions. Disconnect falls back to the UTXO set for the rest.

use kestrel_core::compress::{
    append_vlq, compressed_txout_size, decode_compressed_txout, deserialize_vlq,
    put_compressed_txout, serialize_size_vlq,
};
use kestrel_core::error::ChainError;
use kestrel_core::types::{Block, Hash256, Transaction};

use crate::database::Tx;

/// Bucket holding one journal entry per main-chain block, keyed by hash.
pub const SPEND_JOURNAL_BUCKET: &[u8] = b"spendjournal";
/// Metadata key of the journal format version.
pub const SPEND_JOURNAL_VERSION_KEY: &[u8] = b"spendjournalversion";
pub const CURRENT_SPEND_JOURNAL_VERSION: u32 = 1;

/// An output consumed by a block, with enough context to put it back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpentTxOut {
    pub amount: i64,
    pub pk_script: Vec<u8>,
    /// Height of the block that created the output.
    pub height: i32,
    pub is_coinbase: bool,
}

impl SpentTxOut {
    fn header_code(&self) -> u64 {
        (u64::from(self.height as u32) << 1) | u64::from(self.is_coinbase)
    }

    /// Size of this record once serialized.
    pub fn serialize_size(&self) -> Result<usize, ChainError> {
        let mut size = serialize_size_vlq(self.header_code());
        if self.height > 0 {
            size += serialize_size_vlq(0);
        }
        Ok(size + compressed_txout_size(self.amount, &self.pk_script)?)
    }

    /// Append the serialized record to `buf`.
    pub fn put(&self, buf: &mut Vec<u8>) -> Result<(), ChainError> {
        append_vlq(buf, self.header_code());
        if self.height > 0 {
            append_vlq(buf, 0);
        }
        put_compressed_txout(buf, self.amount, &self.pk_script)
    }

    /// Decode one record from the front of `serialized`, returning it with
    /// the number of bytes consumed.
    pub fn decode(serialized: &[u8]) -> Result<(Self, usize), ChainError> {
        let (code, mut offset) = deserialize_vlq(serialized)?;
        if offset >= serialized.len() {
            return Err(ChainError::Deserialize(
                "unexpected end of data after header code".into(),
            ));
        }

        let height = i32::try_from(code >> 1)
            .map_err(|_| ChainError::Deserialize(format!("stxo height {} overflows", code >> 1)))?;
        let is_coinbase = code & 1 == 1;

        if height > 0 {
            let (_reserved, read) = deserialize_vlq(&serialized[offset..])?;
            offset += read;
            if offset >= serialized.len() {
                return Err(ChainError::Deserialize(
                    "unexpected end of data after reserved".into(),
                ));
            }
        }

        let (amount, pk_script, read) = decode_compressed_txout(&serialized[offset..])
            .map_err(|e| match e {
                ChainError::Deserialize(detail) => {
                    ChainError::Deserialize(format!("unable to decode txout: {detail}"))
                }
                other => other,
            })?;
        offset += read;

        Ok((
            Self {
                amount,
                pk_script,
                height,
                is_coinbase,
            },
            offset,
        ))
    }
}

/// Serialize the spent outputs of a block, given in spend order.
pub fn serialize_spend_journal_entry(stxos: &[SpentTxOut]) -> Result<Vec<u8>, ChainError> {
    let size = stxos
        .iter()
        .map(SpentTxOut::serialize_size)
        .sum::<Result<usize, _>>()?;
    let mut buf = Vec::with_capacity(size);
    for stxo in stxos.iter().rev() {
        stxo.put(&mut buf)?;
    }
    Ok(buf)
}

/// Decode a journal entry against the block's non-coinbase transactions,
/// returning the spent outputs in spend order.
///
/// An empty entry is valid only when the transactions spend nothing; any
/// other empty entry means the journal and the block store disagree, which
/// is reported as [`ChainError::Assert`].
pub fn deserialize_spend_journal_entry(
    serialized: &[u8],
    txns: &[Transaction],
) -> Result<Vec<SpentTxOut>, ChainError> {
    let num_stxos: usize = txns.iter().map(|tx| tx.inputs.len()).sum();

    if serialized.is_empty() {
        if num_stxos != 0 {
            return Err(ChainError::Assert(format!(
                "mismatched spend journal serialization: no serialization for expected {num_stxos} stxos"
            )));
        }
        return Ok(Vec::new());
    }

    // Decode back to front, filling the result from its end so it comes
    // out in spend order.
    let mut stxos = vec![SpentTxOut::default(); num_stxos];
    let mut stxo_idx = num_stxos;
    let mut offset = 0;
    for tx in txns.iter().rev() {
        for input in tx.inputs.iter().rev() {
            stxo_idx -= 1;
            let (stxo, read) = SpentTxOut::decode(&serialized[offset..]).map_err(|e| match e {
                ChainError::Deserialize(detail) => ChainError::Deserialize(format!(
                    "unable to decode stxo for {}: {detail}",
                    input.previous_output
                )),
                other => other,
            })?;
            stxos[stxo_idx] = stxo;
            offset += read;
        }
    }
    Ok(stxos)
}

/// Load and decode the journal entry of `block`. Decode failures surface as
/// corruption tagged with the block hash.
pub fn db_fetch_spend_journal_entry(tx: &Tx<'_>, block: &Block) -> Result<Vec<SpentTxOut>, ChainError> {
    let hash = block.hash();
    let serialized = tx.get(SPEND_JOURNAL_BUCKET, hash.as_bytes())?.unwrap_or_default();
    deserialize_spend_journal_entry(&serialized, block.spending_transactions())
        .map_err(|e| e.into_corruption(format!("spend journal entry for block {hash}")))
}

pub fn db_put_spend_journal_entry(
    tx: &mut Tx<'_>,
    block_hash: &Hash256,
    stxos: &[SpentTxOut],
) -> Result<(), ChainError> {
    let serialized = serialize_spend_journal_entry(stxos)?;
    tx.put(SPEND_JOURNAL_BUCKET, block_hash.as_bytes().to_vec(), serialized)?;
    Ok(())
}

pub fn db_remove_spend_journal_entry(tx: &mut Tx<'_>, block_hash: &Hash256) -> Result<(), ChainError> {
    tx.delete(SPEND_JOURNAL_BUCKET, block_hash.as_bytes().to_vec())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::types::{OutPoint, TxIn, TxOut};
    use proptest::prelude::*;

    fn spending_tx(seed: u8, inputs: usize) -> Transaction {
        Transaction {
            version: 1,
            inputs: (0..inputs)
                .map(|i| TxIn {
                    previous_output: OutPoint::new(Hash256([seed; 32]), i as u32),
                    signature_script: vec![],
                    sequence: u32::MAX,
                })
                .collect(),
            outputs: vec![TxOut { value: 1, pk_script: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn p2pkh(seed: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[seed; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn known_vector_single_stxo() {
        // Mainnet block 170 spends output 0 of block 9's coinbase.
        let stxo = SpentTxOut {
            amount: 5_000_000_000,
            pk_script: hex::decode(
                "410411db93e1dcdb8a016b49840f8c53bc1eb68a382e97b1482ecad7b148a6909a5cb2e0eaddfb84ccf9744464f82e160bfa9b8b64f9d4c03f999b8643f656b412a3ac",
            )
            .unwrap(),
            height: 9,
            is_coinbase: true,
        };
        let serialized = serialize_spend_journal_entry(std::slice::from_ref(&stxo)).unwrap();
        assert_eq!(
            hex::encode(&serialized),
            "1300320511db93e1dcdb8a016b49840f8c53bc1eb68a382e97b1482ecad7b148a6909a5c"
        );

        let txns = vec![spending_tx(1, 1)];
        let decoded = deserialize_spend_journal_entry(&serialized, &txns).unwrap();
        assert_eq!(decoded, vec![stxo]);
    }

    #[test]
    fn reserved_field_only_written_above_height_zero() {
        let at_zero = SpentTxOut { amount: 0, pk_script: vec![0x51], height: 0, is_coinbase: false };
        let at_one = SpentTxOut { height: 1, ..at_zero.clone() };
        let mut buf = Vec::new();
        at_zero.put(&mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf.len(), at_zero.serialize_size().unwrap());
        buf.clear();
        at_one.put(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x02, 0x00]);
        assert_eq!(buf.len(), at_one.serialize_size().unwrap());
    }

    #[test]
    fn records_are_written_in_reverse_spend_order() {
        let first = SpentTxOut { amount: 1, pk_script: p2pkh(1), height: 5, is_coinbase: false };
        let second = SpentTxOut { amount: 2, pk_script: p2pkh(2), height: 6, is_coinbase: true };
        let serialized = serialize_spend_journal_entry(&[first.clone(), second.clone()]).unwrap();

        let (head, read) = SpentTxOut::decode(&serialized).unwrap();
        assert_eq!(head, second);
        let (tail, _) = SpentTxOut::decode(&serialized[read..]).unwrap();
        assert_eq!(tail, first);
    }

    #[test]
    fn empty_entry_without_inputs_is_valid() {
        assert_eq!(deserialize_spend_journal_entry(&[], &[]).unwrap(), vec![]);
        assert!(serialize_spend_journal_entry(&[]).unwrap().is_empty());
    }

    #[test]
    fn empty_entry_with_inputs_is_an_assertion() {
        let err = deserialize_spend_journal_entry(&[], &[spending_tx(1, 2)]).unwrap_err();
        assert!(matches!(err, ChainError::Assert(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn truncated_entry_is_a_deserialize_error() {
        let stxos = vec![
            SpentTxOut { amount: 10, pk_script: p2pkh(3), height: 2, is_coinbase: false },
            SpentTxOut { amount: 20, pk_script: p2pkh(4), height: 3, is_coinbase: false },
        ];
        let serialized = serialize_spend_journal_entry(&stxos).unwrap();
        let txns = vec![spending_tx(1, 2)];
        for cut in [1, 2, 5, serialized.len() - 1] {
            let err = deserialize_spend_journal_entry(&serialized[..cut], &txns).unwrap_err();
            assert!(err.is_deserialize(), "cut at {cut}: {err:?}");
        }
    }

    #[test]
    fn out_of_range_amount_is_not_journaled() {
        let ok = SpentTxOut { amount: 1, pk_script: p2pkh(5), height: 7, is_coinbase: false };
        let huge = SpentTxOut { amount: i64::MAX, ..ok.clone() };
        let err = serialize_spend_journal_entry(&[ok, huge]).unwrap_err();
        assert!(matches!(err, ChainError::Assert(_)));
    }

    #[test]
    fn header_without_payload_is_rejected() {
        let err = SpentTxOut::decode(&[0x02]).unwrap_err();
        assert!(err.is_deserialize());
        let err = SpentTxOut::decode(&[0x02, 0x00]).unwrap_err();
        assert!(err.is_deserialize());
    }

    fn arb_stxo() -> impl Strategy<Value = SpentTxOut> {
        (
            0..=kestrel_core::constants::MAX_MONEY,
            prop::collection::vec(any::<u8>(), 0..80),
            0..1_000_000i32,
            any::<bool>(),
        )
            .prop_map(|(amount, pk_script, height, is_coinbase)| SpentTxOut {
                amount,
                pk_script,
                height,
                is_coinbase,
            })
    }

    proptest! {
        #[test]
        fn journal_round_trips(shape in prop::collection::vec(1usize..4, 0..6), pool in prop::collection::vec(arb_stxo(), 24)) {
            let txns: Vec<Transaction> = shape
                .iter()
                .enumerate()
                .map(|(i, &inputs)| spending_tx(i as u8, inputs))
                .collect();
            let count: usize = shape.iter().sum();
            let stxos: Vec<SpentTxOut> = pool.into_iter().take(count).collect();
            prop_assume!(stxos.len() == count);

            let serialized = serialize_spend_journal_entry(&stxos).unwrap();
            let decoded = deserialize_spend_journal_entry(&serialized, &txns).unwrap();
            prop_assert_eq!(decoded, stxos);
        }
    }
}
