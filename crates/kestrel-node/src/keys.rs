//! Outpoint keys for the UTXO set.
//!
//! A key is `txid(32) || vlq(index)`. The VLQ encoding preserves numeric
//! order, so all outputs of one transaction are adjacent and sorted by
//! index, and a cursor seek to `(txid, 0)` lands on the lowest remaining
//! output of that transaction (or on the next transaction, which callers
//! must detect).
//!
//! Key buffers come from a shared pool and go back to it when the
//! [`PooledKey`] is dropped. A key handed to the store as an owned buffer is
//! retained by the transaction, so it is detached with
//! [`PooledKey::into_vec`] and never returns to the pool.

use std::ops::Deref;
use std::sync::LazyLock;

use parking_lot::Mutex;

use kestrel_core::compress::{MAX_U32_VLQ_SIZE, append_vlq, deserialize_vlq};
use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::ChainError;
use kestrel_core::types::{Hash256, OutPoint};

/// Worst-case size of an outpoint key.
pub const MAX_OUTPOINT_KEY_SIZE: usize = HASH_SIZE + MAX_U32_VLQ_SIZE;

/// Upper bound on idle buffers kept around.
const MAX_POOLED_KEYS: usize = 1024;

static KEY_POOL: LazyLock<Mutex<Vec<Vec<u8>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// An outpoint key checked out of the shared pool.
#[derive(Debug)]
pub struct PooledKey {
    buf: Vec<u8>,
}

impl PooledKey {
    fn checkout() -> Self {
        let buf = KEY_POOL
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(MAX_OUTPOINT_KEY_SIZE));
        Self { buf }
    }

    /// Take ownership of the bytes. The buffer leaves the pool for good.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledKey {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for PooledKey {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledKey {
    fn drop(&mut self) {
        // Detached keys leave an empty, unallocated buffer behind.
        if self.buf.capacity() < MAX_OUTPOINT_KEY_SIZE {
            return;
        }
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut pool = KEY_POOL.lock();
        if pool.len() < MAX_POOLED_KEYS {
            pool.push(buf);
        }
    }
}

/// Build the UTXO-set key for `outpoint` in a pooled buffer.
pub fn outpoint_key(outpoint: &OutPoint) -> PooledKey {
    let mut key = PooledKey::checkout();
    key.buf.extend_from_slice(outpoint.txid.as_bytes());
    append_vlq(&mut key.buf, u64::from(outpoint.index));
    key
}

/// Key of the lowest possible output of `txid`, the seek target when looking
/// for any unspent output of a transaction.
pub fn first_output_key(txid: &Hash256) -> PooledKey {
    outpoint_key(&OutPoint::new(*txid, 0))
}

/// Inverse of [`outpoint_key`].
pub fn decode_outpoint_key(key: &[u8]) -> Result<OutPoint, ChainError> {
    if key.len() <= HASH_SIZE {
        return Err(ChainError::Deserialize(format!(
            "outpoint key too short: {} bytes",
            key.len()
        )));
    }
    let (txid_bytes, rest) = key.split_at(HASH_SIZE);
    let (index, read) = deserialize_vlq(rest)?;
    if read != rest.len() {
        return Err(ChainError::Deserialize(format!(
            "{} trailing bytes after outpoint index",
            rest.len() - read
        )));
    }
    let index = u32::try_from(index)
        .map_err(|_| ChainError::Deserialize(format!("outpoint index {index} exceeds u32")))?;
    let txid = Hash256::from_slice(txid_bytes)
        .ok_or_else(|| ChainError::Deserialize("bad txid length".into()))?;
    Ok(OutPoint::new(txid, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_is_txid_then_vlq_index() {
        let txid = Hash256([0xab; 32]);
        let key = outpoint_key(&OutPoint::new(txid, 0));
        assert_eq!(key.len(), 33);
        assert_eq!(&key[..32], txid.as_bytes());
        assert_eq!(key[32], 0x00);

        let key = outpoint_key(&OutPoint::new(txid, 128));
        assert_eq!(hex::encode(&key[32..]), "8000");
    }

    #[test]
    fn max_index_fits_max_size() {
        let key = outpoint_key(&OutPoint::new(Hash256::ZERO, u32::MAX));
        assert_eq!(key.len(), MAX_OUTPOINT_KEY_SIZE);
    }

    #[test]
    fn decode_inverts_encode() {
        let outpoint = OutPoint::new(Hash256([7; 32]), 300);
        let key = outpoint_key(&outpoint);
        assert_eq!(decode_outpoint_key(&key).unwrap(), outpoint);
    }

    #[test]
    fn decode_rejects_malformed_keys() {
        assert!(decode_outpoint_key(&[0; 32]).unwrap_err().is_deserialize());
        let mut trailing = outpoint_key(&OutPoint::new(Hash256::ZERO, 1)).into_vec();
        trailing.push(0);
        assert!(decode_outpoint_key(&trailing).unwrap_err().is_deserialize());
        // Continuation bit set on the last byte.
        let mut truncated = vec![0; 32];
        truncated.push(0x80);
        assert!(decode_outpoint_key(&truncated).unwrap_err().is_deserialize());
    }

    #[test]
    fn detached_key_keeps_its_bytes() {
        let outpoint = OutPoint::new(Hash256([3; 32]), 9);
        let expected = outpoint_key(&outpoint).to_vec();
        let detached = outpoint_key(&outpoint).into_vec();
        assert_eq!(detached, expected);
        // Later checkouts never alias a detached buffer.
        let other = outpoint_key(&OutPoint::new(Hash256([4; 32]), 1));
        assert_ne!(other.as_ptr(), detached.as_ptr());
        assert_eq!(detached, expected);
    }

    #[test]
    fn recycled_buffers_start_empty() {
        for index in 0..64 {
            let outpoint = OutPoint::new(Hash256([index as u8; 32]), index);
            let key = outpoint_key(&outpoint);
            assert_eq!(decode_outpoint_key(&key).unwrap(), outpoint);
        }
    }

    #[test]
    fn pool_is_safe_across_threads() {
        let handles: Vec<_> = (0..8u8)
            .map(|seed| {
                std::thread::spawn(move || {
                    for index in 0..500u32 {
                        let outpoint = OutPoint::new(Hash256([seed; 32]), index);
                        let key = outpoint_key(&outpoint);
                        assert_eq!(decode_outpoint_key(&key).unwrap(), outpoint);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn key_order_matches_index_order(seed in any::<[u8; 32]>(), mut indices in prop::collection::vec(any::<u32>(), 1..40)) {
            let txid = Hash256(seed);
            let mut keys: Vec<Vec<u8>> = indices
                .iter()
                .map(|&i| outpoint_key(&OutPoint::new(txid, i)).into_vec())
                .collect();
            keys.sort();
            indices.sort();
            let decoded: Vec<u32> = keys
                .iter()
                .map(|k| decode_outpoint_key(k).unwrap().index)
                .collect();
            prop_assert_eq!(decoded, indices);
        }

        #[test]
        fn key_round_trips(seed in any::<[u8; 32]>(), index in any::<u32>()) {
            let outpoint = OutPoint::new(Hash256(seed), index);
            prop_assert_eq!(decode_outpoint_key(&outpoint_key(&outpoint)).unwrap(), outpoint);
        }
    }
}
