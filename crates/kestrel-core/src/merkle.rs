//! Transaction merkle root.
//!
//! Internal nodes are `SHA256d(left || right)` over transaction ids.
//! Odd-length layers are padded by duplicating the last element.
//! Empty trees produce [`Hash256::ZERO`].

use crate::types::{Hash256, Transaction};

/// Compute an internal node hash: `SHA256d(left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash256::double_sha256(&data)
}

/// Compute the merkle root from a slice of transaction ids.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }

    let mut current = txids.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

/// Merkle root over the ids of `txs`.
pub fn merkle_root_of(txs: &[Transaction]) -> Hash256 {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    merkle_root(&txids)
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => node_hash(left, right),
            [single] => node_hash(single, single),
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(seed: u8) -> Hash256 {
        Hash256([seed; 32])
    }

    #[test]
    fn empty_tree_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        assert_eq!(merkle_root(&[h(1)]), h(1));
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let three = merkle_root(&[h(1), h(2), h(3)]);
        let four = merkle_root(&[h(1), h(2), h(3), h(3)]);
        assert_eq!(three, four);
    }

    #[test]
    fn order_matters() {
        assert_ne!(merkle_root(&[h(1), h(2)]), merkle_root(&[h(2), h(1)]));
    }
}
