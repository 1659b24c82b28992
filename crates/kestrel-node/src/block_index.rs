//! Block index: persisted header rows, the main-chain hash/height maps and
//! the in-memory block tree rebuilt from them.
//!
//! Rows of the block index bucket are keyed `height(4 BE) || hash(32)` so a
//! cursor walks them by height; the value is `header(80) || status(1)`.
//! The bucket holds every known block. The two maps only cover the main
//! chain:
//!
//! - hash → height: key `hash`, value `height(4 LE)`
//! - height → hash: key `height(4 BE)`, value `hash`
//!
//! Both maps are always updated together inside the caller's transaction.

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use num_bigint::BigUint;

use kestrel_core::constants::{BLOCK_HEADER_SIZE, HASH_SIZE};
use kestrel_core::error::ChainError;
use kestrel_core::types::{BlockHeader, Hash256};
use kestrel_core::work::calc_work;

use crate::database::Tx;

pub const BLOCK_INDEX_BUCKET: &[u8] = b"blockheaderidx";
pub const HASH_INDEX_BUCKET: &[u8] = b"hashidx";
pub const HEIGHT_INDEX_BUCKET: &[u8] = b"heightidx";
/// Metadata key of the block index format version.
pub const BLOCK_INDEX_VERSION_KEY: &[u8] = b"blockindexversion";
pub const CURRENT_BLOCK_INDEX_VERSION: u32 = 1;

const BLOCK_INDEX_KEY_SIZE: usize = 4 + HASH_SIZE;
const BLOCK_INDEX_ROW_SIZE: usize = BLOCK_HEADER_SIZE + 1;

bitflags! {
    /// Validation state of a block, persisted as one byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockStatus: u8 {
        /// The full block body is in the block store.
        const DATA_STORED = 1 << 0;
        /// The block passed full validation.
        const VALID = 1 << 1;
        /// The block failed validation.
        const VALIDATE_FAILED = 1 << 2;
        /// An ancestor failed validation.
        const INVALID_ANCESTOR = 1 << 3;
    }
}

impl BlockStatus {
    pub fn known_valid(self) -> bool {
        self.contains(Self::VALID)
    }

    pub fn known_invalid(self) -> bool {
        self.intersects(Self::VALIDATE_FAILED | Self::INVALID_ANCESTOR)
    }
}

pub fn block_index_key(hash: &Hash256, height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_INDEX_KEY_SIZE);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

pub fn decode_block_index_key(key: &[u8]) -> Result<(u32, Hash256), ChainError> {
    if key.len() != BLOCK_INDEX_KEY_SIZE {
        return Err(ChainError::Deserialize(format!(
            "block index key has {} bytes, want {BLOCK_INDEX_KEY_SIZE}",
            key.len()
        )));
    }
    let mut height = [0u8; 4];
    height.copy_from_slice(&key[..4]);
    let hash = Hash256::from_slice(&key[4..])
        .ok_or_else(|| ChainError::Deserialize("bad block index key hash".into()))?;
    Ok((u32::from_be_bytes(height), hash))
}

pub fn serialize_block_index_row(header: &BlockHeader, status: BlockStatus) -> Vec<u8> {
    let mut row = Vec::with_capacity(BLOCK_INDEX_ROW_SIZE);
    row.extend_from_slice(&header.serialize());
    row.push(status.bits());
    row
}

pub fn deserialize_block_index_row(row: &[u8]) -> Result<(BlockHeader, BlockStatus), ChainError> {
    if row.len() != BLOCK_INDEX_ROW_SIZE {
        return Err(ChainError::Deserialize(format!(
            "block index row has {} bytes, want {BLOCK_INDEX_ROW_SIZE}",
            row.len()
        )));
    }
    let header = BlockHeader::deserialize(&row[..BLOCK_HEADER_SIZE])?;
    Ok((header, BlockStatus::from_bits_retain(row[BLOCK_HEADER_SIZE])))
}

pub fn db_put_block_index_row(
    tx: &mut Tx<'_>,
    hash: &Hash256,
    height: u32,
    header: &BlockHeader,
    status: BlockStatus,
) -> Result<(), ChainError> {
    tx.put(
        BLOCK_INDEX_BUCKET,
        block_index_key(hash, height),
        serialize_block_index_row(header, status),
    )?;
    Ok(())
}

/// Record `hash` at `height` in both main-chain maps.
pub fn db_put_block_index(tx: &mut Tx<'_>, hash: &Hash256, height: u32) -> Result<(), ChainError> {
    tx.put(HASH_INDEX_BUCKET, hash.as_bytes().to_vec(), height.to_le_bytes().to_vec())?;
    tx.put(HEIGHT_INDEX_BUCKET, height.to_be_bytes().to_vec(), hash.as_bytes().to_vec())?;
    Ok(())
}

/// Remove `hash` at `height` from both main-chain maps.
pub fn db_remove_block_index(tx: &mut Tx<'_>, hash: &Hash256, height: u32) -> Result<(), ChainError> {
    tx.delete(HASH_INDEX_BUCKET, hash.as_bytes().to_vec())?;
    tx.delete(HEIGHT_INDEX_BUCKET, height.to_be_bytes().to_vec())?;
    Ok(())
}

pub fn db_fetch_height_by_hash(tx: &Tx<'_>, hash: &Hash256) -> Result<u32, ChainError> {
    let Some(serialized) = tx.get(HASH_INDEX_BUCKET, hash.as_bytes())? else {
        return Err(ChainError::NotInMainChain(format!("block {hash}")));
    };
    let bytes: [u8; 4] = serialized.as_slice().try_into().map_err(|_| ChainError::Corruption {
        what: format!("hash index entry for {hash}"),
        detail: format!("{} bytes, want 4", serialized.len()),
    })?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn db_fetch_hash_by_height(tx: &Tx<'_>, height: u32) -> Result<Hash256, ChainError> {
    let Some(serialized) = tx.get(HEIGHT_INDEX_BUCKET, &height.to_be_bytes())? else {
        return Err(ChainError::NotInMainChain(format!("block at height {height}")));
    };
    Hash256::from_slice(&serialized).ok_or_else(|| ChainError::Corruption {
        what: format!("height index entry for {height}"),
        detail: format!("{} bytes, want {HASH_SIZE}", serialized.len()),
    })
}

/// A block in the in-memory tree.
#[derive(Debug, Clone)]
pub struct BlockNode {
    pub hash: Hash256,
    /// Arena index of the parent, `None` for genesis.
    pub parent: Option<usize>,
    pub height: u32,
    /// Total work of the chain ending at this block.
    pub work_sum: BigUint,
    pub header: BlockHeader,
    pub status: BlockStatus,
}

/// Arena of every known block, addressable by hash.
///
/// Nodes are only appended; their arena index stays valid for the life of
/// the index.
#[derive(Debug, Default)]
pub struct BlockIndex {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<Hash256, usize>,
    dirty: BTreeSet<usize>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node for `header` as a child of `parent`. Height and work
    /// follow from the parent. Adding a known hash returns the existing
    /// node unchanged.
    pub fn add_node(&mut self, header: BlockHeader, parent: Option<usize>, status: BlockStatus) -> usize {
        let hash = header.hash();
        if let Some(&existing) = self.by_hash.get(&hash) {
            return existing;
        }
        let (height, parent_work) = match parent {
            Some(p) => (self.nodes[p].height + 1, self.nodes[p].work_sum.clone()),
            None => (0, BigUint::default()),
        };
        let idx = self.nodes.len();
        self.nodes.push(BlockNode {
            hash,
            parent,
            height,
            work_sum: parent_work + calc_work(header.bits),
            header,
            status,
        });
        self.by_hash.insert(hash, idx);
        idx
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    /// # Panics
    ///
    /// If `idx` was not returned by this index.
    pub fn node(&self, idx: usize) -> &BlockNode {
        &self.nodes[idx]
    }

    /// The ancestor of `idx` at `height`, if `height` is not above it.
    pub fn ancestor(&self, idx: usize, height: u32) -> Option<usize> {
        let mut current = idx;
        if self.nodes[current].height < height {
            return None;
        }
        while self.nodes[current].height > height {
            current = self.nodes[current].parent?;
        }
        Some(current)
    }

    /// Set `flags` on a node, marking it dirty if anything changed.
    pub fn set_status_flags(&mut self, idx: usize, flags: BlockStatus) {
        let node = &mut self.nodes[idx];
        let updated = node.status | flags;
        if updated != node.status {
            node.status = updated;
            self.dirty.insert(idx);
        }
    }

    pub fn unset_status_flags(&mut self, idx: usize, flags: BlockStatus) {
        let node = &mut self.nodes[idx];
        let updated = node.status - flags;
        if updated != node.status {
            node.status = updated;
            self.dirty.insert(idx);
        }
    }

    /// Record `status` for a node whose row the caller has already written.
    pub fn set_persisted_status(&mut self, idx: usize, status: BlockStatus) {
        self.nodes[idx].status = status;
        self.dirty.remove(&idx);
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Write every dirty node's row and clear the dirty set. Returns the
    /// number of rows written.
    ///
    /// The dirty set is cleared even though the caller's transaction may
    /// still fail; callers treat such a failure as fatal.
    pub fn flush_to_db(&mut self, tx: &mut Tx<'_>) -> Result<usize, ChainError> {
        let dirty = std::mem::take(&mut self.dirty);
        for &idx in &dirty {
            let node = &self.nodes[idx];
            db_put_block_index_row(tx, &node.hash, node.height, &node.header, node.status)?;
        }
        Ok(dirty.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use kestrel_core::genesis::ChainParams;
    use proptest::prelude::*;

    fn index_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.update(|tx| {
            tx.create_bucket(BLOCK_INDEX_BUCKET)?;
            tx.create_bucket(HASH_INDEX_BUCKET)?;
            tx.create_bucket(HEIGHT_INDEX_BUCKET)
        })
        .unwrap();
        db
    }

    fn child_header(parent: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            prev_block: parent.hash(),
            nonce,
            ..parent.clone()
        }
    }

    #[test]
    fn row_layout() {
        let header = ChainParams::regtest().genesis_block.header.clone();
        let status = BlockStatus::DATA_STORED | BlockStatus::VALID;
        let row = serialize_block_index_row(&header, status);
        assert_eq!(row.len(), 81);
        assert_eq!(row[80], 0x03);
        assert_eq!(deserialize_block_index_row(&row).unwrap(), (header, status));
        assert!(deserialize_block_index_row(&row[..80]).unwrap_err().is_deserialize());
    }

    #[test]
    fn unknown_status_bits_survive() {
        let header = ChainParams::regtest().genesis_block.header.clone();
        let mut row = serialize_block_index_row(&header, BlockStatus::VALID);
        row[80] = 0x82;
        let (_, status) = deserialize_block_index_row(&row).unwrap();
        assert_eq!(status.bits(), 0x82);
        assert!(status.known_valid());
    }

    #[test]
    fn key_sorts_by_height() {
        let low = block_index_key(&Hash256([0xff; 32]), 1);
        let high = block_index_key(&Hash256([0x00; 32]), 256);
        assert!(low < high);
        let (height, hash) = decode_block_index_key(&high).unwrap();
        assert_eq!((height, hash), (256, Hash256::ZERO));
        assert!(decode_block_index_key(&high[..35]).is_err());
    }

    #[test]
    fn status_predicates() {
        assert!(!BlockStatus::DATA_STORED.known_valid());
        assert!(BlockStatus::INVALID_ANCESTOR.known_invalid());
        assert!(!(BlockStatus::DATA_STORED | BlockStatus::VALID).known_invalid());
    }

    #[test]
    fn dual_maps_move_together() {
        let db = index_db();
        let hash = Hash256([0x21; 32]);
        db.update(|tx| db_put_block_index(tx, &hash, 7)).unwrap();
        db.view(|tx| {
            assert_eq!(db_fetch_height_by_hash(tx, &hash)?, 7);
            assert_eq!(db_fetch_hash_by_height(tx, 7)?, hash);
            Ok::<_, ChainError>(())
        })
        .unwrap();

        db.update(|tx| db_remove_block_index(tx, &hash, 7)).unwrap();
        db.view(|tx| {
            assert!(matches!(db_fetch_height_by_hash(tx, &hash), Err(ChainError::NotInMainChain(_))));
            assert!(matches!(db_fetch_hash_by_height(tx, 7), Err(ChainError::NotInMainChain(_))));
            Ok::<_, ChainError>(())
        })
        .unwrap();
    }

    #[test]
    fn failed_update_leaves_neither_map() {
        let db = index_db();
        let hash = Hash256([0x22; 32]);
        let result: Result<(), ChainError> = db.update(|tx| {
            db_put_block_index(tx, &hash, 3)?;
            Err(ChainError::Assert("abort".into()))
        });
        assert!(result.is_err());
        let missing = db.view(|tx| db_fetch_hash_by_height(tx, 3)).unwrap_err();
        assert!(matches!(missing, ChainError::NotInMainChain(_)));
    }

    #[test]
    fn malformed_map_values_are_corruption() {
        let db = index_db();
        let hash = Hash256([0x23; 32]);
        db.update(|tx| {
            tx.put(HASH_INDEX_BUCKET, hash.as_bytes().to_vec(), vec![1, 2, 3])?;
            tx.put(HEIGHT_INDEX_BUCKET, 9u32.to_be_bytes().to_vec(), vec![0; 31])
        })
        .unwrap();
        let err = db.view(|tx| db_fetch_height_by_hash(tx, &hash)).unwrap_err();
        assert!(err.is_fatal());
        let err = db.view(|tx| db_fetch_hash_by_height(tx, 9)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn arena_tracks_height_work_and_ancestry() {
        let genesis = ChainParams::regtest().genesis_block.header.clone();
        let mut index = BlockIndex::new();
        let g = index.add_node(genesis.clone(), None, BlockStatus::VALID);
        let a = index.add_node(child_header(&genesis, 1), Some(g), BlockStatus::DATA_STORED);
        let b = index.add_node(child_header(&index.node(a).header.clone(), 2), Some(a), BlockStatus::DATA_STORED);

        assert_eq!(index.len(), 3);
        assert_eq!(index.node(b).height, 2);
        assert_eq!(index.node(b).work_sum, BigUint::from(6u32));
        assert_eq!(index.ancestor(b, 0), Some(g));
        assert_eq!(index.ancestor(a, 2), None);
        assert_eq!(index.lookup(&index.node(a).hash), Some(a));
        assert_eq!(index.add_node(genesis, None, BlockStatus::empty()), g);
    }

    #[test]
    fn flush_writes_only_dirty_nodes() {
        let db = index_db();
        let genesis = ChainParams::regtest().genesis_block.header.clone();
        let mut index = BlockIndex::new();
        let g = index.add_node(genesis.clone(), None, BlockStatus::DATA_STORED);
        assert!(!index.has_dirty());

        index.set_status_flags(g, BlockStatus::DATA_STORED);
        assert!(!index.has_dirty());
        index.set_status_flags(g, BlockStatus::VALID);
        assert!(index.has_dirty());

        let written = db.update(|tx| index.flush_to_db(tx)).unwrap();
        assert_eq!(written, 1);
        assert!(!index.has_dirty());
        assert_eq!(db.update(|tx| index.flush_to_db(tx)).unwrap(), 0);

        let hash = index.node(g).hash;
        let row = db
            .view(|tx| tx.get(BLOCK_INDEX_BUCKET, &block_index_key(&hash, 0)))
            .unwrap()
            .unwrap();
        let (_, status) = deserialize_block_index_row(&row).unwrap();
        assert_eq!(status, BlockStatus::DATA_STORED | BlockStatus::VALID);

        index.unset_status_flags(g, BlockStatus::VALID);
        assert!(index.has_dirty());
    }

    #[test]
    fn persisted_status_is_not_flushed_again() {
        let db = index_db();
        let genesis = ChainParams::regtest().genesis_block.header.clone();
        let mut index = BlockIndex::new();
        let g = index.add_node(genesis, None, BlockStatus::DATA_STORED);
        index.set_status_flags(g, BlockStatus::VALIDATE_FAILED);
        assert!(index.has_dirty());

        let status = BlockStatus::DATA_STORED | BlockStatus::VALID;
        index.set_persisted_status(g, status);
        assert_eq!(index.node(g).status, status);
        assert!(!index.has_dirty());
        assert_eq!(db.update(|tx| index.flush_to_db(tx)).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn height_keys_order_like_heights(a in any::<u32>(), b in any::<u32>(), ha in any::<[u8; 32]>(), hb in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let ka = block_index_key(&Hash256(ha), a);
            let kb = block_index_key(&Hash256(hb), b);
            prop_assert_eq!(ka < kb, a < b);
        }
    }
}
