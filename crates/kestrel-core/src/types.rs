//! Core protocol types: hashes, outpoints, transactions and blocks.
//!
//! Transaction ids and block hashes are double SHA-256 over the canonical
//! wire layout. Hashes are stored in internal byte order and displayed
//! byte-reversed, the way block explorers print them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::{BLOCK_HEADER_SIZE, HASH_SIZE};
use crate::error::ChainError;

/// A 32-byte hash value in internal byte order.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used as the previous-block hash of genesis and in
    /// coinbase outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Build a hash from a slice that must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse the byte-reversed hex form produced by [`fmt::Display`].
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = hex::decode(s).ok()?;
        bytes.reverse();
        Self::from_slice(&bytes)
    }

    /// Double SHA-256 of `data`.
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Self(Sha256::digest(first).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxIn {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script. Arbitrary data for coinbase inputs.
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: i64,
    /// Locking script.
    pub pk_script: Vec<u8>,
}

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Canonical wire encoding (no witness data).
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialize_size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.previous_output.txid.as_bytes());
            buf.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_compact_size(&mut buf, input.signature_script.len() as u64);
            buf.extend_from_slice(&input.signature_script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_compact_size(&mut buf, output.pk_script.len() as u64);
            buf.extend_from_slice(&output.pk_script);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Length of [`Transaction::serialize`] without building it.
    pub fn serialize_size(&self) -> usize {
        let mut n = 8 + compact_size_len(self.inputs.len() as u64)
            + compact_size_len(self.outputs.len() as u64);
        for input in &self.inputs {
            let len = input.signature_script.len();
            n += HASH_SIZE + 4 + compact_size_len(len as u64) + len + 4;
        }
        for output in &self.outputs {
            let len = output.pk_script.len();
            n += 8 + compact_size_len(len as u64) + len;
        }
        n
    }

    /// Transaction id: double SHA-256 of the wire encoding.
    pub fn txid(&self) -> Hash256 {
        Hash256::double_sha256(&self.serialize())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: i32,
    /// Hash of the previous block header.
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Fixed 80-byte layout: version || prev_block || merkle_root ||
    /// timestamp || bits || nonce, integers little-endian.
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_block.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Decode the first 80 bytes of `bytes` as a header.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(ChainError::Deserialize(format!(
                "block header needs {BLOCK_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let mut prev_block = [0u8; 32];
        prev_block.copy_from_slice(&bytes[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&bytes[36..68]);
        Ok(Self {
            version: u32_at(0) as i32,
            prev_block: Hash256(prev_block),
            merkle_root: Hash256(merkle_root),
            timestamp: u32_at(68),
            bits: u32_at(72),
            nonce: u32_at(76),
        })
    }

    /// Block hash: double SHA-256 of the 80-byte header.
    pub fn hash(&self) -> Hash256 {
        Hash256::double_sha256(&self.serialize())
    }
}

/// A full block: header plus transactions, coinbase first.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Transactions other than the coinbase, the ones whose inputs spend
    /// real outputs.
    pub fn spending_transactions(&self) -> &[Transaction] {
        self.transactions.get(1..).unwrap_or(&[])
    }

    /// Number of outputs the block's transactions consume.
    pub fn spent_output_count(&self) -> usize {
        self.spending_transactions()
            .iter()
            .map(|tx| tx.inputs.len())
            .sum()
    }
}

/// Append a Bitcoin CompactSize integer.
pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
