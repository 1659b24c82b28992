//! Genesis blocks and per-network chain parameters.
//!
//! All networks share the same genesis coinbase; they differ in timestamp,
//! target and nonce. The genesis coinbase output is never spendable, so it
//! is never added to the UTXO set.
//!
//! Values are hardcoded and deterministic: every node computes the identical
//! genesis block.

use std::sync::LazyLock;

use crate::constants::{COIN, NetworkType};
use crate::merkle;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut};

/// Headline embedded in the genesis coinbase.
pub const GENESIS_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Public key the genesis coinbase pays to.
const GENESIS_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb6\
                              49f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

/// Chain parameters that the persistence layer depends on.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: NetworkType,
    pub genesis_block: Block,
    pub genesis_hash: Hash256,
    /// Compact encoding of the easiest allowed target.
    pub pow_limit_bits: u32,
}

static MAINNET: LazyLock<ChainParams> =
    LazyLock::new(|| build_params(NetworkType::Mainnet, 1_231_006_505, 0x1d00_ffff, 2_083_236_893));
static TESTNET: LazyLock<ChainParams> =
    LazyLock::new(|| build_params(NetworkType::Testnet, 1_296_688_602, 0x1d00_ffff, 414_098_458));
static REGTEST: LazyLock<ChainParams> =
    LazyLock::new(|| build_params(NetworkType::Regtest, 1_296_688_602, 0x207f_ffff, 2));

impl ChainParams {
    /// Parameters for `network`.
    pub fn for_network(network: NetworkType) -> &'static ChainParams {
        match network {
            NetworkType::Mainnet => &MAINNET,
            NetworkType::Testnet => &TESTNET,
            NetworkType::Regtest => &REGTEST,
        }
    }

    pub fn mainnet() -> &'static ChainParams {
        &MAINNET
    }

    pub fn testnet() -> &'static ChainParams {
        &TESTNET
    }

    pub fn regtest() -> &'static ChainParams {
        &REGTEST
    }
}

fn build_params(network: NetworkType, timestamp: u32, bits: u32, nonce: u32) -> ChainParams {
    let coinbase = genesis_coinbase();
    let merkle_root = merkle::merkle_root(&[coinbase.txid()]);
    let genesis_block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: Hash256::ZERO,
            merkle_root,
            timestamp,
            bits,
            nonce,
        },
        transactions: vec![coinbase],
    };
    let genesis_hash = genesis_block.hash();

    ChainParams {
        network,
        genesis_block,
        genesis_hash,
        pow_limit_bits: network.pow_limit_bits(),
    }
}

/// The genesis coinbase transaction: the headline in the input script and a
/// single 50-coin pay-to-pubkey output.
fn genesis_coinbase() -> Transaction {
    let mut signature_script = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    signature_script.push(GENESIS_MESSAGE.len() as u8);
    signature_script.extend_from_slice(GENESIS_MESSAGE);

    let mut pk_script = vec![0x41];
    pk_script.extend(hex::decode(GENESIS_PUBKEY).unwrap_or_default());
    pk_script.push(0xac);

    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint::null(),
            signature_script,
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50 * COIN,
            pk_script,
        }],
        lock_time: 0,
    }
}
