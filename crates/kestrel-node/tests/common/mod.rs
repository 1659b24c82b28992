//! Block and transaction builders shared by the integration tests.

#![allow(dead_code)]

use kestrel_core::constants::COIN;
use kestrel_core::genesis::ChainParams;
use kestrel_core::merkle;
use kestrel_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut};
use kestrel_node_lib::{BlockChain, Database};

pub fn regtest() -> &'static ChainParams {
    ChainParams::regtest()
}

pub fn p2pkh(seed: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[seed; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// A coinbase unique to `height`, paying `value` to `script`.
pub fn make_coinbase(height: u32, value: i64, script: Vec<u8>) -> Transaction {
    let mut signature_script = vec![0x04];
    signature_script.extend_from_slice(&height.to_le_bytes());
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint::null(),
            signature_script,
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut { value, pk_script: script }],
        lock_time: 0,
    }
}

pub fn make_tx(outpoints: &[OutPoint], outputs: &[(i64, Vec<u8>)]) -> Transaction {
    Transaction {
        version: 1,
        inputs: outpoints
            .iter()
            .map(|op| TxIn {
                previous_output: *op,
                signature_script: vec![0; 72],
                sequence: u32::MAX,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(value, script)| TxOut { value: *value, pk_script: script.clone() })
            .collect(),
        lock_time: 0,
    }
}

pub fn make_block(prev_block: Hash256, timestamp: u32, txs: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_block,
            merkle_root: merkle::merkle_root_of(&txs),
            timestamp,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        transactions: txs,
    }
}

/// Block on top of the chain's tip holding a fresh coinbase plus `txs`.
pub fn next_block(chain: &BlockChain, txs: Vec<Transaction>) -> Block {
    let best = chain.best_state();
    let height = best.height + 1;
    let mut all = vec![make_coinbase(height, 50 * COIN, p2pkh(height as u8))];
    all.extend(txs);
    make_block(best.hash, 1_296_688_602 + height * 600, all)
}

pub fn open_memory_chain() -> BlockChain {
    BlockChain::open(Database::in_memory().unwrap(), regtest()).unwrap()
}

/// Connect `count` coinbase-only blocks, returning them in order.
pub fn mine(chain: &mut BlockChain, count: usize) -> Vec<Block> {
    (0..count)
        .map(|_| {
            let block = next_block(chain, vec![]);
            chain.connect_block(&block).unwrap();
            block
        })
        .collect()
}
