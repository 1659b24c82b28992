//! Protocol constants. All monetary values in satoshis (1 coin = 10^8 satoshis).

pub const COIN: i64 = 100_000_000;

/// Largest amount any single output may carry.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Serialized size of a block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Size of a transaction or block hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Opcode marking an output script as provably unspendable.
pub const OP_RETURN: u8 = 0x6a;

/// Scripts longer than this can never be spent.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Selects the genesis block, the data directory suffix and the proof-of-work
/// limit.
///
/// # Examples
///
/// ```
/// use kestrel_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert_eq!(net.data_dir_suffix(), "mainnet");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network with a trivial proof-of-work limit.
    Regtest,
}

impl NetworkType {
    /// Subdirectory name appended to the base data directory path.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel_core::constants::NetworkType;
    /// assert_eq!(NetworkType::Testnet.data_dir_suffix(), "testnet");
    /// ```
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    /// Compact encoding of the easiest target allowed on this network.
    pub fn pow_limit_bits(&self) -> u32 {
        match self {
            Self::Regtest => 0x207f_ffff,
            _ => 0x1d00_ffff,
        }
    }
}

/// Whether an output script can never be satisfied, so the output never
/// needs to enter the UTXO set.
pub fn is_unspendable(pk_script: &[u8]) -> bool {
    matches!(pk_script.first(), Some(&OP_RETURN)) || pk_script.len() > MAX_SCRIPT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_return_is_unspendable() {
        assert!(is_unspendable(&[OP_RETURN, 0x04, 1, 2, 3, 4]));
        assert!(!is_unspendable(&[0x76, 0xa9]));
        assert!(!is_unspendable(&[]));
    }

    #[test]
    fn oversized_script_is_unspendable() {
        assert!(is_unspendable(&vec![0x51; MAX_SCRIPT_SIZE + 1]));
        assert!(!is_unspendable(&vec![0x51; MAX_SCRIPT_SIZE]));
    }

    #[test]
    fn pow_limits_differ_for_regtest() {
        assert_eq!(NetworkType::Mainnet.pow_limit_bits(), 0x1d00ffff);
        assert_eq!(NetworkType::Testnet.pow_limit_bits(), 0x1d00ffff);
        assert_eq!(NetworkType::Regtest.pow_limit_bits(), 0x207fffff);
    }
}
