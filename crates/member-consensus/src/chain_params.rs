//! Per-network consensus parameters.

use crate::block::{Block, BlockHeader};
use crate::interest::MAX_PERIOD;
use crate::pow::decode_compact;
use crate::script::{self, ScriptFlags};
use crate::tx::{OutPoint, Transaction, TxIn, TxOut};
use crate::{Amount, COIN};
use num_bigint::BigUint;

/// The networks a node can run on. Consensus code never consults the port;
/// it is carried for the node's collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Testnet4,
    Scalenet,
    Nol,
    Regtest,
}

impl Network {
    /// Default P2P port.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8335,
            Network::Testnet => 18335,
            Network::Testnet4 => 28335,
            Network::Scalenet => 38335,
            Network::Nol => 48335,
            Network::Regtest => 18444,
        }
    }

    /// Lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Testnet4 => "testnet4",
            Network::Scalenet => "scalenet",
            Network::Nol => "nol",
            Network::Regtest => "regtest",
        }
    }
}

/// Consensus parameters for one network.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// The network these parameters describe.
    pub network: Network,
    /// Compact encoding of the easiest allowed target.
    pub pow_limit_bits: u32,
    /// Difficulty is never adjusted (regtest).
    pub no_retargeting: bool,
    /// Target seconds between blocks.
    pub target_spacing_secs: u64,
    /// Blocks between retargets.
    pub retarget_interval: u32,
    /// Serialized block size above which a block is excessive.
    pub excessive_block_size: u64,
    /// Confirmations an excessive block needs before its chain is eligible.
    pub excessive_accept_depth: u32,
    /// Height from which canonical (lexicographic) transaction ordering is
    /// required; before it the order must be topological.
    pub canonical_order_height: u32,
    /// Last height that still pays the bootstrap subsidy.
    pub subsidy_final_height: u32,
    /// Bootstrap subsidy amount.
    pub bootstrap_subsidy: Amount,
    /// Genesis block timestamp.
    pub genesis_time: u32,
}

impl ChainParams {
    /// Parameters for the given network.
    pub fn for_network(network: Network) -> Self {
        let base = Self {
            network,
            pow_limit_bits: 0x1d00ffff,
            no_retargeting: false,
            target_spacing_secs: 78,
            retarget_interval: crate::interest::ONEDAY,
            excessive_block_size: 32_000_000,
            excessive_accept_depth: 4,
            canonical_order_height: 0,
            subsidy_final_height: MAX_PERIOD,
            bootstrap_subsidy: 50 * COIN,
            genesis_time: 1_684_934_400,
        };
        match network {
            Network::Mainnet | Network::Nol => base,
            Network::Testnet | Network::Testnet4 => Self {
                excessive_block_size: if network == Network::Testnet4 {
                    2_000_000
                } else {
                    32_000_000
                },
                ..base
            },
            Network::Scalenet => Self {
                excessive_block_size: 256_000_000,
                ..base
            },
            Network::Regtest => Self {
                pow_limit_bits: 0x207fffff,
                no_retargeting: true,
                // Regtest keeps the subsidy at every height so tests can
                // fund chains of arbitrary length.
                subsidy_final_height: u32::MAX,
                ..base
            },
        }
    }

    /// The easiest allowed target as a 256-bit integer.
    pub fn pow_limit(&self) -> BigUint {
        decode_compact(self.pow_limit_bits).target
    }

    /// Expected seconds per retarget window.
    pub fn retarget_timespan_secs(&self) -> u64 {
        self.target_spacing_secs * self.retarget_interval as u64
    }

    /// The face value a coinbase may claim beyond collected fees. Zero at
    /// most heights once the bootstrap window closes; miner revenue is then
    /// fees, which include the interest spread.
    pub fn allowed_subsidy(&self, height: u32) -> Amount {
        if height == 0 || height > self.subsidy_final_height {
            0
        } else {
            self.bootstrap_subsidy
        }
    }

    /// Whether canonical transaction ordering is required at this height.
    pub fn canonical_order_active(&self, height: u32) -> bool {
        height >= self.canonical_order_height
    }

    /// Script verification flags for a block at this height.
    pub fn script_flags(&self, _height: u32) -> ScriptFlags {
        ScriptFlags::default()
    }

    /// The deterministic genesis block for this network.
    pub fn genesis_block(&self) -> Block {
        let mut script_sig = script::coinbase_height_script(0);
        let message = b"interest-bearing outputs from block one";
        script_sig.push(message.len() as u8);
        script_sig.extend_from_slice(message);

        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::null(), script_sig)],
            outputs: vec![TxOut::new(0, vec![script::OP_RETURN])],
            lock_time: 0,
        };

        let mut block = Block {
            header: BlockHeader {
                version: crate::params::BASE_VERSION,
                prev_hash: crate::Hash256::ZERO,
                merkle_root: crate::Hash256::ZERO,
                time: self.genesis_time,
                bits: self.pow_limit_bits,
                nonce: 0,
            },
            txs: vec![coinbase],
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_networks_have_distinct_ports() {
        let nets = [
            Network::Mainnet,
            Network::Testnet,
            Network::Testnet4,
            Network::Scalenet,
            Network::Nol,
            Network::Regtest,
        ];
        let mut ports: Vec<u16> = nets.iter().map(|n| n.default_port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), nets.len());
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let params = ChainParams::for_network(Network::Regtest);
        let a = params.genesis_block();
        let b = params.genesis_block();
        assert_eq!(a.hash(), b.hash());
        assert!(a.txs[0].is_coinbase());
        assert_eq!(a.header.merkle_root, a.compute_merkle_root());
    }

    #[test]
    fn test_genesis_differs_across_networks() {
        let mainnet = ChainParams::for_network(Network::Mainnet).genesis_block();
        let regtest = ChainParams::for_network(Network::Regtest).genesis_block();
        assert_ne!(mainnet.hash(), regtest.hash());
    }

    #[test]
    fn test_subsidy_schedule() {
        let params = ChainParams::for_network(Network::Mainnet);
        assert_eq!(params.allowed_subsidy(0), 0);
        assert_eq!(params.allowed_subsidy(1), 50 * COIN);
        assert_eq!(params.allowed_subsidy(MAX_PERIOD), 50 * COIN);
        assert_eq!(params.allowed_subsidy(MAX_PERIOD + 1), 0);

        let regtest = ChainParams::for_network(Network::Regtest);
        assert_eq!(regtest.allowed_subsidy(10_000_000), 50 * COIN);
    }
}
