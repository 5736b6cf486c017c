//! Test-data generators: valid regtest blocks and transactions.

use member_consensus::chain_params::{ChainParams, Network};
use member_consensus::{
    pow, script, Amount, Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut, COIN,
};

/// Fixed "now" used across integration tests, far from any genesis time.
pub const TEST_NOW: u64 = 1_800_000_000;

/// Regtest parameters.
pub fn regtest_params() -> ChainParams {
    ChainParams::for_network(Network::Regtest)
}

/// A coinbase for `height` paying `value` to an anyone-can-spend script.
/// The tweak byte decorrelates otherwise identical coinbases on competing
/// forks.
pub fn coinbase(height: u32, value: Amount, tweak: u8) -> Transaction {
    Transaction {
        version: Transaction::CURRENT_VERSION,
        inputs: vec![TxIn::new(
            OutPoint::null(),
            script::coinbase_height_script(height),
        )],
        outputs: vec![TxOut::new(value, vec![script::OP_1, tweak])],
        lock_time: 0,
    }
}

/// A transaction spending anyone-can-spend outputs into one
/// anyone-can-spend output of `value`.
pub fn spend(inputs: &[OutPoint], value: Amount) -> Transaction {
    Transaction {
        version: Transaction::CURRENT_VERSION,
        inputs: inputs
            .iter()
            .map(|prevout| TxIn::new(*prevout, vec![]))
            .collect(),
        outputs: vec![TxOut::new(value, vec![script::OP_1; 60])],
        lock_time: 0,
    }
}

/// Assemble and mine a block at `height` on `prev`: canonical ordering for
/// the non-coinbase transactions, merkle commitment, and a nonce scan
/// against the regtest target.
pub fn mine_block(
    params: &ChainParams,
    prev: Hash256,
    height: u32,
    mut txs: Vec<Transaction>,
    tweak: u8,
) -> Block {
    txs.sort_by(|a, b| a.txid().cmp_numeric(&b.txid()));
    let mut all_txs = vec![coinbase(height, params.allowed_subsidy(height), tweak)];
    all_txs.extend(txs);

    let mut block = Block {
        header: BlockHeader {
            version: member_consensus::params::BASE_VERSION,
            prev_hash: prev,
            merkle_root: Hash256::ZERO,
            time: params.genesis_time + height * params.target_spacing_secs as u32
                + tweak as u32,
            bits: params.pow_limit_bits,
            nonce: 0,
        },
        txs: all_txs,
    };
    block.header.merkle_root = block.compute_merkle_root();

    while pow::check_proof_of_work(&block.header, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// First output of a block's coinbase, the usual funding source.
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.txs[0].txid(), 0)
}

/// The regtest subsidy, the face value the generators pay out.
pub fn subsidy() -> Amount {
    50 * COIN
}
