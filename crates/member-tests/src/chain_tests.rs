//! Chain-level scenarios: maturity, reorg invariance, and startup
//! reconsideration.

use crate::generators::*;
use crate::harness::TestChain;
use member_chain::{BlockStatus, ChainError};
use member_consensus::{ValidationKind, COIN};

#[test]
fn test_coinbase_maturity_boundary() {
    let chain = TestChain::new();

    // Coinbase minted at height 1; mine on top so spends become possible.
    let funding = chain.mine_and_process(Vec::new(), 0);
    let funding_op = coinbase_outpoint(&funding);

    // 18 more blocks: the tip is 19, a spend at height 20 is one short of
    // the 20-block maturity window.
    chain.mine_empty(18, 0);
    assert_eq!(chain.tip().height, 19);

    let premature = spend(&[funding_op], subsidy());
    let tip = chain.tip();
    let block = mine_block(
        chain.chain().params(),
        tip.hash,
        tip.height + 1,
        vec![premature.clone()],
        0,
    );
    chain.chain().accept_block(&block, TEST_NOW).unwrap();
    chain.chain().activate_best_chain().unwrap();
    // The spend at depth 19 fails; the block is marked, the tip stays.
    assert_eq!(chain.tip().hash, tip.hash);
    let status = chain.chain().block_status(&block.hash()).unwrap();
    assert!(status.has(BlockStatus::FAILED));

    // One block later the coinbase is 20 deep and spendable.
    chain.mine_and_process(Vec::new(), 1);
    let spendable = chain.mine_and_process(vec![premature], 1);
    assert_eq!(chain.tip().hash, spendable.hash());
}

#[test]
fn test_reorg_matches_fresh_sync() {
    // Build chains A = G -> a1 -> a2 and B = G -> b1 -> b2 -> b3 once, then
    // feed them to two nodes in different orders.
    let builder = TestChain::new();
    let params = regtest_params();
    let genesis = builder.tip().hash;

    let a1 = mine_block(&params, genesis, 1, Vec::new(), 1);
    let a2 = mine_block(&params, a1.hash(), 2, Vec::new(), 1);
    let b1 = mine_block(&params, genesis, 1, Vec::new(), 2);
    let b2 = mine_block(&params, b1.hash(), 2, Vec::new(), 2);
    let b3 = mine_block(&params, b2.hash(), 3, Vec::new(), 2);

    // Node one: A first, then B. The longer chain wins.
    let node_one = TestChain::new();
    for block in [&a1, &a2, &b1, &b2, &b3] {
        node_one.chain().accept_block(block, TEST_NOW).unwrap();
        node_one.chain().activate_best_chain().unwrap();
    }
    assert_eq!(node_one.tip().hash, b3.hash());
    assert_eq!(node_one.tip().height, 3);

    // Node two: only B.
    let node_two = TestChain::new();
    for block in [&b1, &b2, &b3] {
        node_two.chain().accept_block(block, TEST_NOW).unwrap();
        node_two.chain().activate_best_chain().unwrap();
    }
    assert_eq!(node_two.tip().hash, b3.hash());

    // The reorged UTXO set is identical to the fresh sync.
    assert_eq!(node_one.utxo_set(), node_two.utxo_set());
}

#[test]
fn test_startup_reconsideration_restores_best_tip() {
    let chain = TestChain::new();
    chain.mine_empty(3, 0);
    let best = chain.tip();
    assert_eq!(best.height, 3);

    // Mark the true best tip failed; the tip retreats.
    chain.chain().invalidate_block(&best.hash).unwrap();
    assert_eq!(chain.tip().height, 2);
    chain.chain().flush().unwrap();

    // On restart the context-dependent flag clears and the best-work chain
    // returns.
    let chain = chain.restart();
    assert_eq!(chain.tip().hash, best.hash);
    assert_eq!(chain.tip().height, 3);
    let status = chain.chain().block_status(&best.hash).unwrap();
    assert!(!status.is_failed());
}

#[test]
fn test_interest_spread_is_fee() {
    let chain = TestChain::new();
    let funding = chain.mine_and_process(Vec::new(), 0);
    let funding_op = coinbase_outpoint(&funding);
    chain.mine_empty(20, 0);

    // Spending at height 22, the coin is 21 blocks old; claim face value
    // plus half the accrued interest and leave the rest as fee.
    let rates = member_consensus::RateTable::new();
    let interest = rates.rate_for_amount(21, subsidy());
    assert!(interest > 0);

    let tx = spend(&[funding_op], subsidy() + interest / 2);
    let block = chain.mine_and_process(vec![tx.clone()], 0);
    assert_eq!(chain.tip().hash, block.hash());

    // Claiming more than face value plus full interest must fail.
    let tip = chain.tip();
    let op = member_consensus::OutPoint::new(tx.txid(), 0);
    let over_interest = rates.rate_for_amount(1, subsidy() + interest / 2);
    let greedy = spend(&[op], subsidy() + interest / 2 + over_interest + COIN);
    let bad_block = mine_block(
        chain.chain().params(),
        tip.hash,
        tip.height + 1,
        vec![greedy],
        0,
    );
    chain.chain().accept_block(&bad_block, TEST_NOW).unwrap();
    chain.chain().activate_best_chain().unwrap();
    assert_eq!(chain.tip().hash, tip.hash);
}

#[test]
fn test_previously_rejected_block_stays_rejected() {
    let chain = TestChain::new();
    let tip = chain.tip();
    let mut bad = mine_block(chain.chain().params(), tip.hash, 1, Vec::new(), 0);
    // Corrupt the merkle commitment: a context-free, permanent failure.
    bad.header.merkle_root = member_consensus::hash::sha256d(b"bogus");
    while member_consensus::check_proof_of_work(&bad.header, chain.chain().params()).is_err() {
        bad.header.nonce += 1;
    }

    let err = chain.chain().accept_block(&bad, TEST_NOW).unwrap_err();
    match err {
        ChainError::Validation(v) => assert_eq!(v.kind, ValidationKind::BadStructure),
        other => panic!("unexpected error: {other}"),
    }
    // Resubmission is refused without revalidating.
    assert!(chain.chain().accept_block(&bad, TEST_NOW).is_err());
}
