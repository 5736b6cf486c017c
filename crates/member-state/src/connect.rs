//! Block connection and disconnection against a coins cache.
//!
//! Connecting applies the full §"block acceptance" rule set: structure,
//! ordering, per-input valuation through the interest table, script
//! verification with the signature cache, the coinbase allowance, and undo
//! recording. Disconnecting is the exact inverse driven by the undo data.

use crate::coins::CoinsCache;
use crate::undo::{BlockUndo, TxUndo};
use crate::StateError;
use member_consensus::script::{verify_script, TransactionSignatureChecker};
use member_consensus::{
    block_validation, check_tx_inputs, Amount, Block, CancelToken, ChainParams, Coin, OutPoint,
    RateTable, SigCache, ValidationError, ValidationKind, ValidationResult,
};
use tracing::{debug, instrument, warn};

/// Everything block connection needs besides the block and the cache. Built
/// by the validation coordinator per task; tests construct their own with an
/// empty signature cache.
pub struct ConnectContext<'a> {
    /// Chain parameters.
    pub params: &'a ChainParams,
    /// The interest table.
    pub rates: &'a RateTable,
    /// Shared signature cache.
    pub sig_cache: &'a SigCache,
    /// Cooperative cancellation flag, polled between transactions, per
    /// signature check, and on coin lookups.
    pub cancel: &'a CancelToken,
    /// Execute input scripts. Disabled only by test harnesses that build
    /// blocks without real signatures.
    pub check_scripts: bool,
}

/// Outcome of a successful connect.
#[derive(Debug)]
pub struct ConnectResult {
    /// Undo data for a later disconnect.
    pub undo: BlockUndo,
    /// Total fees collected from non-coinbase transactions.
    pub fees: Amount,
}

fn io_error(err: StateError) -> ValidationError {
    ValidationError::new(ValidationKind::IoFailure, err.to_string())
}

fn poll_cancel(cancel: &CancelToken) -> ValidationResult<()> {
    if cancel.is_canceled() {
        return Err(ValidationError::canceled());
    }
    Ok(())
}

/// Connect `block` at `height` against the cache.
///
/// On success every input coin is spent, every output is added with
/// `height` as its creation height, the cache's best-block marker points at
/// the block, and the returned undo data can reverse all of it. On any
/// error the cache may hold partial mutations; callers validate into a
/// private fork and discard it on failure.
#[instrument(skip_all, fields(height, hash = %block.hash()))]
pub fn connect_block(
    block: &Block,
    height: u32,
    cache: &mut CoinsCache,
    ctx: &ConnectContext<'_>,
) -> ValidationResult<ConnectResult> {
    block_validation::check_block(block, ctx.params)?;
    block_validation::check_tx_ordering(block, ctx.params.canonical_order_active(height))?;

    // The coinbase must commit to the height it is being connected at.
    let claimed = block
        .coinbase_height()
        .map_err(|e| ValidationError::bad_structure(e.to_string()))?;
    if claimed != height {
        return Err(ValidationError::bad_structure(format!(
            "coinbase claims height {} but connecting at {}",
            claimed, height
        )));
    }

    let flags = ctx.params.script_flags(height);
    let sigchecks_budget =
        member_consensus::params::max_block_sigchecks(ctx.params.excessive_block_size);
    let mut undo = BlockUndo::default();
    let mut fee_total: Amount = 0;
    let mut sigchecks: u64 = 0;

    for tx in &block.txs {
        poll_cancel(ctx.cancel)?;

        if tx.is_coinbase() {
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(tx.txid(), index as u32);
                cache
                    .add_coin(outpoint, Coin::new(output.clone(), height, true), false)
                    .map_err(overwrite_or_io)?;
            }
            continue;
        }

        // Fetch every input's coin in canonical input order so in-block
        // double-spends surface as missing inputs.
        let mut spent_coins = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            poll_cancel(ctx.cancel)?;
            let coin = cache.fetch_coin(&input.prevout).map_err(io_error)?;
            match coin {
                Some(coin) => spent_coins.push(coin),
                None => {
                    return Err(ValidationError::missing_inputs(format!(
                        "input {} not found for tx {}",
                        input.prevout,
                        tx.txid()
                    )));
                }
            }
        }

        let fee = check_tx_inputs(tx, &spent_coins, height, ctx.rates)?;
        fee_total += fee;

        // Executed signature checks are bounded per block, scaled from the
        // excessive-block size.
        for coin in &spent_coins {
            sigchecks += member_consensus::script::count_sigops(&coin.output.script_pubkey);
        }
        if sigchecks > sigchecks_budget {
            return Err(ValidationError::bad_structure(format!(
                "{} sigchecks exceeds block budget {}",
                sigchecks, sigchecks_budget
            )));
        }

        if ctx.check_scripts {
            for (index, (input, coin)) in tx.inputs.iter().zip(&spent_coins).enumerate() {
                let checker = TransactionSignatureChecker::new(
                    tx,
                    index,
                    Some(ctx.sig_cache),
                    Some(ctx.cancel),
                );
                verify_script(
                    &input.script_sig,
                    &coin.output.script_pubkey,
                    flags,
                    &checker,
                )
                .map_err(|e| match e {
                    member_consensus::script::ScriptError::Canceled => {
                        ValidationError::canceled()
                    }
                    other => ValidationError::bad_script(format!(
                        "input {} of tx {}: {}",
                        index,
                        tx.txid(),
                        other
                    )),
                })?;
            }
        }

        for input in &tx.inputs {
            let spent = cache.spend_coin(&input.prevout).map_err(io_error)?;
            debug_assert!(spent.is_some(), "inputs were fetched above");
        }
        undo.tx_undos.push(TxUndo { spent_coins });

        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx.txid(), index as u32);
            cache
                .add_coin(outpoint, Coin::new(output.clone(), height, false), false)
                .map_err(overwrite_or_io)?;
        }
    }

    // The coinbase may claim at most the allowed subsidy plus collected
    // fees; a deficit is burned.
    let coinbase_out = block.txs[0].value_out();
    let allowed = ctx.params.allowed_subsidy(height) + fee_total;
    if coinbase_out > allowed {
        return Err(ValidationError::bad_conservation(format!(
            "coinbase claims {} but only {} allowed",
            coinbase_out, allowed
        )));
    }

    cache.set_best_block(block.hash());
    debug!(fees = fee_total, txs = block.txs.len(), "Block connected");

    Ok(ConnectResult {
        undo,
        fees: fee_total,
    })
}

fn overwrite_or_io(err: StateError) -> ValidationError {
    match err {
        StateError::CoinExists(context) => ValidationError::bad_structure(format!(
            "output already unspent at {}",
            context
        )),
        other => io_error(other),
    }
}

/// Disconnect `block` from the cache using its undo data, restoring every
/// spent coin and removing every output the block created. The best-block
/// marker moves back to the parent.
#[instrument(skip_all, fields(hash = %block.hash()))]
pub fn disconnect_block(
    block: &Block,
    undo: &BlockUndo,
    cache: &mut CoinsCache,
) -> ValidationResult<()> {
    let non_coinbase = block.txs.len().saturating_sub(1);
    if undo.tx_undos.len() != non_coinbase {
        return Err(ValidationError::new(
            ValidationKind::IoFailure,
            format!(
                "undo has {} records for {} non-coinbase txs",
                undo.tx_undos.len(),
                non_coinbase
            ),
        ));
    }

    // Walk transactions in reverse so within-block chains unwind cleanly.
    for (tx_pos, tx) in block.txs.iter().enumerate().rev() {
        for index in 0..tx.outputs.len() {
            let outpoint = OutPoint::new(tx.txid(), index as u32);
            let removed = cache.spend_coin(&outpoint).map_err(io_error)?;
            if removed.is_none() {
                warn!(%outpoint, "Output missing while disconnecting; state was already partially unwound");
            }
        }

        if tx.is_coinbase() {
            continue;
        }
        let tx_undo = &undo.tx_undos[tx_pos - 1];
        if tx_undo.spent_coins.len() != tx.inputs.len() {
            return Err(ValidationError::new(
                ValidationKind::IoFailure,
                format!("undo record mismatch for tx {}", tx.txid()),
            ));
        }
        for (input, coin) in tx.inputs.iter().zip(&tx_undo.spent_coins) {
            cache
                .add_coin(input.prevout, coin.clone(), true)
                .map_err(io_error)?;
        }
    }

    cache.set_best_block(block.header.prev_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{CoinsDb, CoinsView, CoinsViewErrorCatcher};
    use member_consensus::chain_params::Network;
    use member_consensus::hash::sha256d;
    use member_consensus::script;
    use member_consensus::{BlockHeader, Hash256, Transaction, TxIn, TxOut, COIN};
    use member_storage::{Database, Storage};
    use once_cell::sync::Lazy;
    use std::sync::Arc;
    use tempfile::TempDir;

    static RATES: Lazy<RateTable> = Lazy::new(RateTable::new);

    struct Harness {
        params: ChainParams,
        sig_cache: SigCache,
        cancel: CancelToken,
        _tmp: TempDir,
        db: CoinsDb,
        catcher: Arc<CoinsViewErrorCatcher>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let storage: Arc<dyn Storage> = Arc::new(Database::open(tmp.path()).unwrap());
            Self {
                params: ChainParams::for_network(Network::Regtest),
                sig_cache: SigCache::new(1 << 20),
                cancel: CancelToken::new(),
                _tmp: tmp,
                db: CoinsDb::new(Arc::clone(&storage)),
                catcher: Arc::new(CoinsViewErrorCatcher::new(CoinsDb::new(storage))),
            }
        }

        fn ctx(&self) -> ConnectContext<'_> {
            ConnectContext {
                params: &self.params,
                rates: &RATES,
                sig_cache: &self.sig_cache,
                cancel: &self.cancel,
                check_scripts: true,
            }
        }

        fn cache(&self) -> CoinsCache {
            CoinsCache::new(Arc::clone(&self.catcher) as Arc<dyn CoinsView>)
        }
    }

    fn coinbase_at(height: u32, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(
                OutPoint::null(),
                script::coinbase_height_script(height),
            )],
            outputs: vec![TxOut::new(value, vec![script::OP_1])],
            lock_time: 0,
        }
    }

    fn block_at(height: u32, prev: Hash256, txs: Vec<Transaction>, bits: u32) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: member_consensus::params::BASE_VERSION,
                prev_hash: prev,
                merkle_root: Hash256::ZERO,
                time: 1_700_000_000 + height,
                bits,
                nonce: 0,
            },
            txs,
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    fn anyone_can_spend(prev: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(prev, vec![])],
            outputs: vec![TxOut::new(value, vec![script::OP_1; 60])],
            lock_time: 0,
        }
    }

    #[test]
    fn test_connect_creates_coins_and_sets_tip() {
        let h = Harness::new();
        let mut cache = h.cache();
        let block = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(1, 50 * COIN)],
            h.params.pow_limit_bits,
        );

        let result = connect_block(&block, 1, &mut cache, &h.ctx()).unwrap();
        assert_eq!(result.fees, 0);
        assert!(result.undo.tx_undos.is_empty());

        let coinbase_op = OutPoint::new(block.txs[0].txid(), 0);
        let coin = cache.fetch_coin(&coinbase_op).unwrap().unwrap();
        assert!(coin.is_coinbase);
        assert_eq!(coin.height, 1);
        assert_eq!(cache.cached_best_block().unwrap(), Some(block.hash()));
    }

    #[test]
    fn test_connect_rejects_wrong_coinbase_height() {
        let h = Harness::new();
        let mut cache = h.cache();
        let block = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(2, 50 * COIN)],
            h.params.pow_limit_bits,
        );
        let err = connect_block(&block, 1, &mut cache, &h.ctx()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::BadStructure);
    }

    #[test]
    fn test_connect_rejects_missing_input() {
        let h = Harness::new();
        let mut cache = h.cache();
        let spend = anyone_can_spend(OutPoint::new(sha256d(b"nowhere"), 0), COIN);
        let block = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(1, 50 * COIN), spend],
            h.params.pow_limit_bits,
        );
        let err = connect_block(&block, 1, &mut cache, &h.ctx()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::MissingInputs);
    }

    #[test]
    fn test_connect_rejects_greedy_coinbase() {
        let h = Harness::new();
        let mut cache = h.cache();
        let block = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(1, 51 * COIN)],
            h.params.pow_limit_bits,
        );
        let err = connect_block(&block, 1, &mut cache, &h.ctx()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::BadConservation);
    }

    #[test]
    fn test_connect_disconnect_roundtrip() {
        let h = Harness::new();

        // Block 1 funds an anyone-can-spend output.
        let mut cache = h.cache();
        let b1 = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(1, 50 * COIN)],
            h.params.pow_limit_bits,
        );
        connect_block(&b1, 1, &mut cache, &h.ctx()).unwrap();
        cache.flush(&h.db).unwrap();

        // Block at maturity spends it.
        let funding = OutPoint::new(b1.txs[0].txid(), 0);
        let spend = anyone_can_spend(funding, 50 * COIN);
        let spend_op = OutPoint::new(spend.txid(), 0);
        let b21 = block_at(
            21,
            b1.hash(),
            vec![coinbase_at(21, 50 * COIN), spend],
            h.params.pow_limit_bits,
        );

        let mut cache = h.cache();
        let before: Vec<_> = [funding, spend_op]
            .iter()
            .map(|op| cache.fetch_coin(op).unwrap())
            .collect();
        let result = connect_block(&b21, 21, &mut cache, &h.ctx()).unwrap();
        assert!(cache.fetch_coin(&funding).unwrap().is_none());
        assert!(cache.fetch_coin(&spend_op).unwrap().is_some());

        disconnect_block(&b21, &result.undo, &mut cache).unwrap();
        let after: Vec<_> = [funding, spend_op]
            .iter()
            .map(|op| cache.fetch_coin(op).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(cache.cached_best_block().unwrap(), Some(b1.hash()));
    }

    #[test]
    fn test_connect_enforces_maturity() {
        let h = Harness::new();
        let mut cache = h.cache();
        let b1 = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(1, 50 * COIN)],
            h.params.pow_limit_bits,
        );
        connect_block(&b1, 1, &mut cache, &h.ctx()).unwrap();

        let spend = anyone_can_spend(OutPoint::new(b1.txs[0].txid(), 0), 50 * COIN);
        let b2 = block_at(
            2,
            b1.hash(),
            vec![coinbase_at(2, 50 * COIN), spend],
            h.params.pow_limit_bits,
        );
        let err = connect_block(&b2, 2, &mut cache, &h.ctx()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::BadConservation);
    }

    #[test]
    fn test_canceled_connect_reports_cancellation() {
        let h = Harness::new();
        let mut cache = h.cache();
        h.cancel.cancel();
        let block = block_at(
            1,
            sha256d(b"genesis"),
            vec![coinbase_at(1, 50 * COIN)],
            h.params.pow_limit_bits,
        );
        let err = connect_block(&block, 1, &mut cache, &h.ctx()).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Canceled);
    }
}
