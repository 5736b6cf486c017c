//! Block-level validation rules.
//!
//! Context-free structure checks live here together with the header checks
//! that need only the ancestor headers (median-time-past, future bound,
//! retarget bits, proof-of-work). Applying a block against the UTXO set is
//! the state layer's job.

use crate::block::Block;
use crate::chain_params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::script::count_sigops;
use crate::tx_validation::check_transaction;
use crate::{params, ValidationError, ValidationResult};
use std::collections::HashSet;

/// Number of ancestor timestamps the median-time-past is taken over.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum tolerated clock skew for the future-timestamp bound, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Context-free block checks: structure, size, merkle commitment, per-tx
/// rules, and the signature-operation budgets.
pub fn check_block(block: &Block, params_: &ChainParams) -> ValidationResult<()> {
    if block.txs.is_empty() {
        return Err(ValidationError::bad_structure("block has no transactions"));
    }
    if !block.txs[0].is_coinbase() {
        return Err(ValidationError::bad_structure(
            "first transaction is not a coinbase",
        ));
    }
    if block.txs.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(ValidationError::bad_structure("duplicate coinbase"));
    }

    let size = block.serialized_size() as u64;
    if size > params_.excessive_block_size {
        return Err(ValidationError::bad_structure(format!(
            "block size {} exceeds excessive limit {}",
            size, params_.excessive_block_size
        )));
    }

    let mut txids = HashSet::with_capacity(block.txs.len());
    for tx in &block.txs {
        if !txids.insert(tx.txid()) {
            return Err(ValidationError::bad_structure("duplicate txid in block"));
        }
        check_transaction(tx)?;
    }

    if block.compute_merkle_root() != block.header.merkle_root {
        return Err(ValidationError::bad_structure("merkle root mismatch"));
    }

    let mut sigops = 0u64;
    for tx in &block.txs {
        for input in &tx.inputs {
            sigops += count_sigops(&input.script_sig);
        }
        for output in &tx.outputs {
            sigops += count_sigops(&output.script_pubkey);
        }
    }
    if sigops > params::max_block_sigops(size) {
        return Err(ValidationError::bad_structure(format!(
            "{} sigops exceeds block budget",
            sigops
        )));
    }

    Ok(())
}

/// Enforce the block's transaction ordering: lexicographic by txid once
/// canonical ordering is active, topological before it.
pub fn check_tx_ordering(block: &Block, canonical: bool) -> ValidationResult<()> {
    if canonical {
        for pair in block.txs[1..].windows(2) {
            if pair[0].txid().cmp_numeric(&pair[1].txid()) != std::cmp::Ordering::Less {
                return Err(ValidationError::bad_structure(
                    "transactions violate canonical order",
                ));
            }
        }
    } else {
        let mut seen = HashSet::with_capacity(block.txs.len());
        for tx in &block.txs {
            seen.insert(tx.txid());
        }
        let mut produced: HashSet<_> = HashSet::with_capacity(block.txs.len());
        for tx in &block.txs {
            for input in &tx.inputs {
                if seen.contains(&input.prevout.txid) && !produced.contains(&input.prevout.txid) {
                    return Err(ValidationError::bad_structure(
                        "transaction spends a later in-block output",
                    ));
                }
            }
            produced.insert(tx.txid());
        }
    }
    Ok(())
}

/// Header checks that need the ancestor view: previous-block linkage is the
/// caller's to establish; here the timestamp must exceed the median of the
/// last eleven ancestors and stay within two hours of adjusted time, `bits`
/// must match the retarget rule, and the proof-of-work must hold.
///
/// `ancestor_times` are the timestamps of up to [`MEDIAN_TIME_SPAN`] nearest
/// ancestors, newest last. `required_bits` comes from the chain's retarget
/// computation over the index.
pub fn contextual_check_header(
    header: &crate::block::BlockHeader,
    ancestor_times: &[u32],
    required_bits: u32,
    now: u64,
    params_: &ChainParams,
) -> ValidationResult<()> {
    if header.bits != required_bits {
        return Err(ValidationError::bad_pow(format!(
            "bits {:08x} does not match required {:08x}",
            header.bits, required_bits
        )));
    }

    if let Some(mtp) = median_time_past(ancestor_times) {
        if header.time <= mtp {
            return Err(ValidationError::bad_structure(format!(
                "timestamp {} not after median time past {}",
                header.time, mtp
            )));
        }
    }

    if (header.time as u64) > now + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationError::bad_structure(format!(
            "timestamp {} too far in the future",
            header.time
        )));
    }

    check_proof_of_work(header, params_)
}

/// Median of the given ancestor timestamps (newest last); `None` when there
/// are no ancestors (the genesis case).
pub fn median_time_past(ancestor_times: &[u32]) -> Option<u32> {
    if ancestor_times.is_empty() {
        return None;
    }
    let mut times: Vec<u32> = ancestor_times
        .iter()
        .rev()
        .take(MEDIAN_TIME_SPAN)
        .copied()
        .collect();
    times.sort_unstable();
    Some(times[times.len() / 2])
}
