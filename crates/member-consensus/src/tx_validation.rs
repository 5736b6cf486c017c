//! Transaction validation rules.
//!
//! Structural checks are context-free; input checks value each spent coin
//! through the interest table at the connecting height and enforce
//! conservation of effective value rather than face value.

use crate::interest::RateTable;
use crate::params::{COINBASE_MATURITY, MIN_TX_SIZE};
use crate::tx::{Coin, Transaction};
use crate::{money_range, Amount, ValidationError, ValidationResult, MAX_MONEY};
use std::collections::HashSet;

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> ValidationResult<()> {
    if tx.inputs.is_empty() {
        return Err(ValidationError::bad_structure("transaction has no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::bad_structure("transaction has no outputs"));
    }

    let mut value_out: Amount = 0;
    for output in &tx.outputs {
        if !money_range(output.value) {
            return Err(ValidationError::bad_structure(format!(
                "output value {} out of range",
                output.value
            )));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(ValidationError::bad_structure(
                "total output value out of range",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ValidationError::bad_structure(format!(
                "duplicate input {}",
                input.prevout
            )));
        }
    }

    if tx.is_coinbase() {
        let sig_len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&sig_len) {
            return Err(ValidationError::bad_structure(format!(
                "coinbase scriptSig length {} outside [2, 100]",
                sig_len
            )));
        }
    } else {
        if tx.inputs.iter().any(|input| input.prevout.is_null()) {
            return Err(ValidationError::bad_structure(
                "non-coinbase transaction has a null input",
            ));
        }
        if tx.serialized_size() < MIN_TX_SIZE {
            return Err(ValidationError::bad_structure(format!(
                "transaction below minimum size of {} bytes",
                MIN_TX_SIZE
            )));
        }
    }

    Ok(())
}

/// Check a non-coinbase transaction's inputs against the coins it spends,
/// all fetched in input order. Enforces coinbase maturity and conservation
/// of effective value at the connecting height, and returns the fee: the
/// spread between effective input value and face output value.
pub fn check_tx_inputs(
    tx: &Transaction,
    spent_coins: &[Coin],
    height: u32,
    rates: &RateTable,
) -> ValidationResult<Amount> {
    debug_assert_eq!(tx.inputs.len(), spent_coins.len());

    let mut effective_in: Amount = 0;
    for (input, coin) in tx.inputs.iter().zip(spent_coins) {
        if coin.is_coinbase && height.saturating_sub(coin.height) < COINBASE_MATURITY {
            return Err(ValidationError::bad_conservation(format!(
                "premature spend of coinbase {} at depth {}",
                input.prevout,
                height.saturating_sub(coin.height)
            )));
        }

        let value = coin.effective_value(rates, height);
        if !money_range(coin.output.value) || value < coin.output.value {
            return Err(ValidationError::bad_conservation(format!(
                "input {} has invalid value",
                input.prevout
            )));
        }
        effective_in += value;
        if effective_in > MAX_MONEY + (MAX_MONEY / 8) {
            // Effective value may exceed face MAX_MONEY by at most one
            // year's interest; anything beyond is corrupt.
            return Err(ValidationError::bad_conservation(
                "effective input sum out of range",
            ));
        }
    }

    let face_out = tx.value_out();
    if effective_in < face_out {
        return Err(ValidationError::bad_conservation(format!(
            "effective inputs {} below outputs {}",
            effective_in, face_out
        )));
    }

    Ok(effective_in - face_out)
}
