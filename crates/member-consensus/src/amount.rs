//! Monetary amounts in satoshi.

/// Amount in satoshi. Signed so that fee arithmetic can go negative before
/// being rejected.
pub type Amount = i64;

/// One coin in satoshi.
pub const COIN: Amount = 100_000_000;

/// No amount larger than this is valid. A sanity bound consulted by
/// consensus-critical validation, not the circulating supply.
pub const MAX_MONEY: Amount = 1_000_000_000 * COIN;

/// Whether a value lies in the valid monetary range.
pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
