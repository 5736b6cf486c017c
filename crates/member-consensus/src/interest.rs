//! The interest accrual engine.
//!
//! Every unspent output earns compound interest of `1 + 2^-22` per block,
//! anchored at its creation height and saturating after one year of blocks.
//! The compounding factors are precomputed into a fixed-point table whose
//! textual dump is digest-checked at startup so that every node prices
//! outputs identically.

use crate::{Amount, COIN};
use num_bigint::BigUint;
use std::fmt::Write as _;

/// Blocks per day at the target spacing.
pub const ONEDAY: u32 = 1108;

/// Interest saturates after one year of blocks.
pub const MAX_PERIOD: u32 = ONEDAY * 365;

/// Expected MurmurHash3 digest (seed 1989, signed) of the canonical rate
/// table dump. A node whose table hashes differently must not come up.
pub const EXPECTED_DUMP_HASH: i32 = -753_007_581;

/// Fixed-point per-block compounding table over `[0, MAX_PERIOD]`.
///
/// `rates[0]` is the base scale `1 << 62`; each subsequent entry adds one
/// part in `2^22`. Entries stay below `2^63` over the full year, so `u64`
/// holds them exactly.
pub struct RateTable {
    rates: Vec<u64>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RateTable {
    /// Build the table.
    pub fn new() -> Self {
        let mut rates = Vec::with_capacity(MAX_PERIOD as usize + 1);
        rates.push(1u64 << 62);
        for i in 1..=MAX_PERIOD as usize {
            let prev = rates[i - 1];
            rates.push(prev + (prev >> 22));
        }
        Self { rates }
    }

    /// The raw compounding factor for the given number of periods.
    pub fn rate(&self, periods: u32) -> u64 {
        self.rates[periods.min(MAX_PERIOD) as usize]
    }

    /// Interest earned by `amount` over `periods` blocks: the widened
    /// product `amount * rates[periods]` divided by the base scale, minus
    /// the principal. The intermediate product does not fit in 64 bits, so
    /// it runs through a big-integer multiply and truncating divide.
    pub fn rate_for_amount(&self, periods: u32, amount: Amount) -> Amount {
        let amount256 = BigUint::from(amount as u64);
        let rate256 = BigUint::from(self.rate(periods));
        let base256 = BigUint::from(self.rates[0]);
        let scaled = (amount256 * rate256) / base256;
        let low64 = scaled.to_u64_digits().first().copied().unwrap_or(0);
        low64 as Amount - amount
    }

    /// Effective value of `value` created at `output_height` and valued at
    /// `valuation_height`.
    ///
    /// Negative heights or a valuation before creation return the face value
    /// unchanged; these states are unreachable under the chain invariants
    /// and the fallback keeps a malformed reorg from minting or burning.
    pub fn value_with_interest(
        &self,
        value: Amount,
        output_height: i64,
        valuation_height: i64,
    ) -> Amount {
        if output_height < 0 || valuation_height < 0 || valuation_height < output_height {
            return value;
        }
        let periods = (valuation_height - output_height).min(MAX_PERIOD as i64) as u32;
        value + self.rate_for_amount(periods, value)
    }

    /// The canonical textual dump the integrity digest is taken over.
    ///
    /// Format is fixed by the network: one `"{i} {rate:x}"` row per table
    /// entry starting at 1, then one `"rate: {i} {interest}"` row per period
    /// for a 100-coin principal.
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(24 * MAX_PERIOD as usize * 2);
        for i in 1..=MAX_PERIOD as usize {
            let _ = writeln!(out, "{} {:x}", i, self.rates[i]);
        }
        for i in 0..MAX_PERIOD {
            let _ = writeln!(out, "rate: {} {}", i, self.rate_for_amount(i, 100 * COIN));
        }
        out
    }

    /// MurmurHash3 (seed 1989) of the canonical dump, as a signed 32-bit
    /// value to match the network constant.
    pub fn dump_hash(&self) -> i32 {
        murmur3_32(1989, self.dump().as_bytes()) as i32
    }

    /// Whether the table matches the network's baked-in digest.
    pub fn verify_integrity(&self) -> bool {
        self.dump_hash() == EXPECTED_DUMP_HASH
    }
}

/// 32-bit MurmurHash3, the digest the rate-table integrity check is defined
/// over.
pub fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k1 = 0u32;
    for (i, &b) in tail.iter().enumerate() {
        k1 |= (b as u32) << (8 * i);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static RATES: Lazy<RateTable> = Lazy::new(RateTable::new);

    #[test]
    fn test_base_scale() {
        assert_eq!(RATES.rate(0), 1u64 << 62);
    }

    #[test]
    fn test_zero_periods_zero_interest() {
        assert_eq!(RATES.rate_for_amount(0, 100 * COIN), 0);
        assert_eq!(RATES.value_with_interest(100 * COIN, 5, 5), 100 * COIN);
    }

    #[test]
    fn test_interest_is_positive_after_one_day() {
        let interest = RATES.rate_for_amount(ONEDAY, 100 * COIN);
        assert!(interest > 0);
        assert_eq!(
            RATES.value_with_interest(100 * COIN, 0, ONEDAY as i64),
            100 * COIN + interest
        );
    }

    #[test]
    fn test_interest_saturates_at_max_period() {
        let at_max = RATES.value_with_interest(100 * COIN, 0, MAX_PERIOD as i64);
        let past_max = RATES.value_with_interest(100 * COIN, 0, MAX_PERIOD as i64 + 1);
        assert_eq!(at_max, past_max);
        assert_eq!(
            at_max,
            100 * COIN + RATES.rate_for_amount(MAX_PERIOD, 100 * COIN)
        );
    }

    #[test]
    fn test_yearly_rate_near_ten_percent() {
        // (1 + 2^-22)^404420 - 1 is a little over 10.1%.
        let interest = RATES.rate_for_amount(MAX_PERIOD, 100 * COIN);
        let basis_points = interest * 10_000 / (100 * COIN);
        assert!((1000..1030).contains(&basis_points), "{basis_points}");
    }

    #[test]
    fn test_interest_depends_only_on_elapsed_periods() {
        for (h0, h1) in [(0i64, 500i64), (1000, 1500), (400_000, 400_500)] {
            let a = RATES.value_with_interest(COIN, h0, h1) - COIN;
            let b = RATES.value_with_interest(COIN, 0, h1 - h0) - COIN;
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_malformed_heights_return_face_value() {
        assert_eq!(RATES.value_with_interest(COIN, 10, 5), COIN);
        assert_eq!(RATES.value_with_interest(COIN, -1, 5), COIN);
        assert_eq!(RATES.value_with_interest(COIN, 0, -3), COIN);
    }

    #[test]
    fn test_dump_row_format() {
        let dump = RATES.dump();
        let mut lines = dump.lines();
        let first = lines.next().unwrap();
        // Row 1: 2^62 plus 2^40, printed in hex.
        assert_eq!(first, format!("1 {:x}", (1u64 << 62) + (1u64 << 40)));
        assert!(dump.contains("\nrate: 0 0\n"));
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        // Published MurmurHash3_x86_32 vectors.
        assert_eq!(murmur3_32(0, b""), 0);
        assert_eq!(murmur3_32(1, b""), 0x514e_28b7);
        assert_eq!(murmur3_32(0, b"hello"), 0x248b_fa47);
        assert_eq!(murmur3_32(0x9747_b28c, b"Hello, world!"), 0x24884cba);
    }

    #[test]
    fn test_dump_digest_matches_network_constant() {
        assert_eq!(RATES.dump_hash(), EXPECTED_DUMP_HASH);
        assert!(RATES.verify_integrity());
    }
}
