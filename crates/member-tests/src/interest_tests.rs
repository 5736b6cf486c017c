//! Interest-engine scenarios: boundary valuations, translation invariance,
//! saturation, and the table digest.

use member_consensus::interest::{EXPECTED_DUMP_HASH, MAX_PERIOD, ONEDAY};
use member_consensus::{RateTable, COIN};
use once_cell::sync::Lazy;

static RATES: Lazy<RateTable> = Lazy::new(RateTable::new);

#[test]
fn test_valuation_boundaries_for_hundred_coins() {
    let principal = 100 * COIN;

    // At the creation height the effective value is the face value.
    assert_eq!(RATES.value_with_interest(principal, 0, 0), principal);

    // One day later interest is positive and exactly the table's answer.
    let one_day = RATES.value_with_interest(principal, 0, ONEDAY as i64);
    assert_eq!(
        one_day,
        principal + RATES.rate_for_amount(ONEDAY, principal)
    );
    assert!(one_day > principal);

    // The full period and one block beyond it value identically.
    let max = RATES.value_with_interest(principal, 0, MAX_PERIOD as i64);
    assert_eq!(
        max,
        principal + RATES.rate_for_amount(MAX_PERIOD, principal)
    );
    assert_eq!(
        RATES.value_with_interest(principal, 0, MAX_PERIOD as i64 + 1),
        max
    );
}

#[test]
fn test_effective_value_never_below_face() {
    for value in [0, 1, COIN, 100 * COIN, 1_000_000 * COIN] {
        for height in [0i64, 1, 100, ONEDAY as i64, MAX_PERIOD as i64] {
            let effective = RATES.value_with_interest(value, 0, height);
            assert!(effective >= value, "{value} at {height}");
            if height == 0 {
                assert_eq!(effective, value);
            }
        }
    }
}

#[test]
fn test_interest_translation_invariance() {
    // Interest depends only on elapsed periods, not absolute heights.
    for (h0, elapsed) in [(0i64, 1i64), (5_000, 1_108), (300_000, 50_000)] {
        let shifted = RATES.value_with_interest(7 * COIN, h0, h0 + elapsed) - 7 * COIN;
        let origin = RATES.value_with_interest(7 * COIN, 0, elapsed) - 7 * COIN;
        assert_eq!(shifted, origin);
    }
}

#[test]
fn test_interest_monotone_in_elapsed_time() {
    let mut last = 0;
    for elapsed in [0u32, 1, 10, ONEDAY, ONEDAY * 30, MAX_PERIOD] {
        let interest = RATES.rate_for_amount(elapsed, 100 * COIN);
        assert!(interest >= last, "interest not monotone at {elapsed}");
        last = interest;
    }
}

#[test]
fn test_rate_table_digest_matches_network() {
    assert_eq!(RATES.dump_hash(), EXPECTED_DUMP_HASH);
}
