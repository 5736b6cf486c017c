//! Property-based tests over the consensus primitives.

use member_consensus::interest::MAX_PERIOD;
use member_consensus::{pow, BlockHeader, Hash256, RateTable, MAX_MONEY};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use proptest::prelude::*;

static RATES: Lazy<RateTable> = Lazy::new(RateTable::new);

fn arb_hash() -> impl Strategy<Value = Hash256> {
    prop::array::uniform32(any::<u8>()).prop_map(Hash256)
}

fn arb_header() -> impl Strategy<Value = BlockHeader> {
    (
        any::<i32>(),
        arb_hash(),
        arb_hash(),
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
    )
        .prop_map(|(version, prev_hash, merkle_root, time, bits, nonce)| BlockHeader {
            version,
            prev_hash,
            merkle_root,
            time,
            bits,
            nonce,
        })
}

proptest! {
    /// Effective value is at least face value, with equality exactly when
    /// no time has passed.
    #[test]
    fn prop_interest_floor(
        value in 0i64..=MAX_MONEY,
        elapsed in 0i64..=(MAX_PERIOD as i64 + 1000),
    ) {
        let effective = RATES.value_with_interest(value, 0, elapsed);
        prop_assert!(effective >= value);
        if elapsed == 0 {
            prop_assert_eq!(effective, value);
        }
    }

    /// Interest is translation-invariant in absolute height.
    #[test]
    fn prop_interest_translation(
        value in 0i64..=MAX_MONEY,
        base in 0i64..=1_000_000i64,
        elapsed in 0i64..=(MAX_PERIOD as i64),
    ) {
        let shifted = RATES.value_with_interest(value, base, base + elapsed) - value;
        let origin = RATES.value_with_interest(value, 0, elapsed) - value;
        prop_assert_eq!(shifted, origin);
    }

    /// Valuation saturates at the maximum period.
    #[test]
    fn prop_interest_saturation(
        value in 0i64..=MAX_MONEY,
        beyond in 0i64..=1_000_000i64,
    ) {
        let capped = RATES.value_with_interest(value, 0, MAX_PERIOD as i64);
        let past = RATES.value_with_interest(value, 0, MAX_PERIOD as i64 + beyond);
        prop_assert_eq!(capped, past);
    }

    /// Header serialization round-trips and stays 80 bytes.
    #[test]
    fn prop_header_roundtrip(header in arb_header()) {
        let bytes = header.serialize();
        prop_assert_eq!(bytes.len(), 80);
        let decoded = BlockHeader::deserialize(&bytes).unwrap();
        prop_assert_eq!(header, decoded);
    }

    /// The outer hash is a pure function of the header bytes.
    #[test]
    fn prop_outer_hash_pure(header in arb_header()) {
        prop_assert_eq!(header.hash(), header.hash());
        let decoded = BlockHeader::deserialize(&header.serialize()).unwrap();
        prop_assert_eq!(header.hash(), decoded.hash());
    }

    /// Compact-target encoding round-trips through a normalizing decode.
    #[test]
    fn prop_compact_roundtrip(bits in 0x03_000001u32..=0x20_7fffffu32) {
        let decoded = pow::decode_compact(bits);
        prop_assume!(decoded.is_valid());
        let reencoded = pow::encode_compact(&decoded.target);
        let redecoded = pow::decode_compact(reencoded);
        prop_assert_eq!(decoded.target, redecoded.target);
    }

    /// Work is monotone: smaller targets contribute at least as much work.
    #[test]
    fn prop_work_monotone(exp_a in 4u32..=0x20, exp_b in 4u32..=0x20) {
        let bits_a = (exp_a << 24) | 0x00ffff;
        let bits_b = (exp_b << 24) | 0x00ffff;
        let (work_a, work_b) = (pow::work_for_bits(bits_a), pow::work_for_bits(bits_b));
        if exp_a <= exp_b {
            prop_assert!(work_a >= work_b);
        } else {
            prop_assert!(work_a <= work_b);
        }
    }

    /// Chain work equals the sum of per-block work.
    #[test]
    fn prop_chain_work_additive(bits in prop::collection::vec(0x1d00ffffu32..=0x207fffffu32, 1..16)) {
        let total: BigUint = bits.iter().map(|b| pow::work_for_bits(*b)).sum();
        let mut running = BigUint::default();
        for b in &bits {
            running += pow::work_for_bits(*b);
        }
        prop_assert_eq!(total, running);
    }
}
