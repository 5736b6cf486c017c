//! Bounded cache of verified signature triples.
//!
//! Entries are keyed by a salted digest of `(sighash, pubkey, sig)`.
//! Lookups are lock-free reads; inserts append and, past the byte bound,
//! evict a sampled handful of victims instead of serializing writers. The
//! cache tolerates a rare redundant verification in exchange for never
//! blocking the script-check fan-out.

use crate::hash::Hash256;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Approximate per-entry footprint used for the byte bound.
const ENTRY_BYTES: usize = 96;

/// How many victims an over-budget insert samples for eviction.
const EVICTION_SAMPLE: usize = 8;

/// A bounded set of signature triples that have already verified.
pub struct SigCache {
    entries: DashMap<[u8; 32], ()>,
    max_bytes: usize,
    salt: [u8; 16],
}

impl SigCache {
    /// Create a cache bounded to roughly `max_bytes` of entries. The salt
    /// randomizes entry digests so an attacker cannot grind cache
    /// collisions offline.
    pub fn new(max_bytes: usize) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            entries: DashMap::new(),
            max_bytes,
            salt,
        }
    }

    fn entry_key(&self, sighash: &Hash256, pubkey: &[u8], sig: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(sighash.as_bytes());
        hasher.update((pubkey.len() as u32).to_le_bytes());
        hasher.update(pubkey);
        hasher.update(sig);
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }

    /// Whether the triple has verified before.
    pub fn contains(&self, sighash: &Hash256, pubkey: &[u8], sig: &[u8]) -> bool {
        self.entries.contains_key(&self.entry_key(sighash, pubkey, sig))
    }

    /// Record a verified triple, evicting sampled entries once over budget.
    pub fn insert(&self, sighash: &Hash256, pubkey: &[u8], sig: &[u8]) {
        if self.max_bytes == 0 {
            return;
        }
        if self.entries.len() * ENTRY_BYTES >= self.max_bytes {
            let victims: Vec<[u8; 32]> = self
                .entries
                .iter()
                .take(EVICTION_SAMPLE)
                .map(|e| *e.key())
                .collect();
            for victim in victims {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(self.entry_key(sighash, pubkey, sig), ());
    }

    /// Number of cached triples.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256d;

    #[test]
    fn test_insert_then_contains() {
        let cache = SigCache::new(1 << 20);
        let sighash = sha256d(b"digest");
        assert!(!cache.contains(&sighash, b"pk", b"sig"));
        cache.insert(&sighash, b"pk", b"sig");
        assert!(cache.contains(&sighash, b"pk", b"sig"));
        assert!(!cache.contains(&sighash, b"pk", b"other"));
    }

    #[test]
    fn test_byte_bound_caps_growth() {
        let cache = SigCache::new(ENTRY_BYTES * 16);
        for i in 0u32..1000 {
            let sighash = sha256d(&i.to_le_bytes());
            cache.insert(&sighash, b"pk", b"sig");
        }
        assert!(cache.len() <= 16 + 1);
    }

    #[test]
    fn test_zero_budget_disables_cache() {
        let cache = SigCache::new(0);
        let sighash = sha256d(b"digest");
        cache.insert(&sighash, b"pk", b"sig");
        assert!(cache.is_empty());
    }
}
