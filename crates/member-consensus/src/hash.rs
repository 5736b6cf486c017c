//! Hash primitives: SHA-256d for txids and merkle nodes, Blake3 for the
//! outer block hash, HASH160 for script.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// A 256-bit hash stored in internal (little-endian) byte order, displayed
/// reversed as big-endian hex the way user-facing tools print txids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// The all-ones sentinel, numerically the worst possible block hash.
    pub const MAX: Hash256 = Hash256([0xff; 32]);

    /// Raw internal bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Numeric 256-bit comparison: most significant byte first, i.e. the
    /// bytes compared in reverse of the internal little-endian order. Used
    /// for canonical transaction ordering and best-hash selection.
    pub fn cmp_numeric(&self, other: &Hash256) -> Ordering {
        for i in (0..32).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    /// Parse from big-endian (display-order) hex.
    pub fn from_hex(s: &str) -> Option<Hash256> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, b) in bytes.iter().rev().enumerate() {
            out[i] = *b;
        }
        Some(Hash256(out))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().rev() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// One-shot Blake3 in the default hashing mode (empty personalization),
/// 32-byte output. This is the outer block hash.
pub fn blake3_hash(data: &[u8]) -> Hash256 {
    Hash256(*blake3::hash(data).as_bytes())
}

/// RIPEMD160(SHA256(x)), the script HASH160 primitive.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::Ripemd160;
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}
