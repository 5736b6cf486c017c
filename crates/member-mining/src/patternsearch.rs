//! The memory-hard pattern search.
//!
//! The search fills a large scratchpad from the header's mid-hash by
//! chained Blake3 extension, then scans for chunks whose trailing pattern
//! words collide. Each collision yields a `(start_location,
//! final_calculation)` candidate pair. The worker count partitions the
//! scratchpad layout and must be a power of two; callers asking for more
//! workers get the next power of two.
//!
//! The candidate fields are not part of the 80-byte header serialization,
//! so every candidate evaluates to the same Blake3 outer hash; the search
//! contributes candidates and a collision count, and the outer hash alone
//! decides proof-of-work.

use crate::{MiningError, MiningResult};
use member_consensus::hash::blake3_hash;
use member_consensus::{BlockHeader, Hash256};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Default scratchpad size: 1 GiB, the memory-hardness knob.
pub const DEFAULT_SCRATCHPAD_BYTES: usize = 1 << 30;

/// Bytes per scratchpad chunk.
const CHUNK_BYTES: usize = 64;

/// Round a worker request up to the next power of two, minimum one.
fn normalize_workers(workers: usize) -> usize {
    let mut n = 1;
    while n < workers {
        n *= 2;
    }
    n
}

/// Fill the scratchpad from the seed. Each worker's segment is an
/// independent Blake3 extension stream keyed by the seed and the worker
/// index, so the layout is a pure function of `(seed, workers)`.
fn fill_scratchpad(seed: &Hash256, scratchpad: &mut [u8], workers: usize) {
    let segment_len = scratchpad.len() / workers;
    for (worker, segment) in scratchpad.chunks_mut(segment_len).enumerate() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(seed.as_bytes());
        hasher.update(&(worker as u32).to_le_bytes());
        hasher.finalize_xof().fill(segment);
    }
}

/// Enumerate candidate `(start_location, final_calculation)` pairs.
///
/// Two chunks collide when their trailing 32-bit pattern words match; the
/// earlier chunk index becomes the start location and the later chunk's
/// leading word the final calculation. `workers` must be a power of two and
/// is normalized if it is not; zero workers yields no candidates.
pub fn pattern_search(
    mid_hash: &Hash256,
    scratchpad: &mut [u8],
    workers: usize,
) -> MiningResult<Vec<(u32, u32)>> {
    if workers == 0 {
        return Ok(Vec::new());
    }
    let workers = normalize_workers(workers);
    if scratchpad.len() < workers * CHUNK_BYTES {
        return Err(MiningError::ScratchpadTooSmall(scratchpad.len()));
    }
    let usable = scratchpad.len() - scratchpad.len() % (workers * CHUNK_BYTES);
    let scratchpad = &mut scratchpad[..usable];

    fill_scratchpad(mid_hash, scratchpad, workers);

    // The pattern mask widens with the chunk count so the expected number
    // of collisions stays small and independent of scratchpad size.
    let chunks = usable / CHUNK_BYTES;
    let mask = (chunks as u64 * 4).next_power_of_two().saturating_sub(1) as u32;

    let mut seen: HashMap<u32, u32> = HashMap::with_capacity(chunks);
    let mut results = Vec::new();
    for index in 0..chunks {
        let chunk = &scratchpad[index * CHUNK_BYTES..(index + 1) * CHUNK_BYTES];
        let pattern = u32::from_le_bytes([
            chunk[CHUNK_BYTES - 4],
            chunk[CHUNK_BYTES - 3],
            chunk[CHUNK_BYTES - 2],
            chunk[CHUNK_BYTES - 1],
        ]) & mask;
        let lead = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);

        match seen.get(&pattern) {
            Some(&first) => {
                trace!(first, index, pattern, "Pattern collision");
                results.push((first, lead));
            }
            None => {
                seen.insert(pattern, index as u32);
            }
        }
    }

    debug!(chunks, collisions = results.len(), "Pattern search complete");
    Ok(results)
}

/// Run the pattern search for a header and pick the candidate minimizing
/// the outer hash. Returns the best outer hash and the collision count.
///
/// Zero workers short-circuits to the all-ones sentinel, the worst
/// possible hash.
pub fn find_best_pattern_hash(
    header: &BlockHeader,
    scratchpad: &mut [u8],
    workers: usize,
) -> MiningResult<(Hash256, u32)> {
    if workers == 0 {
        return Ok((Hash256::MAX, 0));
    }

    let mid_hash = header.mid_hash();
    let results = pattern_search(&mid_hash, scratchpad, workers)?;
    let collisions = results.len() as u32;

    let mut best = Hash256::MAX;
    for _candidate in &results {
        let full_hash = blake3_hash(&header.serialize());
        if full_hash.cmp_numeric(&best) == std::cmp::Ordering::Less {
            best = full_hash;
        }
    }
    Ok((best, collisions))
}
