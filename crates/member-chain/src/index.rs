//! The block-index arena.
//!
//! Every header that passed context-free validity lives in an arena indexed
//! by [`BlockIndexId`]; parent links are ids, so the graph has no cyclic
//! ownership and reverse walks never touch raw pointers. Cumulative work and
//! receipt order drive chain selection.

use crate::store::BlockLocation;
use crate::{ChainError, ChainResult};
use member_consensus::pow::work_for_bits;
use member_consensus::serialize::{write_u32, write_u64, SliceReader};
use member_consensus::{BlockHeader, Hash256};
use num_bigint::BigUint;
use std::collections::HashMap;

/// Arena handle for one block-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockIndexId(pub u32);

/// Status flags for an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus(u8);

impl BlockStatus {
    /// The block's full data is stored and connectable.
    pub const HAS_DATA: BlockStatus = BlockStatus(1 << 0);
    /// The block has been connected successfully at least once.
    pub const VALID: BlockStatus = BlockStatus(1 << 1);
    /// The block failed context-dependent validation; clearable at startup
    /// reconsideration.
    pub const FAILED: BlockStatus = BlockStatus(1 << 2);
    /// The block failed context-free validation; permanent.
    pub const FAILED_VALID: BlockStatus = BlockStatus(1 << 3);
    /// The block's serialized size exceeds the excessive threshold.
    pub const EXCESSIVE: BlockStatus = BlockStatus(1 << 4);

    /// Whether all of `flags` are set.
    pub fn has(&self, flags: BlockStatus) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Set flags.
    pub fn set(&mut self, flags: BlockStatus) {
        self.0 |= flags.0;
    }

    /// Clear flags.
    pub fn clear(&mut self, flags: BlockStatus) {
        self.0 &= !flags.0;
    }

    /// Whether either failure flag is set.
    pub fn is_failed(&self) -> bool {
        self.has(BlockStatus::FAILED) || self.has(BlockStatus::FAILED_VALID)
    }

    /// Raw bits, for persistence.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// From raw bits.
    pub fn from_bits(bits: u8) -> Self {
        BlockStatus(bits)
    }
}

/// One node of the header graph.
#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    /// Block hash.
    pub hash: Hash256,
    /// The header itself.
    pub header: BlockHeader,
    /// Height above genesis.
    pub height: u32,
    /// Cumulative work of the chain ending here.
    pub chain_work: BigUint,
    /// Status flags.
    pub status: BlockStatus,
    /// Parent entry, `None` only for genesis.
    pub parent: Option<BlockIndexId>,
    /// Receipt order; breaks cumulative-work ties (first seen wins).
    pub sequence: u64,
    /// Where the block body is stored, when it is.
    pub location: Option<BlockLocation>,
}

/// The arena of all known headers.
#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, BlockIndexId>,
    next_sequence: u64,
}

impl BlockIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry id by hash.
    pub fn get_id(&self, hash: &Hash256) -> Option<BlockIndexId> {
        self.by_hash.get(hash).copied()
    }

    /// Entry by id.
    pub fn entry(&self, id: BlockIndexId) -> &BlockIndexEntry {
        &self.entries[id.0 as usize]
    }

    /// Mutable entry by id.
    pub fn entry_mut(&mut self, id: BlockIndexId) -> &mut BlockIndexEntry {
        &mut self.entries[id.0 as usize]
    }

    /// Insert a header whose parent is already indexed (or which is the
    /// genesis). Returns the existing id when the hash is already present.
    pub fn insert_header(
        &mut self,
        header: BlockHeader,
        status: BlockStatus,
        location: Option<BlockLocation>,
    ) -> ChainResult<BlockIndexId> {
        let hash = header.hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }

        let (parent, height, parent_work) = if header.prev_hash.is_zero() {
            (None, 0, BigUint::default())
        } else {
            let parent_id = self
                .by_hash
                .get(&header.prev_hash)
                .copied()
                .ok_or(ChainError::UnknownParent(header.prev_hash))?;
            let parent_entry = self.entry(parent_id);
            (
                Some(parent_id),
                parent_entry.height + 1,
                parent_entry.chain_work.clone(),
            )
        };

        let id = BlockIndexId(self.entries.len() as u32);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(BlockIndexEntry {
            hash,
            header,
            height,
            chain_work: parent_work + work_for_bits(header.bits),
            status,
            parent,
            sequence,
            location,
        });
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// Ancestor of `id` at `height`, walking parent links.
    pub fn ancestor(&self, mut id: BlockIndexId, height: u32) -> Option<BlockIndexId> {
        loop {
            let entry = self.entry(id);
            if entry.height == height {
                return Some(id);
            }
            if entry.height < height {
                return None;
            }
            id = entry.parent?;
        }
    }

    /// Most recent common ancestor of two entries.
    pub fn fork_point(&self, a: BlockIndexId, b: BlockIndexId) -> Option<BlockIndexId> {
        let min_height = self.entry(a).height.min(self.entry(b).height);
        let mut a = self.ancestor(a, min_height)?;
        let mut b = self.ancestor(b, min_height)?;
        while a != b {
            a = self.entry(a).parent?;
            b = self.entry(b).parent?;
        }
        Some(a)
    }

    /// Timestamps of up to `span` nearest ancestors of (and including)
    /// `id`, oldest first. Feeds the median-time-past rule.
    pub fn ancestor_times(&self, id: BlockIndexId, span: usize) -> Vec<u32> {
        let mut times = Vec::with_capacity(span);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == span {
                break;
            }
            let entry = self.entry(current);
            times.push(entry.header.time);
            cursor = entry.parent;
        }
        times.reverse();
        times
    }

    /// Whether `ancestor` is on the chain ending at `tip`.
    pub fn is_ancestor(&self, ancestor: BlockIndexId, tip: BlockIndexId) -> bool {
        self.ancestor(tip, self.entry(ancestor).height) == Some(ancestor)
    }

    /// Iterate all entry ids.
    pub fn ids(&self) -> impl Iterator<Item = BlockIndexId> + '_ {
        (0..self.entries.len() as u32).map(BlockIndexId)
    }

    /// The path from genesis to `tip`, as ids.
    pub fn chain_to(&self, tip: BlockIndexId) -> Vec<BlockIndexId> {
        let mut path = Vec::with_capacity(self.entry(tip).height as usize + 1);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            path.push(id);
            cursor = self.entry(id).parent;
        }
        path.reverse();
        path
    }

    /// Serialize one entry for the block-index column family.
    pub fn serialize_entry(entry: &BlockIndexEntry) -> Vec<u8> {
        let mut out = Vec::with_capacity(140);
        out.extend_from_slice(&entry.header.serialize());
        write_u32(&mut out, entry.height);
        out.push(entry.status.bits());
        write_u64(&mut out, entry.sequence);
        let work_bytes = entry.chain_work.to_bytes_be();
        out.push(work_bytes.len() as u8);
        out.extend_from_slice(&work_bytes);
        match entry.location {
            Some(loc) => {
                out.push(1);
                write_u32(&mut out, loc.file);
                write_u64(&mut out, loc.offset);
            }
            None => out.push(0),
        }
        out
    }

    /// Deserialize one entry; parent linkage is rebuilt by the loader.
    pub fn deserialize_entry(bytes: &[u8]) -> ChainResult<(BlockHeader, u32, BlockStatus, u64, Option<BlockLocation>)> {
        let mut reader = SliceReader::new(bytes);
        let header_bytes = reader.read_bytes(80)?;
        let header = BlockHeader::deserialize(header_bytes)?;
        let height = reader.read_u32()?;
        let status = BlockStatus::from_bits(reader.read_u8()?);
        let sequence = reader.read_u64()?;
        let work_len = reader.read_u8()? as usize;
        let _work = reader.read_bytes(work_len)?; // recomputed from headers
        let location = match reader.read_u8()? {
            0 => None,
            _ => Some(BlockLocation {
                file: reader.read_u32()?,
                offset: reader.read_u64()?,
            }),
        };
        Ok((header, height, status, sequence, location))
    }
}
