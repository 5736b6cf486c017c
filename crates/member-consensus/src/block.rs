//! Block and block header primitives.

use crate::hash::{blake3_hash, sha256d, Hash256};
use crate::serialize::{write_compact_size, write_i32, write_u32, SliceReader};
use crate::tx::Transaction;
use crate::{ConsensusError, ConsensusResult};
use std::fmt;

/// An 80-byte block header.
///
/// The serialization order is consensus-critical: the Blake3 outer hash and
/// the SHA-256d mid-hash are both taken over exactly these bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    /// Version bits.
    pub version: i32,
    /// Hash of the parent block.
    pub prev_hash: Hash256,
    /// Merkle root over the block's txids.
    pub merkle_root: Hash256,
    /// Unix timestamp.
    pub time: u32,
    /// Compact encoding of the proof-of-work target.
    pub bits: u32,
    /// Nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Canonical 80-byte little-endian serialization.
    pub fn serialize(&self) -> [u8; 80] {
        let mut out = Vec::with_capacity(80);
        write_i32(&mut out, self.version);
        out.extend_from_slice(self.prev_hash.as_bytes());
        out.extend_from_slice(self.merkle_root.as_bytes());
        write_u32(&mut out, self.time);
        write_u32(&mut out, self.bits);
        write_u32(&mut out, self.nonce);
        let mut bytes = [0u8; 80];
        bytes.copy_from_slice(&out);
        bytes
    }

    /// The block hash: one-shot Blake3 over the 80-byte serialization.
    pub fn hash(&self) -> Hash256 {
        blake3_hash(&self.serialize())
    }

    /// The mid-hash: SHA-256d over the same 80 bytes. Seeds the miner-side
    /// pattern search; not consulted during verification.
    pub fn mid_hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// Decode from a reader.
    pub fn decode(reader: &mut SliceReader<'_>) -> ConsensusResult<Self> {
        let version = reader.read_i32()?;
        let prev_hash = Hash256(reader.read_array_32()?);
        let merkle_root = Hash256(reader.read_array_32()?);
        let time = reader.read_u32()?;
        let bits = reader.read_u32()?;
        let nonce = reader.read_u32()?;
        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

    /// Deserialize from exactly 80 bytes.
    pub fn deserialize(bytes: &[u8]) -> ConsensusResult<Self> {
        if bytes.len() != 80 {
            return Err(ConsensusError::Serialization(format!(
                "header must be 80 bytes, got {}",
                bytes.len()
            )));
        }
        Self::decode(&mut SliceReader::new(bytes))
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockHeader(hash={}, prev={}, time={}, bits={:08x}, nonce={})",
            self.hash(),
            self.prev_hash,
            self.time,
            self.bits,
            self.nonce
        )
    }
}

/// A full block: header plus transactions, the first of which is the
/// coinbase.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    /// Header.
    pub header: BlockHeader,
    /// Transactions in block order.
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Block hash (the header's outer hash).
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Wire serialization: header, compact tx count, transactions.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(80 + 256 * self.txs.len());
        out.extend_from_slice(&self.header.serialize());
        write_compact_size(&mut out, self.txs.len() as u64);
        for tx in &self.txs {
            out.extend_from_slice(&tx.serialize());
        }
        out
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        self.serialize().len()
    }

    /// Deserialize from bytes, requiring full consumption.
    pub fn deserialize(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let header = BlockHeader::decode(&mut reader)?;
        let tx_count = reader.read_compact_size()?;
        let mut txs = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            txs.push(Transaction::decode(&mut reader)?);
        }
        if reader.remaining() != 0 {
            return Err(ConsensusError::Serialization(
                "trailing bytes after block".into(),
            ));
        }
        Ok(Self { header, txs })
    }

    /// Merkle root over the block's txids.
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txs.iter().map(|tx| tx.txid()).collect::<Vec<_>>())
    }

    /// Height claimed by the coinbase scriptSig, as a minimally encoded
    /// script number.
    pub fn coinbase_height(&self) -> ConsensusResult<u32> {
        let coinbase = self
            .txs
            .first()
            .filter(|tx| tx.is_coinbase())
            .ok_or_else(|| ConsensusError::Serialization("block has no coinbase".into()))?;
        let sig = &coinbase.inputs[0].script_sig;
        crate::script::parse_coinbase_height(sig)
    }
}

/// SHA-256d pairwise merkle tree over txids, duplicating the last node of an
/// odd level.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(left.as_bytes());
            concat[32..].copy_from_slice(right.as_bytes());
            next.push(sha256d(&concat));
        }
        level = next;
    }
    level[0]
}
