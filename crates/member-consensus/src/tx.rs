//! Transaction primitives: outpoints, inputs, outputs, transactions, and the
//! persisted `Coin` record that anchors interest accrual.

use crate::hash::{sha256d, Hash256};
use crate::interest::RateTable;
use crate::serialize::{
    write_bytes, write_compact_size, write_i32, write_i64, write_u32, SliceReader,
};
use crate::{Amount, ConsensusResult};
use std::fmt;

/// Sequence value that disables lock-time semantics for an input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// A reference to one output of one transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct OutPoint {
    /// Transaction id of the producing transaction.
    pub txid: Hash256,
    /// Output index within that transaction.
    pub index: u32,
}

impl OutPoint {
    /// Create an outpoint.
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint used by coinbase inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Whether this is the coinbase null outpoint.
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }

    /// Serialize as `txid:32 | index:u32le`.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.txid.as_bytes());
        write_u32(out, self.index);
    }

    /// Decode from a reader.
    pub fn decode(reader: &mut SliceReader<'_>) -> ConsensusResult<Self> {
        let txid = Hash256(reader.read_array_32()?);
        let index = reader.read_u32()?;
        Ok(Self { txid, index })
    }

    /// Fixed-width key encoding for storage.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(self.txid.as_bytes());
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    /// Parse a storage key.
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let index = u32::from_le_bytes([key[32], key[33], key[34], key[35]]);
        Some(Self {
            txid: Hash256(txid),
            index,
        })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxIn {
    /// The output being spent. Null for coinbase inputs.
    pub prevout: OutPoint,
    /// Unlocking script. Coinbase inputs carry the block height here as a
    /// minimally encoded script number.
    pub script_sig: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
}

impl TxIn {
    /// Create an input with final sequence.
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }

    fn encode_to(&self, out: &mut Vec<u8>) {
        self.prevout.encode_to(out);
        write_bytes(out, &self.script_sig);
        write_u32(out, self.sequence);
    }

    fn decode(reader: &mut SliceReader<'_>) -> ConsensusResult<Self> {
        let prevout = OutPoint::decode(reader)?;
        let script_sig = reader.read_var_bytes()?;
        let sequence = reader.read_u32()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

/// A transaction output.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOut {
    /// Face value in satoshi. The spendable (effective) value at a later
    /// height is derived through the interest table, never stored.
    pub value: Amount,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// Create an output.
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The output's effective value: face value grown by the interest table
    /// between its creation height and the valuation height.
    pub fn value_with_interest(
        &self,
        rates: &RateTable,
        output_height: i64,
        valuation_height: i64,
    ) -> Amount {
        rates.value_with_interest(self.value, output_height, valuation_height)
    }

    fn encode_to(&self, out: &mut Vec<u8>) {
        write_i64(out, self.value);
        write_bytes(out, &self.script_pubkey);
    }

    fn decode(reader: &mut SliceReader<'_>) -> ConsensusResult<Self> {
        let value = reader.read_i64()?;
        let script_pubkey = reader.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A transaction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transaction {
    /// Version.
    pub version: i32,
    /// Inputs.
    pub inputs: Vec<TxIn>,
    /// Outputs.
    pub outputs: Vec<TxOut>,
    /// Lock time.
    pub lock_time: u32,
}

impl Transaction {
    /// Current transaction version.
    pub const CURRENT_VERSION: i32 = 1;

    /// Whether this is a coinbase: exactly one input with a null prevout.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Canonical non-witness serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size_hint());
        write_i32(&mut out, self.version);
        write_compact_size(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_to(&mut out);
        }
        write_compact_size(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_to(&mut out);
        }
        write_u32(&mut out, self.lock_time);
        out
    }

    fn serialized_size_hint(&self) -> usize {
        16 + self
            .inputs
            .iter()
            .map(|i| 45 + i.script_sig.len())
            .sum::<usize>()
            + self
                .outputs
                .iter()
                .map(|o| 13 + o.script_pubkey.len())
                .sum::<usize>()
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        self.serialize().len()
    }

    /// Transaction id: SHA-256d of the canonical serialization.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// Decode from a reader.
    pub fn decode(reader: &mut SliceReader<'_>) -> ConsensusResult<Self> {
        let version = reader.read_i32()?;
        let input_count = reader.read_compact_size()?;
        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            inputs.push(TxIn::decode(reader)?);
        }
        let output_count = reader.read_compact_size()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            outputs.push(TxOut::decode(reader)?);
        }
        let lock_time = reader.read_u32()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Deserialize from bytes, requiring full consumption.
    pub fn deserialize(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let tx = Self::decode(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(crate::ConsensusError::Serialization(
                "trailing bytes after transaction".into(),
            ));
        }
        Ok(tx)
    }

    /// Sum of face output values. Callers validate the monetary range.
    pub fn value_out(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// A persisted UTXO record: the output itself plus the creation height the
/// interest engine anchors on and the coinbase flag the maturity rule needs.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Coin {
    /// The unspent output.
    pub output: TxOut,
    /// Height of the block whose transaction created this output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
}

impl Coin {
    /// Create a coin.
    pub fn new(output: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// Effective value of this coin at the given valuation height.
    pub fn effective_value(&self, rates: &RateTable, valuation_height: u32) -> Amount {
        self.output
            .value_with_interest(rates, self.height as i64, valuation_height as i64)
    }

    /// Serialize for storage: `height:u32le | coinbase:u8 | value:i64le |
    /// script`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13 + self.output.script_pubkey.len());
        write_u32(&mut out, self.height);
        out.push(self.is_coinbase as u8);
        write_i64(&mut out, self.output.value);
        out.extend_from_slice(&self.output.script_pubkey);
        out
    }

    /// Deserialize from storage.
    pub fn deserialize(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let height = reader.read_u32()?;
        let is_coinbase = reader.read_u8()? != 0;
        let value = reader.read_i64()?;
        let script_pubkey = reader.read_bytes(reader.remaining())?.to_vec();
        Ok(Self {
            output: TxOut::new(value, script_pubkey),
            height,
            is_coinbase,
        })
    }
}
