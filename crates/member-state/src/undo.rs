//! Per-block undo data.
//!
//! Connecting a block records the pre-spend coins of every input so a
//! disconnect can resurrect them exactly; the records are persisted next to
//! the block and consulted during reorgs.

use crate::{StateError, StateResult};
use member_consensus::serialize::{write_compact_size, SliceReader};
use member_consensus::Coin;

/// Undo record for one non-coinbase transaction: the coins its inputs
/// consumed, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxUndo {
    /// Pre-spend coins, one per input.
    pub spent_coins: Vec<Coin>,
}

/// Undo record for a block: one [`TxUndo`] per non-coinbase transaction, in
/// block order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockUndo {
    /// Per-transaction undo records.
    pub tx_undos: Vec<TxUndo>,
}

impl BlockUndo {
    /// Serialize for storage.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_compact_size(&mut out, self.tx_undos.len() as u64);
        for tx_undo in &self.tx_undos {
            write_compact_size(&mut out, tx_undo.spent_coins.len() as u64);
            for coin in &tx_undo.spent_coins {
                let bytes = coin.serialize();
                write_compact_size(&mut out, bytes.len() as u64);
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    /// Deserialize from storage.
    pub fn deserialize(bytes: &[u8]) -> StateResult<Self> {
        let mut reader = SliceReader::new(bytes);
        let tx_count = reader
            .read_compact_size()
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let mut tx_undos = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            let coin_count = reader
                .read_compact_size()
                .map_err(|e| StateError::Serialization(e.to_string()))?;
            let mut spent_coins = Vec::with_capacity(coin_count.min(4096) as usize);
            for _ in 0..coin_count {
                let coin_bytes = reader
                    .read_var_bytes()
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                spent_coins.push(Coin::deserialize(&coin_bytes)?);
            }
            tx_undos.push(TxUndo { spent_coins });
        }
        if reader.remaining() != 0 {
            return Err(StateError::Serialization(
                "trailing bytes after undo data".into(),
            ));
        }
        Ok(Self { tx_undos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use member_consensus::{TxOut, COIN};

    #[test]
    fn test_undo_roundtrip() {
        let undo = BlockUndo {
            tx_undos: vec![
                TxUndo {
                    spent_coins: vec![
                        Coin::new(TxOut::new(COIN, vec![0x51]), 10, false),
                        Coin::new(TxOut::new(2 * COIN, vec![0x76, 0xa9]), 3, true),
                    ],
                },
                TxUndo::default(),
            ],
        };
        let decoded = BlockUndo::deserialize(&undo.serialize()).unwrap();
        assert_eq!(undo, decoded);
    }

    #[test]
    fn test_empty_undo_roundtrip() {
        let undo = BlockUndo::default();
        assert_eq!(BlockUndo::deserialize(&undo.serialize()).unwrap(), undo);
    }

    #[test]
    fn test_truncated_undo_rejected() {
        let undo = BlockUndo {
            tx_undos: vec![TxUndo {
                spent_coins: vec![Coin::new(TxOut::new(COIN, vec![0x51]), 10, false)],
            }],
        };
        let bytes = undo.serialize();
        assert!(BlockUndo::deserialize(&bytes[..bytes.len() - 1]).is_err());
    }
}
