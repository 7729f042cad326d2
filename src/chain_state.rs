/// The `state` record: everything the Block Processor needs to resume after
/// a restart, besides the caches themselves. Encoded as a small versioned
/// binary layout rather than the original implementation's `repr(dict)`
/// text blob, with a one-shot migration path for reading that legacy format
/// if it's ever found on disk (e.g. an index copied over from the original
/// tool this pipeline supersedes).
use crate::error::{IndexError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const STATE_KEY: &[u8] = b"state";
const CURRENT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub genesis_hash: [u8; 32],
    pub height: i32,
    pub tx_count: u32,
    pub tip: [u8; 32],
    pub flush_count: u32,
    pub utxo_flush_count: u32,
    pub wall_time: u64,
}

impl ChainState {
    pub fn genesis(genesis_hash: [u8; 32]) -> Self {
        Self {
            genesis_hash,
            height: -1,
            tx_count: 0,
            tip: [0u8; 32],
            flush_count: 0,
            utxo_flush_count: 0,
            wall_time: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 32 + 4 + 4 + 32 + 4 + 4 + 8);
        buf.write_u8(CURRENT_VERSION).unwrap();
        buf.write_all(&self.genesis_hash).unwrap();
        buf.write_i32::<LittleEndian>(self.height).unwrap();
        buf.write_u32::<LittleEndian>(self.tx_count).unwrap();
        buf.write_all(&self.tip).unwrap();
        buf.write_u32::<LittleEndian>(self.flush_count).unwrap();
        buf.write_u32::<LittleEndian>(self.utxo_flush_count).unwrap();
        buf.write_u64::<LittleEndian>(self.wall_time).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.first() != Some(&CURRENT_VERSION) {
            return decode_legacy(bytes);
        }
        let mut cursor = Cursor::new(&bytes[1..]);
        let mut genesis_hash = [0u8; 32];
        cursor.read_exact(&mut genesis_hash)?;
        let height = cursor.read_i32::<LittleEndian>()?;
        let tx_count = cursor.read_u32::<LittleEndian>()?;
        let mut tip = [0u8; 32];
        cursor.read_exact(&mut tip)?;
        let flush_count = cursor.read_u32::<LittleEndian>()?;
        let utxo_flush_count = cursor.read_u32::<LittleEndian>()?;
        let wall_time = cursor.read_u64::<LittleEndian>()?;
        Ok(Self { genesis_hash, height, tx_count, tip, flush_count, utxo_flush_count, wall_time })
    }
}

/// Parses the original tool's `repr(dict).encode()` state blob, e.g.
/// `{'genesis': '00'*32, 'height': 100, 'tx_count': 200, 'tip': '11'*32,
/// 'flush_count': 3, 'utxo_flush_count': 3, 'wall_time': 12.5}`. Only read
/// once, on first open of an index produced by that tool; every write after
/// that uses the current binary layout.
fn decode_legacy(bytes: &[u8]) -> Result<ChainState> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| IndexError::CorruptIndex("legacy state blob is not utf8".into()))?;

    let field = |name: &str| -> Result<String> {
        let needle = format!("'{name}': ");
        let start = text
            .find(&needle)
            .ok_or_else(|| IndexError::CorruptIndex(format!("legacy state missing field {name}")))?
            + needle.len();
        let rest = &text[start..];
        let end = rest
            .find(|c| c == ',' || c == '}')
            .ok_or_else(|| IndexError::CorruptIndex("legacy state malformed".into()))?;
        Ok(rest[..end].trim_matches(['\'', ' ']).to_string())
    };

    let hex_to_32 = |s: &str| -> Result<[u8; 32]> {
        let bytes = hex::decode(s).map_err(|_| IndexError::CorruptIndex("legacy hash not hex".into()))?;
        bytes
            .try_into()
            .map_err(|_| IndexError::CorruptIndex("legacy hash wrong length".into()))
    };

    Ok(ChainState {
        genesis_hash: hex_to_32(&field("genesis")?)?,
        height: field("height")?
            .parse()
            .map_err(|_| IndexError::CorruptIndex("legacy height not an integer".into()))?,
        tx_count: field("tx_count")?
            .parse()
            .map_err(|_| IndexError::CorruptIndex("legacy tx_count not an integer".into()))?,
        tip: hex_to_32(&field("tip")?)?,
        flush_count: field("flush_count")?
            .parse()
            .map_err(|_| IndexError::CorruptIndex("legacy flush_count not an integer".into()))?,
        utxo_flush_count: field("utxo_flush_count")?
            .parse()
            .map_err(|_| IndexError::CorruptIndex("legacy utxo_flush_count not an integer".into()))?,
        wall_time: field("wall_time")?
            .parse::<f64>()
            .map_err(|_| IndexError::CorruptIndex("legacy wall_time not a number".into()))? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let state = ChainState {
            genesis_hash: [1u8; 32],
            height: 100,
            tx_count: 5000,
            tip: [2u8; 32],
            flush_count: 3,
            utxo_flush_count: 3,
            wall_time: 42,
        };
        let encoded = state.encode();
        let decoded = ChainState::decode(&encoded).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn decodes_legacy_dict_repr_blob() {
        let legacy = format!(
            "{{'genesis': '{}', 'height': 100, 'tx_count': 5000, 'tip': '{}', 'flush_count': 3, 'utxo_flush_count': 3, 'wall_time': 12.5}}",
            hex::encode([0u8; 32]),
            hex::encode([0xffu8; 32]),
        );
        let decoded = ChainState::decode(legacy.as_bytes()).unwrap();
        assert_eq!(decoded.height, 100);
        assert_eq!(decoded.tx_count, 5000);
        assert_eq!(decoded.tip, [0xffu8; 32]);
        assert_eq!(decoded.wall_time, 12);
    }

    #[test]
    fn genesis_state_has_no_tip_yet() {
        let state = ChainState::genesis([9u8; 32]);
        assert_eq!(state.height, -1);
        assert_eq!(state.flush_count, 0);
    }
}
