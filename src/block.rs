/// Wire-level block and transaction shapes the pipeline operates on. These
/// are the parsed form a `CoinProfile` hands back from raw daemon bytes;
/// they intentionally carry nothing consensus-specific (no witness data,
/// no shielded pools) beyond what every UTXO-model chain needs.
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub tx_hash: [u8; 32],
    pub out_index: u16,
}

#[derive(Debug, Clone)]
pub struct TxIn {
    pub prev_out: OutPoint,
    /// Coinbase inputs carry a null prev_out (all-zero hash, index 0xffff).
    pub is_coinbase: bool,
}

impl TxIn {
    pub fn coinbase() -> Self {
        Self {
            prev_out: OutPoint { tx_hash: [0u8; 32], out_index: 0xffff },
            is_coinbase: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub tx_hash: [u8; 32],
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub raw: Vec<u8>,
    pub hash: [u8; 32],
    pub prev_hash: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

/// Reads a Bitcoin-style varint (CompactSize).
pub fn read_varint<R: Read>(cursor: &mut R) -> io::Result<u64> {
    let first = cursor.read_u8()?;
    match first {
        0xfd => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u32::<LittleEndian>()? as u64),
        0xff => cursor.read_u64::<LittleEndian>(),
        n => Ok(n as u64),
    }
}

pub fn read_script<R: Read>(cursor: &mut R) -> io::Result<Vec<u8>> {
    let len = read_varint(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_out_point<R: Read>(cursor: &mut R) -> io::Result<OutPoint> {
    let mut tx_hash = [0u8; 32];
    cursor.read_exact(&mut tx_hash)?;
    tx_hash.reverse();
    let out_index = cursor.read_u32::<LittleEndian>()?;
    Ok(OutPoint { tx_hash, out_index: out_index as u16 })
}

/// Decodes a single transaction from a cursor positioned at its start,
/// returning the transaction and the number of bytes consumed. Does not
/// handle segwit-style marker/flag bytes; chains that need them extend this
/// in their own `CoinProfile::parse_block`.
pub fn read_transaction(cursor: &mut Cursor<&[u8]>, txid: impl Fn(&[u8]) -> [u8; 32]) -> io::Result<Transaction> {
    let start = cursor.position() as usize;
    let _version = cursor.read_u32::<LittleEndian>()?;

    let in_count = read_varint(cursor)?;
    let mut inputs = Vec::with_capacity(in_count as usize);
    for _ in 0..in_count {
        let prev_out = read_out_point(cursor)?;
        let _script_sig = read_script(cursor)?;
        let _sequence = cursor.read_u32::<LittleEndian>()?;
        let is_coinbase = prev_out.tx_hash == [0u8; 32] && prev_out.out_index == 0xffff;
        inputs.push(TxIn { prev_out, is_coinbase });
    }

    let out_count = read_varint(cursor)?;
    let mut outputs = Vec::with_capacity(out_count as usize);
    for _ in 0..out_count {
        let value = cursor.read_u64::<LittleEndian>()?;
        let script_pubkey = read_script(cursor)?;
        outputs.push(TxOut { value, script_pubkey });
    }

    let _lock_time = cursor.read_u32::<LittleEndian>()?;
    let end = cursor.position() as usize;

    let raw = cursor.get_ref();
    let tx_hash = txid(&raw[start..end]);

    Ok(Transaction { tx_hash, inputs, outputs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_txid(bytes: &[u8]) -> [u8; 32] {
        let mut h = [0u8; 32];
        h[0] = bytes.len() as u8;
        h
    }

    #[test]
    fn decodes_coinbase_like_transaction() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes()); // version
        raw.push(1); // 1 input
        raw.extend_from_slice(&[0u8; 32]); // null prevout hash
        raw.extend_from_slice(&0xffffffffu32.to_le_bytes()); // prevout index
        raw.push(0); // empty scriptSig
        raw.extend_from_slice(&0xffffffffu32.to_le_bytes()); // sequence
        raw.push(1); // 1 output
        raw.extend_from_slice(&5_000_000_000u64.to_le_bytes());
        raw.push(0); // empty scriptPubKey
        raw.extend_from_slice(&0u32.to_le_bytes()); // locktime

        let mut cursor = Cursor::new(raw.as_slice());
        let tx = read_transaction(&mut cursor, dummy_txid).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs[0].value, 5_000_000_000);
    }

    #[test]
    fn varint_round_trips_small_and_large_values() {
        let mut small = Cursor::new(&[5u8][..]);
        assert_eq!(read_varint(&mut small).unwrap(), 5);

        let mut big = Cursor::new(&[0xfeu8, 0x00, 0x00, 0x01, 0x00][..]);
        assert_eq!(read_varint(&mut big).unwrap(), 0x0001_0000);
    }
}
