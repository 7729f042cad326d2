/// In-memory accumulator mapping an address identifier to the ordered list
/// of global transaction ordinals that touched it since the last flush.
/// Flushing writes one `H`-prefixed key per address carrying only the new
/// ordinals. The flush-id suffix keeps successive flushes from colliding,
/// so reading a full history means concatenating every `H` key under an
/// address in flush-id order, not overwriting a single growing record.
use crate::constants::AID_LEN;
use crate::kv::KvBatch;
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::collections::HashMap;

pub struct HistoryAccumulator {
    map: HashMap<[u8; AID_LEN], Vec<u32>>,
    entry_count: usize,
}

impl HistoryAccumulator {
    pub fn new() -> Self {
        Self { map: HashMap::new(), entry_count: 0 }
    }

    pub fn append(&mut self, aid: [u8; AID_LEN], txn: u32) {
        self.map.entry(aid).or_default().push(txn);
        self.entry_count += 1;
    }

    /// Rough memory footprint: an 8-byte hashmap slot overhead estimate
    /// plus 4 bytes per buffered ordinal, enough to drive the same
    /// periodic cache-size check the Block Processor runs for the UTXO
    /// cache.
    pub fn estimated_size_bytes(&self) -> usize {
        self.map.len() * (AID_LEN + 24) + self.entry_count * 4
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Writes one `H` key per touched address into `batch` and clears the
    /// in-memory map. `flush_id` must be the flush count *after*
    /// incrementing, matching the original protocol's big-endian u16
    /// disambiguator.
    pub fn flush(&mut self, batch: &mut dyn KvBatch, flush_id: u16) {
        for (aid, txns) in self.map.drain() {
            let mut key = Vec::with_capacity(1 + AID_LEN + 2);
            key.push(b'H');
            key.extend_from_slice(&aid);
            key.write_u16::<BigEndian>(flush_id).unwrap();

            let mut value = Vec::with_capacity(txns.len() * 4);
            for txn in &txns {
                value.write_u32::<LittleEndian>(*txn).unwrap();
            }
            batch.put(&key, &value);
        }
        self.entry_count = 0;
    }
}

impl Default for HistoryAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use crate::kv::KvStore;

    #[tokio::test]
    async fn flush_writes_one_key_per_address_and_clears_map() {
        let mut history = HistoryAccumulator::new();
        let aid = [1u8; AID_LEN];
        history.append(aid, 10);
        history.append(aid, 11);
        assert!(!history.is_empty());

        let kv = MemKv::new();
        let mut batch = kv.new_batch();
        history.flush(&mut *batch, 1);
        kv.commit(batch).await.unwrap();

        assert!(history.is_empty());

        let mut key = vec![b'H'];
        key.extend_from_slice(&aid);
        key.extend_from_slice(&1u16.to_be_bytes());
        let value = kv.get(&key).await.unwrap().unwrap();
        assert_eq!(value.len(), 8);
        assert_eq!(u32::from_le_bytes(value[0..4].try_into().unwrap()), 10);
        assert_eq!(u32::from_le_bytes(value[4..8].try_into().unwrap()), 11);
    }

    #[tokio::test]
    async fn successive_flushes_use_distinct_keys() {
        let mut history = HistoryAccumulator::new();
        let aid = [2u8; AID_LEN];
        let kv = MemKv::new();

        history.append(aid, 1);
        let mut batch = kv.new_batch();
        history.flush(&mut *batch, 1);
        kv.commit(batch).await.unwrap();

        history.append(aid, 2);
        let mut batch = kv.new_batch();
        history.flush(&mut *batch, 2);
        kv.commit(batch).await.unwrap();

        let found = kv.iter_prefix(&[b'H'].iter().chain(aid.iter()).copied().collect::<Vec<_>>()).await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
