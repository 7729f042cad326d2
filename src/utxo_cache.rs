/// Write-back cache over the on-disk UTXO set. Newly created outputs live
/// only in memory until a flush; spending one of them never touches the
/// KV store. Spending an output created in an earlier session falls back
/// to the `h`/`u` on-disk collision-list layout: candidates are keyed only
/// by a 4-byte hash prefix, so each one is confirmed against the requested
/// outpoint's full `tx_hash` via the FS Cache before being accepted.
use crate::block::OutPoint;
use crate::constants::{AID_LEN, HASH_PREFIX_LEN, H_RECORD_LEN, U_RECORD_LEN};
use crate::error::{IndexError, Result};
use crate::fs_cache::FsCache;
use crate::kv::{KvBatch, KvStore};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;

pub type Aid = [u8; AID_LEN];

#[derive(Debug, Clone, Copy)]
pub struct NewUtxo {
    pub out_point: OutPoint,
    pub aid: Aid,
    pub txn: u32,
    pub amount: u64,
}

fn h_key(out_point: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + HASH_PREFIX_LEN + 2);
    key.push(b'h');
    key.extend_from_slice(&out_point.tx_hash[..HASH_PREFIX_LEN]);
    key.write_u16::<LittleEndian>(out_point.out_index).unwrap();
    key
}

fn u_key(aid: &Aid, out_point: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + AID_LEN + HASH_PREFIX_LEN + 2);
    key.push(b'u');
    key.extend_from_slice(aid);
    key.extend_from_slice(&out_point.tx_hash[..HASH_PREFIX_LEN]);
    key.write_u16::<LittleEndian>(out_point.out_index).unwrap();
    key
}

fn decode_h_list(bytes: &[u8]) -> Result<Vec<(Aid, u32)>> {
    if bytes.len() % H_RECORD_LEN != 0 {
        return Err(IndexError::CorruptIndex("h-list has partial record".into()));
    }
    let mut out = Vec::with_capacity(bytes.len() / H_RECORD_LEN);
    for chunk in bytes.chunks_exact(H_RECORD_LEN) {
        let mut aid = [0u8; AID_LEN];
        aid.copy_from_slice(&chunk[..AID_LEN]);
        let txn = (&chunk[AID_LEN..]).read_u32::<LittleEndian>().unwrap();
        out.push((aid, txn));
    }
    Ok(out)
}

fn encode_h_list(list: &[(Aid, u32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(list.len() * H_RECORD_LEN);
    for (aid, txn) in list {
        buf.extend_from_slice(aid);
        buf.write_u32::<LittleEndian>(*txn).unwrap();
    }
    buf
}

fn decode_u_list(bytes: &[u8]) -> Result<Vec<(u32, u64)>> {
    if bytes.len() % U_RECORD_LEN != 0 {
        return Err(IndexError::CorruptIndex("u-list has partial record".into()));
    }
    let mut out = Vec::with_capacity(bytes.len() / U_RECORD_LEN);
    for chunk in bytes.chunks_exact(U_RECORD_LEN) {
        let txn = (&chunk[0..4]).read_u32::<LittleEndian>().unwrap();
        let amount = (&chunk[4..12]).read_u64::<LittleEndian>().unwrap();
        out.push((txn, amount));
    }
    Ok(out)
}

fn encode_u_list(list: &[(u32, u64)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(list.len() * U_RECORD_LEN);
    for (txn, amount) in list {
        buf.write_u32::<LittleEndian>(*txn).unwrap();
        buf.write_u64::<LittleEndian>(*amount).unwrap();
    }
    buf
}

pub struct UtxoCache {
    /// Outputs created this session and not yet flushed; spendable without
    /// touching the KV store.
    pending: HashMap<OutPoint, NewUtxo>,
    /// `h`-index collision lists touched this session, seeded from disk on
    /// first touch, rewritten wholesale at flush.
    dirty_h: HashMap<Vec<u8>, Vec<(Aid, u32)>>,
    /// `u`-index collision lists touched this session.
    dirty_u: HashMap<Vec<u8>, Vec<(u32, u64)>>,
}

impl UtxoCache {
    pub fn new() -> Self {
        Self { pending: HashMap::new(), dirty_h: HashMap::new(), dirty_u: HashMap::new() }
    }

    pub fn estimated_size_bytes(&self) -> usize {
        self.pending.len() * 64 + self.dirty_h.len() * 48 + self.dirty_u.len() * 32
    }

    pub fn add_many(&mut self, outputs: &[NewUtxo]) {
        for utxo in outputs {
            self.pending.insert(utxo.out_point.clone(), *utxo);
            self.dirty_h.entry(h_key(&utxo.out_point)).or_default().push((utxo.aid, utxo.txn));
            self.dirty_u
                .entry(u_key(&utxo.aid, &utxo.out_point))
                .or_default()
                .push((utxo.txn, utxo.amount));
        }
    }

    async fn load_h(&mut self, kv: &dyn KvStore, key: &[u8]) -> Result<()> {
        if !self.dirty_h.contains_key(key) {
            let list = match kv.get(key).await? {
                Some(bytes) => decode_h_list(&bytes)?,
                None => Vec::new(),
            };
            self.dirty_h.insert(key.to_vec(), list);
        }
        Ok(())
    }

    async fn load_u(&mut self, kv: &dyn KvStore, key: &[u8]) -> Result<()> {
        if !self.dirty_u.contains_key(key) {
            let list = match kv.get(key).await? {
                Some(bytes) => decode_u_list(&bytes)?,
                None => Vec::new(),
            };
            self.dirty_u.insert(key.to_vec(), list);
        }
        Ok(())
    }

    /// Removes and returns the `(aid, amount)` of the output at
    /// `out_point`. Checks the write-back cache first; falls back to the
    /// on-disk `h`/`u` layout, disambiguating candidates that share the
    /// 4-byte hash prefix by resolving each one's real `tx_hash` through
    /// the FS Cache and rejecting any that don't match `out_point` exactly.
    pub async fn spend(
        &mut self,
        kv: &dyn KvStore,
        fs_cache: &FsCache,
        out_point: &OutPoint,
    ) -> Result<(Aid, u64)> {
        if let Some(utxo) = self.pending.remove(out_point) {
            let hk = h_key(out_point);
            if let Some(list) = self.dirty_h.get_mut(&hk) {
                if let Some(pos) = list.iter().position(|&(a, t)| a == utxo.aid && t == utxo.txn) {
                    list.remove(pos);
                }
            }
            let uk = u_key(&utxo.aid, out_point);
            if let Some(list) = self.dirty_u.get_mut(&uk) {
                if let Some(pos) = list.iter().position(|&(t, _)| t == utxo.txn) {
                    list.remove(pos);
                }
            }
            return Ok((utxo.aid, utxo.amount));
        }

        let hk = h_key(out_point);
        self.load_h(kv, &hk).await?;
        let candidates = self.dirty_h.get(&hk).cloned().unwrap_or_default();

        for (aid, txn) in candidates {
            let (candidate_hash, _height) = fs_cache.get_tx_hash(txn as u64)?;
            if candidate_hash != out_point.tx_hash {
                continue;
            }

            let uk = u_key(&aid, out_point);
            self.load_u(kv, &uk).await?;
            let found_amount = {
                let list = self.dirty_u.get(&uk).unwrap();
                list.iter().find(|&&(t, _)| t == txn).map(|&(_, amount)| amount)
            };
            if let Some(amount) = found_amount {
                if let Some(list) = self.dirty_u.get_mut(&uk) {
                    list.retain(|&(t, _)| t != txn);
                }
                if let Some(list) = self.dirty_h.get_mut(&hk) {
                    list.retain(|&(a, t)| !(a == aid && t == txn));
                }
                return Ok((aid, amount));
            }
        }

        Err(IndexError::CorruptIndex(format!(
            "spend of unknown outpoint {}:{}",
            hex::encode(out_point.tx_hash),
            out_point.out_index
        )))
    }

    /// Rewrites every touched `h`/`u` key into `batch` (deleting keys whose
    /// list emptied out) and clears the session's working set.
    pub fn flush(&mut self, batch: &mut dyn KvBatch) {
        for (key, list) in self.dirty_h.drain() {
            if list.is_empty() {
                batch.delete(&key);
            } else {
                batch.put(&key, &encode_h_list(&list));
            }
        }
        for (key, list) in self.dirty_u.drain() {
            if list.is_empty() {
                batch.delete(&key);
            } else {
                batch.put(&key, &encode_u_list(&list));
            }
        }
        self.pending.clear();
    }

    /// Returns `(txn, tx_pos, tx_hash, height, amount)` for every unspent
    /// output owned by `aid`, capping the total at `limit` when given. The
    /// on-disk record only carries a 4-byte hash prefix, so the real
    /// `tx_hash`/`height` are resolved per entry through the FS Cache.
    pub async fn get_utxos(
        &self,
        kv: &dyn KvStore,
        fs_cache: &FsCache,
        aid: &Aid,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, u16, [u8; 32], i32, u64)>> {
        let mut prefix = vec![b'u'];
        prefix.extend_from_slice(aid);
        let entries = kv.iter_prefix(&prefix).await?;
        let mut out = Vec::new();
        for (key, value) in entries {
            let out_index = (&key[1 + AID_LEN + HASH_PREFIX_LEN..]).read_u16::<LittleEndian>().unwrap();
            for (txn, amount) in decode_u_list(&value)? {
                let (tx_hash, height) = fs_cache.get_tx_hash(txn as u64)?;
                out.push((txn, out_index, tx_hash, height, amount));
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn get_balance(&self, kv: &dyn KvStore, fs_cache: &FsCache, aid: &Aid) -> Result<u64> {
        Ok(self
            .get_utxos(kv, fs_cache, aid, None)
            .await?
            .iter()
            .map(|(_, _, _, _, amount)| amount)
            .sum())
    }
}

impl Default for UtxoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use tempfile::tempdir;

    fn op(byte: u8, idx: u16) -> OutPoint {
        OutPoint { tx_hash: [byte; 32], out_index: idx }
    }

    /// Builds an `FsCache` whose single block's transaction hashes are
    /// `entries[i].1` at ordinal `entries[i].0`, so `get_tx_hash` resolves
    /// the way a real processor run would have left it.
    fn fs_cache_with(dir: &std::path::Path, entries: &[(u32, [u8; 32])]) -> FsCache {
        let max_txn = entries.iter().map(|(t, _)| *t).max().unwrap_or(0);
        let mut hashes = vec![[0u8; 32]; max_txn as usize + 1];
        for (txn, hash) in entries {
            hashes[*txn as usize] = *hash;
        }
        let mut fs_cache = FsCache::open(dir, 80).unwrap();
        fs_cache.process_block(&[0u8; 80], &hashes).unwrap();
        fs_cache.flush().unwrap();
        fs_cache
    }

    #[tokio::test]
    async fn spend_of_pending_output_never_touches_disk() {
        let dir = tempdir().unwrap();
        let fs_cache = fs_cache_with(dir.path(), &[(5, op(1, 0).tx_hash)]);
        let kv = MemKv::new();
        let mut cache = UtxoCache::new();
        let utxo = NewUtxo { out_point: op(1, 0), aid: [9u8; AID_LEN], txn: 5, amount: 1000 };
        cache.add_many(&[utxo]);

        let (aid, amount) = cache.spend(&kv, &fs_cache, &op(1, 0)).await.unwrap();
        assert_eq!(aid, [9u8; AID_LEN]);
        assert_eq!(amount, 1000);

        let mut batch = kv.new_batch();
        cache.flush(&mut *batch);
        kv.commit(batch).await.unwrap();
        // nothing should have been written: the output never left the cache unspent
        assert!(kv.get(&h_key(&op(1, 0))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flushed_output_spends_via_disk_collision_lookup() {
        let dir = tempdir().unwrap();
        let fs_cache = fs_cache_with(dir.path(), &[(7, op(2, 3).tx_hash)]);
        let kv = MemKv::new();
        let mut cache = UtxoCache::new();
        let utxo = NewUtxo { out_point: op(2, 3), aid: [5u8; AID_LEN], txn: 7, amount: 500 };
        cache.add_many(&[utxo]);
        let mut batch = kv.new_batch();
        cache.flush(&mut *batch);
        kv.commit(batch).await.unwrap();

        let mut cache2 = UtxoCache::new();
        let (aid, amount) = cache2.spend(&kv, &fs_cache, &op(2, 3)).await.unwrap();
        assert_eq!(aid, [5u8; AID_LEN]);
        assert_eq!(amount, 500);

        let mut batch = kv.new_batch();
        cache2.flush(&mut *batch);
        kv.commit(batch).await.unwrap();
        assert!(kv.get(&h_key(&op(2, 3))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disambiguates_hash_prefix_collision_by_full_tx_hash() {
        let kv = MemKv::new();
        let mut cache = UtxoCache::new();
        // Two different outpoints sharing a 4-byte hash prefix and out_index,
        // differing in the remaining hash bytes. Both stay unspent on disk,
        // so a prefix-only lookup can't tell them apart.
        let mut hash_a = [1u8; 32];
        hash_a[4] = 0xaa;
        let mut hash_b = [1u8; 32];
        hash_b[4] = 0xbb;
        let op_a = OutPoint { tx_hash: hash_a, out_index: 0 };
        let op_b = OutPoint { tx_hash: hash_b, out_index: 0 };

        cache.add_many(&[
            NewUtxo { out_point: op_a.clone(), aid: [1u8; AID_LEN], txn: 1, amount: 100 },
            NewUtxo { out_point: op_b.clone(), aid: [2u8; AID_LEN], txn: 2, amount: 200 },
        ]);
        let mut batch = kv.new_batch();
        cache.flush(&mut *batch);
        kv.commit(batch).await.unwrap();

        let dir = tempdir().unwrap();
        let fs_cache = fs_cache_with(dir.path(), &[(1, hash_a), (2, hash_b)]);

        let mut cache2 = UtxoCache::new();
        let (aid, amount) = cache2.spend(&kv, &fs_cache, &op_b).await.unwrap();
        assert_eq!(aid, [2u8; AID_LEN]);
        assert_eq!(amount, 200);

        let (aid, amount) = cache2.spend(&kv, &fs_cache, &op_a).await.unwrap();
        assert_eq!(aid, [1u8; AID_LEN]);
        assert_eq!(amount, 100);
    }

    #[tokio::test]
    async fn get_balance_sums_all_utxos_for_address() {
        let kv = MemKv::new();
        let mut cache = UtxoCache::new();
        let aid = [3u8; AID_LEN];
        cache.add_many(&[
            NewUtxo { out_point: op(10, 0), aid, txn: 1, amount: 100 },
            NewUtxo { out_point: op(11, 0), aid, txn: 2, amount: 250 },
        ]);
        let mut batch = kv.new_batch();
        cache.flush(&mut *batch);
        kv.commit(batch).await.unwrap();

        let dir = tempdir().unwrap();
        let fs_cache = fs_cache_with(dir.path(), &[(1, op(10, 0).tx_hash), (2, op(11, 0).tx_hash)]);

        let balance = cache.get_balance(&kv, &fs_cache, &aid).await.unwrap();
        assert_eq!(balance, 350);
    }

    #[tokio::test]
    async fn get_utxos_respects_limit() {
        let kv = MemKv::new();
        let mut cache = UtxoCache::new();
        let aid = [6u8; AID_LEN];
        cache.add_many(&[
            NewUtxo { out_point: op(20, 0), aid, txn: 1, amount: 10 },
            NewUtxo { out_point: op(21, 0), aid, txn: 2, amount: 20 },
        ]);
        let mut batch = kv.new_batch();
        cache.flush(&mut *batch);
        kv.commit(batch).await.unwrap();

        let dir = tempdir().unwrap();
        let fs_cache = fs_cache_with(dir.path(), &[(1, op(20, 0).tx_hash), (2, op(21, 0).tx_hash)]);

        let limited = cache.get_utxos(&kv, &fs_cache, &aid, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
