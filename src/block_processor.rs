/// Applies blocks to the FS Cache, UTXO Cache and History Accumulator, owns
/// the chain tip, and decides when the Flush Coordinator runs. This is the
/// component every other module in this crate exists to serve.
use crate::block::OutPoint;
use crate::chain_state::{ChainState, STATE_KEY};
use crate::coin::CoinProfile;
use crate::constants::CACHE_SIZE_CHECK_INTERVAL_SECS;
use crate::error::{IndexError, Result};
use crate::fs_cache::FsCache;
use crate::history::HistoryAccumulator;
use crate::kv::KvStore;
use crate::metrics;
use crate::utxo_cache::{Aid, NewUtxo, UtxoCache};
use std::sync::Arc;
use std::time::Instant;

pub struct BlockProcessor<C: CoinProfile> {
    coin: C,
    kv: Arc<dyn KvStore>,
    fs_cache: FsCache,
    utxo_cache: UtxoCache,
    history: HistoryAccumulator,
    state: ChainState,
    last_cache_check: Instant,
    utxo_cache_budget_bytes: usize,
    hist_cache_budget_bytes: usize,
}

impl<C: CoinProfile> BlockProcessor<C> {
    pub async fn open(
        coin: C,
        kv: Arc<dyn KvStore>,
        fs_cache_dir: impl AsRef<std::path::Path>,
        utxo_cache_budget_mb: usize,
        hist_cache_budget_mb: usize,
    ) -> Result<Self> {
        let mut fs_cache = FsCache::open(fs_cache_dir, C::HEADER_LEN)?;

        let mut state = match kv.get(STATE_KEY).await? {
            Some(bytes) => ChainState::decode(&bytes)?,
            None => ChainState::genesis(C::GENESIS_HASH),
        };

        if state.genesis_hash != C::GENESIS_HASH {
            return Err(IndexError::WrongChain);
        }

        if state.flush_count < state.utxo_flush_count {
            return Err(IndexError::CorruptIndex(
                "flush_count < utxo_flush_count: impossible counter relationship".into(),
            ));
        }

        // The process crashed after a history-only flush (step 2 of §4.6
        // committed, step 2b never ran). Every `H` record written past the
        // last UTXO flush is orphaned: roll `flush_count` back down to
        // `utxo_flush_count` and delete those records so history and UTXO
        // state agree on what was actually flushed together.
        if state.flush_count > state.utxo_flush_count {
            let excess = kv.iter_prefix(b"H").await?;
            for (key, _) in excess {
                if key.len() < 2 {
                    continue;
                }
                let flush_id = u16::from_be_bytes([key[key.len() - 2], key[key.len() - 1]]);
                if flush_id as u32 > state.utxo_flush_count {
                    kv.delete(&key).await?;
                }
            }
            state.flush_count = state.utxo_flush_count;
            kv.put(STATE_KEY, &state.encode()).await?;
        }

        // Recovery: the FS Cache is flushed before the KV batch commits, so
        // a crash between those two steps leaves flat files ahead of the
        // durable state. Truncate them back down to what's actually
        // committed.
        if fs_cache.height() > state.height {
            fs_cache.truncate_to_height(state.height)?;
        }

        Ok(Self {
            coin,
            kv,
            fs_cache,
            utxo_cache: UtxoCache::new(),
            history: HistoryAccumulator::new(),
            state,
            last_cache_check: Instant::now(),
            utxo_cache_budget_bytes: utxo_cache_budget_mb * 1024 * 1024,
            hist_cache_budget_bytes: hist_cache_budget_mb * 1024 * 1024,
        })
    }

    pub fn height(&self) -> i32 {
        self.state.height
    }

    pub fn tip(&self) -> [u8; 32] {
        self.state.tip
    }

    /// Applies one raw block. Returns `IndexError::ChainReorg` (non-fatal,
    /// caller decides how to roll back) if the block's declared previous
    /// hash doesn't match our tip.
    pub async fn process_block(&mut self, raw: &[u8]) -> Result<()> {
        let block = self.coin.parse_block(raw)?;

        if self.state.height >= 0 && block.header.prev_hash != self.state.tip {
            metrics::REORGS_DETECTED.inc();
            return Err(IndexError::ChainReorg {
                height: self.state.height + 1,
                prev_hash: block.header.prev_hash,
            });
        }

        let tx_hashes: Vec<[u8; 32]> = block.transactions.iter().map(|tx| tx.tx_hash).collect();
        self.fs_cache.process_block(&block.header.raw, &tx_hashes)?;

        for tx in &block.transactions {
            self.process_tx(tx).await?;
        }

        self.state.tip = block.header.hash;
        self.state.height += 1;
        metrics::BLOCKS_PROCESSED.inc();
        metrics::CHAIN_TIP_HEIGHT.set(self.state.height as i64);

        if self.last_cache_check.elapsed().as_secs() >= CACHE_SIZE_CHECK_INTERVAL_SECS {
            self.last_cache_check = Instant::now();
            self.maybe_flush().await?;
        }

        Ok(())
    }

    async fn process_tx(&mut self, tx: &crate::block::Transaction) -> Result<()> {
        let txn = self.state.tx_count;
        self.state.tx_count += 1;

        // `aids` is the set of addresses this transaction touches, not one
        // entry per output/input: an address that receives two outputs (or
        // both creates and spends) in the same transaction gets exactly one
        // history entry for it.
        let mut aids: std::collections::HashSet<Aid> = std::collections::HashSet::new();

        // Outputs are applied before inputs so a same-block spend of a
        // just-created output resolves purely in memory.
        let mut new_utxos = Vec::new();
        for (idx, out) in tx.outputs.iter().enumerate() {
            if let Some(aid) = self.coin.script_to_aid(&out.script_pubkey) {
                new_utxos.push(NewUtxo {
                    out_point: OutPoint { tx_hash: tx.tx_hash, out_index: idx as u16 },
                    aid,
                    txn,
                    amount: out.value,
                });
                aids.insert(aid);
            }
        }
        self.utxo_cache.add_many(&new_utxos);

        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let (aid, _amount) = self
                    .utxo_cache
                    .spend(self.kv.as_ref(), &self.fs_cache, &input.prev_out)
                    .await?;
                aids.insert(aid);
            }
        }

        for aid in &aids {
            self.history.append(*aid, txn);
        }

        metrics::TRANSACTIONS_PROCESSED.inc();
        metrics::UTXOS_ADDED.inc_by(new_utxos.len() as u64);
        if !tx.is_coinbase() {
            metrics::UTXOS_SPENT.inc_by(tx.inputs.len() as u64);
        }
        Ok(())
    }

    /// Samples cache sizes, publishes them as gauges, and flushes if either
    /// budget is exceeded. Only asks the Flush Coordinator to also flush
    /// UTXOs when the UTXO cache itself is the one over budget, since a
    /// history-only flush skips UTXO work entirely, per §4.6's ordering
    /// rationale.
    async fn maybe_flush(&mut self) -> Result<()> {
        let utxo_bytes = self.utxo_cache.estimated_size_bytes();
        let hist_bytes = self.history.estimated_size_bytes();
        metrics::UTXO_CACHE_SIZE_BYTES.set(utxo_bytes as i64);
        metrics::HISTORY_CACHE_SIZE_BYTES.set(hist_bytes as i64);

        let utxos_over = utxo_bytes >= self.utxo_cache_budget_bytes;
        let hist_over = hist_bytes >= self.hist_cache_budget_bytes;
        if utxos_over || hist_over {
            self.flush_inner(utxos_over).await?;
        }
        Ok(())
    }

    /// Flush Coordinator: flat files first, then one KV batch (history,
    /// optionally UTXOs, then chain state), then commit, then a second
    /// out-of-batch state write so the persisted `wall_time` includes the
    /// commit itself. Always flushes both tiers; the entry point used by
    /// manual callers and the terminal shutdown flush (§5, "Cancellation").
    pub async fn flush(&mut self) -> Result<()> {
        self.flush_inner(true).await
    }

    async fn flush_inner(&mut self, also_utxos: bool) -> Result<()> {
        let timer = metrics::Timer::new();

        self.fs_cache.flush()?;

        let mut batch = self.kv.new_batch();
        self.state.flush_count += 1;
        self.history.flush(&mut *batch, self.state.flush_count as u16);
        if also_utxos {
            self.utxo_cache.flush(&mut *batch);
            self.state.utxo_flush_count = self.state.flush_count;
        }
        batch.put(STATE_KEY, &self.state.encode());

        self.kv.commit(batch).await?;

        self.state.wall_time += timer.elapsed_secs() as u64;
        self.kv.put(STATE_KEY, &self.state.encode()).await?;

        metrics::FLUSH_COUNT.inc();
        metrics::FLUSH_DURATION_SECONDS.observe(timer.elapsed_secs());
        Ok(())
    }

    /// Returns the raw bytes of the header at the current tip; turning them
    /// into a structured view is left to the coin profile that knows the
    /// field layout, the same split `FsCache::header_at` makes.
    pub async fn get_current_header(&self) -> Result<Vec<u8>> {
        self.fs_cache.header_at(self.state.height)
    }

    /// Concatenates every `H` record under `aid` in flush order (the
    /// big-endian flush-id suffix already sorts this way) and resolves each
    /// ordinal to a `(tx_hash, height)` pair. `limit = None` is uncapped.
    pub async fn get_history(&self, aid: &Aid, limit: Option<usize>) -> Result<Vec<([u8; 32], i32)>> {
        let mut prefix = vec![b'H'];
        prefix.extend_from_slice(aid);
        let entries = self.kv.iter_prefix(&prefix).await?;

        let mut out = Vec::new();
        for (_, value) in entries {
            for chunk in value.chunks_exact(4) {
                let txn = u32::from_le_bytes(chunk.try_into().unwrap());
                let (hash, height) = self.fs_cache.get_tx_hash(txn as u64)?;
                out.push((hash, height));
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Returns `(txn, tx_pos, tx_hash, height, amount)` for every unspent
    /// output owned by `aid`. `limit = None` is uncapped.
    pub async fn get_utxos(
        &self,
        aid: &Aid,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, u16, [u8; 32], i32, u64)>> {
        self.utxo_cache.get_utxos(self.kv.as_ref(), &self.fs_cache, aid, limit).await
    }

    pub async fn get_utxos_sorted(&self, aid: &Aid) -> Result<Vec<(u32, u16, [u8; 32], i32, u64)>> {
        let mut utxos = self.get_utxos(aid, None).await?;
        utxos.sort_by_key(|(_, tx_pos, _, height, _)| (*height, *tx_pos));
        Ok(utxos)
    }

    pub async fn get_balance(&self, aid: &Aid) -> Result<u64> {
        self.utxo_cache.get_balance(self.kv.as_ref(), &self.fs_cache, aid).await
    }
}
