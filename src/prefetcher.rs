/// Fetches raw blocks ahead of the Block Processor, bounded by a byte
/// budget rather than a block count, and sizes each request batch off a
/// sliding window of recently seen block sizes. Daemon errors are logged
/// and retried after a short sleep rather than propagated, since a daemon
/// hiccup should not bring the pipeline down.
use crate::constants::{MAX_PREFETCH_BATCH, MIN_PREFETCH_BATCH, PREFETCH_TARGET_BYTES, RECENT_SIZES_WINDOW};
use crate::daemon::Daemon;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

pub struct Prefetcher {
    daemon: Arc<dyn Daemon>,
    target_bytes: usize,
    recent_sizes: VecDeque<usize>,
    pub queue_bytes: Arc<AtomicUsize>,
}

impl Prefetcher {
    pub fn new(daemon: Arc<dyn Daemon>) -> Self {
        Self::with_queue_bytes(daemon, Arc::new(AtomicUsize::new(0)))
    }

    /// Like `new`, but shares the byte counter with a caller that also needs
    /// to observe or decrement it (the consumer side of the bounded queue).
    pub fn with_queue_bytes(daemon: Arc<dyn Daemon>, queue_bytes: Arc<AtomicUsize>) -> Self {
        Self {
            daemon,
            target_bytes: PREFETCH_TARGET_BYTES,
            recent_sizes: VecDeque::with_capacity(RECENT_SIZES_WINDOW),
            queue_bytes,
        }
    }

    fn average_recent_size(&self) -> usize {
        if self.recent_sizes.is_empty() {
            return 1;
        }
        self.recent_sizes.iter().sum::<usize>() / self.recent_sizes.len()
    }

    fn record_size(&mut self, size: usize) {
        self.recent_sizes.push_back(size);
        if self.recent_sizes.len() > RECENT_SIZES_WINDOW {
            self.recent_sizes.pop_front();
        }
    }

    fn next_batch_size(&self, daemon_height: i32, fetched_height: i32) -> u32 {
        let remaining = (daemon_height - fetched_height).max(0) as u32;
        let by_budget = (self.target_bytes / self.average_recent_size()).max(MIN_PREFETCH_BATCH as usize) as u32;
        remaining.min(MAX_PREFETCH_BATCH).min(by_budget)
    }

    /// Runs until `fetched_height` reaches `stop_height` (inclusive), or
    /// forever if `stop_height` is `None`. Sends `(height, raw_block)` pairs
    /// downstream in height order.
    pub async fn run(
        &mut self,
        fetched_height: &mut i32,
        stop_height: Option<i32>,
        tx: Sender<(i32, Vec<u8>)>,
    ) {
        loop {
            if let Some(stop) = stop_height {
                if *fetched_height >= stop {
                    return;
                }
            }

            if self.queue_bytes.load(Ordering::Relaxed) >= self.target_bytes {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            let daemon_height = match self.daemon.height().await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "prefetcher: daemon height query failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            crate::metrics::DAEMON_HEIGHT.set(daemon_height as i64);

            if daemon_height <= *fetched_height {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            let batch_size = self.next_batch_size(daemon_height, *fetched_height);
            let hashes = match self.daemon.block_hex_hashes(*fetched_height + 1, batch_size).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "prefetcher: block_hex_hashes failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            let blocks = match self.daemon.raw_blocks(&hashes).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "prefetcher: raw_blocks failed");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for block in blocks {
                self.record_size(block.len());
                self.queue_bytes.fetch_add(block.len(), Ordering::Relaxed);
                *fetched_height += 1;
                if tx.send((*fetched_height, block)).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;

                if let Some(stop) = stop_height {
                    if *fetched_height >= stop {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::MockDaemon;

    #[tokio::test]
    async fn fetches_blocks_in_order_up_to_stop_height() {
        let daemon = Arc::new(MockDaemon {
            blocks: vec![vec![0u8; 10], vec![1u8; 10], vec![2u8; 10]],
            hashes: vec!["a".into(), "b".into(), "c".into()],
        });
        let mut prefetcher = Prefetcher::new(daemon);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let mut fetched_height = -1;

        prefetcher.run(&mut fetched_height, Some(2), tx).await;

        let mut received = Vec::new();
        while let Ok(item) = rx.try_recv() {
            received.push(item.0);
        }
        assert_eq!(received, vec![0, 1, 2]);
        assert_eq!(fetched_height, 2);
    }

    #[test]
    fn batch_size_respects_budget_and_remaining_blocks() {
        let daemon = Arc::new(MockDaemon { blocks: vec![], hashes: vec![] });
        let mut prefetcher = Prefetcher::new(daemon);
        prefetcher.target_bytes = 1000;
        prefetcher.record_size(100);
        // average = 100, budget allows 10 blocks, only 3 remain
        assert_eq!(prefetcher.next_batch_size(3, 0), 3);
    }

    #[test]
    fn batch_size_never_exceeds_max_prefetch_batch() {
        let daemon = Arc::new(MockDaemon { blocks: vec![], hashes: vec![] });
        let mut prefetcher = Prefetcher::new(daemon);
        prefetcher.target_bytes = 1_000_000_000;
        prefetcher.record_size(1);
        assert_eq!(prefetcher.next_batch_size(1_000_000, 0), MAX_PREFETCH_BATCH);
    }
}
