/// Prometheus instrumentation for the block-processing pipeline.
///
/// The registry is populated and kept up to date by the Block Processor and
/// Prefetcher; exporting it over HTTP is left to whatever process embeds
/// this crate.
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use once_cell::sync::Lazy;
use std::time::Instant;

const FLUSH_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BLOCKS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("addrindex_blocks_processed_total", "Total blocks applied to the index").unwrap()
});

pub static TRANSACTIONS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "addrindex_transactions_processed_total",
        "Total transactions applied to the index",
    )
    .unwrap()
});

pub static UTXOS_ADDED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("addrindex_utxos_added_total", "Total outputs added to the UTXO set").unwrap()
});

pub static UTXOS_SPENT: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("addrindex_utxos_spent_total", "Total outputs removed from the UTXO set").unwrap()
});

pub static FLUSH_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("addrindex_flush_total", "Total completed flushes").unwrap()
});

pub static FLUSH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("addrindex_flush_duration_seconds", "Flush wall-clock duration")
            .buckets(FLUSH_DURATION_BUCKETS.to_vec()),
    )
    .unwrap()
});

pub static CHAIN_TIP_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("addrindex_chain_tip_height", "Height of the last block applied").unwrap()
});

pub static DAEMON_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("addrindex_daemon_height", "Height last reported by the daemon").unwrap()
});

pub static UTXO_CACHE_SIZE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("addrindex_utxo_cache_size_bytes", "Estimated UTXO cache size").unwrap()
});

pub static HISTORY_CACHE_SIZE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("addrindex_history_cache_size_bytes", "Estimated history cache size").unwrap()
});

pub static PREFETCH_QUEUE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("addrindex_prefetch_queue_bytes", "Bytes currently buffered by the prefetcher").unwrap()
});

pub static REORGS_DETECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("addrindex_reorgs_detected_total", "Chain reorganizations detected").unwrap()
});

/// Register every metric with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(UTXOS_ADDED.clone()))?;
    REGISTRY.register(Box::new(UTXOS_SPENT.clone()))?;
    REGISTRY.register(Box::new(FLUSH_COUNT.clone()))?;
    REGISTRY.register(Box::new(FLUSH_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(DAEMON_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(UTXO_CACHE_SIZE_BYTES.clone()))?;
    REGISTRY.register(Box::new(HISTORY_CACHE_SIZE_BYTES.clone()))?;
    REGISTRY.register(Box::new(PREFETCH_QUEUE_BYTES.clone()))?;
    REGISTRY.register(Box::new(REORGS_DETECTED.clone()))?;
    Ok(())
}

/// Gather metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_reports_registered_metrics() {
        let registry = Registry::new();
        registry.register(Box::new(BLOCKS_PROCESSED.clone())).unwrap();
        BLOCKS_PROCESSED.inc_by(3);
        let families = registry.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.005);
    }
}
