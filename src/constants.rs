/// Fixed-width constants used throughout the on-disk key layout and the
/// block-processing pipeline's tuning knobs. Centralized here so the byte
/// arithmetic in `utxo_cache` and `history` has one source of truth.

/// Width of an address identifier. Chosen so the collision-list record
/// sizes below hold: 20 + 4 = 24 bytes for an `h`-index record, and
/// 4 + 8 = 12 bytes for a `u`-index record (the AID itself lives in the
/// `u` key, not its value).
pub const AID_LEN: usize = 20;

/// Width of the truncated tx-hash prefix used in `h` and `u` keys.
pub const HASH_PREFIX_LEN: usize = 4;

/// `h`-index collision-list record: AID(20) ++ TXN_le32(4).
pub const H_RECORD_LEN: usize = AID_LEN + 4;

/// `u`-index collision-list record: TXN_le32(4) ++ amount_le64(8).
pub const U_RECORD_LEN: usize = 4 + 8;

/// Global transaction ordinal width, as it appears packed in `H` values.
pub const TXN_LEN: usize = 4;

/// Target byte budget the Prefetcher tries to keep buffered ahead of the
/// Block Processor.
pub const PREFETCH_TARGET_BYTES: usize = 10 * 1024 * 1024;

/// Number of most-recent raw block sizes kept to estimate the average size
/// used when sizing the next prefetch batch.
pub const RECENT_SIZES_WINDOW: usize = 50;

/// Upper bound on blocks requested in a single prefetch batch.
pub const MAX_PREFETCH_BATCH: u32 = 4000;

/// Lower bound on blocks requested in a single prefetch batch, even when the
/// average recent block size would imply fewer.
pub const MIN_PREFETCH_BATCH: u32 = 10;

/// How often, in seconds of wall-clock processing time, the Block Processor
/// re-samples cache sizes to decide whether to flush.
pub const CACHE_SIZE_CHECK_INTERVAL_SECS: u64 = 60;

/// Genesis block height.
pub const HEIGHT_GENESIS: i32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_match_aid_width() {
        assert_eq!(H_RECORD_LEN, 24);
        assert_eq!(U_RECORD_LEN, 12);
        assert_eq!(AID_LEN, 20);
    }
}
