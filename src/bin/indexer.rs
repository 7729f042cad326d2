use addrindex::config::{init_global_config, get_global_config, IndexerConfig};
use addrindex::daemon::{Daemon, RpcDaemon};
use addrindex::error::IndexError;
use addrindex::kv::{KvStore, RocksKv};
use addrindex::metrics;
use addrindex::telemetry::{self, TelemetryConfig};
use addrindex::{BlockProcessor, ClassicCoin, CoinProfile};

use clap::Parser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Address-indexing pipeline: ingests blocks from a daemon and maintains the
/// UTXO/history indices described in the README.
#[derive(Parser, Debug)]
#[command(name = "addrindex")]
struct Cli {
    /// Path to a config.toml (without extension) readable by the `config` crate.
    #[arg(long, default_value = "config")]
    config: String,

    /// Coin profile to run against. Only "classic" (generic P2PKH/P2SH) ships
    /// in this crate; real deployments plug in their own `CoinProfile`.
    #[arg(long, default_value = "classic")]
    coin: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_global_config(&cli.config)?;
    let config = get_global_config();
    let indexer_config = IndexerConfig::from_config(config)?;

    telemetry::init_tracing(TelemetryConfig::default())?;
    metrics::init_metrics()?;

    // `--coin` overrides `coin.name` from the config file when given
    // explicitly; both ultimately have to name a profile this binary was
    // built with.
    let coin_name = if cli.coin != "classic" { cli.coin.as_str() } else { indexer_config.coin_name.as_str() };
    if coin_name != "classic" {
        return Err(format!(
            "unsupported coin profile \"{coin_name}\": only \"classic\" (generic P2PKH/P2SH) ships in this crate; build against your own CoinProfile to support others"
        )
        .into());
    }

    tracing::info!(coin = %coin_name, db_path = %indexer_config.db_path, "starting addrindex");

    let kv: Arc<dyn KvStore> = Arc::new(RocksKv::open(&indexer_config.db_path)?);
    let coin = ClassicCoin::new();
    let mut processor = BlockProcessor::open(
        coin,
        kv,
        &indexer_config.fs_cache_dir,
        indexer_config.utxo_cache_mb,
        indexer_config.hist_cache_mb,
    )
    .await?;

    let daemon: Arc<dyn Daemon> = Arc::new(RpcDaemon::new(
        indexer_config.daemon_rpc_url.clone(),
        indexer_config.daemon_rpc_user.clone(),
        indexer_config.daemon_rpc_password.clone(),
    ));

    let queue_bytes = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(i32, Vec<u8>)>(4096);

    let prefetch_daemon = daemon.clone();
    let prefetch_queue_bytes = queue_bytes.clone();
    let mut fetched_height = processor.height();
    let prefetch_handle = tokio::spawn(async move {
        let mut prefetcher =
            addrindex::prefetcher::Prefetcher::with_queue_bytes(prefetch_daemon, prefetch_queue_bytes);
        prefetcher.run(&mut fetched_height, None, tx).await;
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut fatal_error: Option<IndexError> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, running final flush");
                break;
            }
            item = rx.recv() => {
                match item {
                    Some((height, raw_block)) => {
                        metrics::PREFETCH_QUEUE_BYTES.set(queue_bytes.load(Ordering::Relaxed) as i64);
                        if let Err(err) = processor.process_block(&raw_block).await {
                            match err {
                                IndexError::ChainReorg { height: at, prev_hash } => {
                                    tracing::error!(
                                        height = at,
                                        prev_hash = %hex::encode(prev_hash),
                                        "chain reorg detected; rollback is not implemented, stopping"
                                    );
                                    break;
                                }
                                other => {
                                    tracing::error!(error = %other, "fatal error applying block");
                                    fatal_error = Some(other);
                                    break;
                                }
                            }
                        }
                        queue_bytes.fetch_sub(raw_block.len(), Ordering::Relaxed);
                        tracing::trace!(height, "block applied");
                    }
                    None => {
                        tracing::info!("prefetcher channel closed");
                        break;
                    }
                }
            }
        }
    }

    processor.flush().await?;
    prefetch_handle.abort();
    tracing::info!(height = processor.height(), "final flush complete, exiting");

    if let Some(err) = fatal_error {
        return Err(Box::new(err));
    }
    Ok(())
}
