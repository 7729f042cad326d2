pub use config::Config;
pub use once_cell::sync::OnceCell;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/tests without touching the global cell.
pub fn load_config(path: &str) -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

/// Indexer-specific settings, pulled out of a `Config` once at startup so
/// library code takes a plain struct instead of reaching into the global.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub db_path: String,
    pub fs_cache_dir: String,
    pub utxo_cache_mb: usize,
    pub hist_cache_mb: usize,
    pub coin_name: String,
    pub daemon_rpc_url: String,
    pub daemon_rpc_user: Option<String>,
    pub daemon_rpc_password: Option<String>,
}

impl IndexerConfig {
    pub fn from_config(config: &Config) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            db_path: config
                .get_string("paths.db_path")
                .map_err(|e| format!("missing paths.db_path: {e}"))?,
            fs_cache_dir: config
                .get_string("paths.fs_cache_dir")
                .map_err(|e| format!("missing paths.fs_cache_dir: {e}"))?,
            utxo_cache_mb: config.get_int("cache.utxo_mb").unwrap_or(1200) as usize,
            hist_cache_mb: config.get_int("cache.hist_mb").unwrap_or(300) as usize,
            coin_name: config
                .get_string("coin.name")
                .unwrap_or_else(|_| "classic".to_string()),
            daemon_rpc_url: config
                .get_string("daemon.rpc_url")
                .map_err(|e| format!("missing daemon.rpc_url: {e}"))?,
            daemon_rpc_user: config.get_string("daemon.rpc_user").ok(),
            daemon_rpc_password: config.get_string("daemon.rpc_password").ok(),
        })
    }
}
