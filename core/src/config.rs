use std::path::PathBuf;

/// One ONX in atomic units.
pub const COIN: u64 = 100_000_000;

/// Immutable node configuration, resolved once at startup and injected into
/// every component. Environment variables override the defaults; nothing in
/// the core reads the environment after construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage root for segments, state files, index and backups.
    pub data_dir: PathBuf,

    // -- Consensus --
    /// Hard cap on circulating supply, in atomic units.
    pub max_supply: u64,
    /// Coinbase base amount, in atomic units.
    pub block_reward: u64,
    /// Leading-zero-bit difficulty of the genesis block.
    pub initial_difficulty: u32,
    /// Blocks between difficulty retargets.
    pub difficulty_retarget_interval: u64,
    /// Desired seconds between blocks.
    pub target_block_time_seconds: u64,
    /// Fixed genesis timestamp so every node derives the same genesis hash.
    pub genesis_timestamp: u64,
    /// Whether `mine_next` may produce coinbase-only blocks.
    pub allow_empty_blocks: bool,

    // -- Mempool --
    pub mempool_max_bytes: usize,
    pub mempool_max_per_sender: usize,
    pub mempool_expiry_seconds: u64,
    /// Admission floor, in atomic units per 1000 canonical bytes.
    pub min_fee_rate: u64,
    /// Invalid-submission score at which a sender is banned.
    pub ban_score_threshold: u32,
    /// Wall-clock seconds a ban lasts.
    pub ban_duration_seconds: u64,
    /// Byte budget for transactions selected into one block.
    pub max_block_bytes: usize,

    // -- Alert thresholds --
    pub mempool_alert_invalid_delta: u64,
    pub mempool_alert_ban_delta: u64,
    pub mempool_alert_active_bans: u64,

    // -- Storage --
    pub compact_on_startup: bool,
    pub enable_index: bool,
    /// Parsed-block LRU capacity.
    pub block_cache_size: usize,

    // -- Recovery --
    pub backup_keep_count: usize,
    pub backup_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            max_supply: 21_000_000 * COIN,
            block_reward: 50 * COIN,
            initial_difficulty: 12,
            difficulty_retarget_interval: 10,
            target_block_time_seconds: 60,
            genesis_timestamp: 1_717_200_000,
            allow_empty_blocks: true,
            mempool_max_bytes: 20 * 1024 * 1024,
            mempool_max_per_sender: 64,
            mempool_expiry_seconds: 3_600,
            min_fee_rate: 1,
            ban_score_threshold: 10,
            ban_duration_seconds: 600,
            max_block_bytes: 1024 * 1024,
            mempool_alert_invalid_delta: 50,
            mempool_alert_ban_delta: 5,
            mempool_alert_active_bans: 20,
            compact_on_startup: false,
            enable_index: true,
            block_cache_size: 256,
            backup_keep_count: 24,
            backup_interval_seconds: 3_600,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    /// Resolve configuration from `ONYX_*` environment variables on top of
    /// the defaults. Called once by the binary; tests build `Config` directly.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("ONYX_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("ONYX_MAX_SUPPLY") {
            cfg.max_supply = v;
        }
        if let Some(v) = env_parse("ONYX_BLOCK_REWARD") {
            cfg.block_reward = v;
        }
        if let Some(v) = env_parse("ONYX_INITIAL_DIFFICULTY") {
            cfg.initial_difficulty = v;
        }
        if let Some(v) = env_parse("ONYX_DIFFICULTY_RETARGET_INTERVAL") {
            cfg.difficulty_retarget_interval = v;
        }
        if let Some(v) = env_parse("ONYX_TARGET_BLOCK_TIME_SECONDS") {
            cfg.target_block_time_seconds = v;
        }
        if let Some(v) = env_parse("ONYX_MEMPOOL_MAX_BYTES") {
            cfg.mempool_max_bytes = v;
        }
        if let Some(v) = env_parse("ONYX_MEMPOOL_MAX_PER_SENDER") {
            cfg.mempool_max_per_sender = v;
        }
        if let Some(v) = env_parse("ONYX_MEMPOOL_EXPIRY_SECONDS") {
            cfg.mempool_expiry_seconds = v;
        }
        if let Some(v) = env_parse("ONYX_MIN_FEE_RATE") {
            cfg.min_fee_rate = v;
        }
        if let Some(v) = env_parse("ONYX_MEMPOOL_ALERT_INVALID_DELTA") {
            cfg.mempool_alert_invalid_delta = v;
        }
        if let Some(v) = env_parse("ONYX_MEMPOOL_ALERT_BAN_DELTA") {
            cfg.mempool_alert_ban_delta = v;
        }
        if let Some(v) = env_parse("ONYX_MEMPOOL_ALERT_ACTIVE_BANS") {
            cfg.mempool_alert_active_bans = v;
        }
        if let Some(v) = env_bool("ONYX_COMPACT_ON_STARTUP") {
            cfg.compact_on_startup = v;
        }
        if let Some(v) = env_bool("ONYX_ENABLE_INDEX") {
            cfg.enable_index = v;
        }
        if let Some(v) = env_parse("ONYX_BLOCK_CACHE_SIZE") {
            cfg.block_cache_size = v;
        }
        if let Some(v) = env_parse("ONYX_BACKUP_KEEP_COUNT") {
            cfg.backup_keep_count = v;
        }
        if let Some(v) = env_parse("ONYX_BACKUP_INTERVAL_SECONDS") {
            cfg.backup_interval_seconds = v;
        }
        cfg
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.data_dir.join("block_index.db")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.data_dir.join("recovery")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.block_reward, 50 * COIN);
        assert!(cfg.max_supply > cfg.block_reward);
        assert!(cfg.enable_index);
        assert_eq!(cfg.backup_keep_count, 24);
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/tmp/onyx-test"),
            ..Config::default()
        };
        assert_eq!(cfg.blocks_dir(), PathBuf::from("/tmp/onyx-test/blocks"));
        assert_eq!(cfg.index_db_path(), PathBuf::from("/tmp/onyx-test/block_index.db"));
    }
}
