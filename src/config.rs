use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub faces: FaceConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Directory for the file log backend when journald is unavailable.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facesync")
        .join("facesync.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceConfig {
    /// Length of every face embedding the detector produces.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Photos claimed per polling cycle.
    #[serde(default = "default_face_batch_size")]
    pub batch_size: usize,

    /// Photos processed in parallel within a batch.
    #[serde(default = "default_face_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Consecutive failures before the worker stops calling the detector.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_reset_secs")]
    pub breaker_reset_secs: u64,

    #[serde(default = "default_face_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_embedding_dim() -> usize {
    512
}

fn default_face_batch_size() -> usize {
    20
}

fn default_face_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_breaker_threshold() -> u32 {
    10
}

fn default_breaker_reset_secs() -> u64 {
    60
}

fn default_face_poll_interval_secs() -> u64 {
    10
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            batch_size: default_face_batch_size(),
            concurrency: default_face_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_secs: default_breaker_reset_secs(),
            poll_interval_secs: default_face_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Photos inserted per transaction during ingestion.
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,

    /// Pending sync jobs picked up per polling cycle.
    #[serde(default = "default_sync_jobs_per_poll")]
    pub jobs_per_poll: usize,

    #[serde(default = "default_sync_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Local mirror of the linked drives, one subdirectory per drive folder
    /// id. The daemon ingests nothing when unset.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

fn default_sync_batch_size() -> usize {
    100
}

fn default_sync_jobs_per_poll() -> usize {
    5
}

fn default_sync_poll_interval_secs() -> u64 {
    5
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_sync_batch_size(),
            jobs_per_poll: default_sync_jobs_per_poll(),
            poll_interval_secs: default_sync_poll_interval_secs(),
            local_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Minutes a photo may stay `processing` before it is handed back.
    #[serde(default = "default_stuck_photo_minutes")]
    pub stuck_photo_minutes: i64,

    /// Minutes a sync job may go without an update before it is failed.
    #[serde(default = "default_stuck_sync_minutes")]
    pub stuck_sync_minutes: i64,

    #[serde(default = "default_activity_retention_days")]
    pub activity_retention_days: i64,

    #[serde(default = "default_stuck_photo_cron")]
    pub stuck_photo_cron: String,

    #[serde(default = "default_stuck_sync_cron")]
    pub stuck_sync_cron: String,

    #[serde(default = "default_activity_prune_cron")]
    pub activity_prune_cron: String,
}

fn default_stuck_photo_minutes() -> i64 {
    5
}

fn default_stuck_sync_minutes() -> i64 {
    30
}

fn default_activity_retention_days() -> i64 {
    90
}

fn default_stuck_photo_cron() -> String {
    "*/5 * * * *".to_string()
}

fn default_stuck_sync_cron() -> String {
    "*/10 * * * *".to_string()
}

fn default_activity_prune_cron() -> String {
    "0 3 * * *".to_string()
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stuck_photo_minutes: default_stuck_photo_minutes(),
            stuck_sync_minutes: default_stuck_sync_minutes(),
            activity_retention_days: default_activity_retention_days(),
            stuck_photo_cron: default_stuck_photo_cron(),
            stuck_sync_cron: default_stuck_sync_cron(),
            activity_prune_cron: default_activity_prune_cron(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            faces: FaceConfig::default(),
            sync: SyncConfig::default(),
            maintenance: MaintenanceConfig::default(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from `FACESYNC_CONFIG` or the default location, writing defaults
    /// when no file exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.database.sqlite_path
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facesync")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FACESYNC_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
