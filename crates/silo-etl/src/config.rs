//! Configuration for the transform-and-load core
//!
//! All tunables are explicit fields on [`EtlConfig`]; no component reads
//! ambient process-wide state after construction. `EtlConfig::load()` pulls
//! values from the environment (with `.env` support) and validates them.

use crate::error::{EtlError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default number of records per target batch above which the bulk-copy path is used.
pub const DEFAULT_BULK_COPY_THRESHOLD: usize = 500;

/// Default per-table record cap for the join cache.
pub const DEFAULT_JOIN_CACHE_CAP: usize = 5_000;

/// Default artifact size (MiB) above which the loader streams table-by-table.
pub const DEFAULT_LARGE_ARTIFACT_MB: u64 = 256;

/// Default lookback window when no checkpoint or start date is configured.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Default record batch size handed to transform workers.
pub const DEFAULT_TRANSFORM_BATCH_SIZE: usize = 500;

/// Default number of transform workers (1 = fully sequential writing pass).
pub const DEFAULT_TRANSFORM_WORKERS: usize = 4;

/// Default gzip level for output artifacts; low level favors write throughput.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

/// Default database connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default retry attempts for transient destination errors.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default delay between retries in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Destination store selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStore {
    Postgres,
    Sqlite,
}

impl std::str::FromStr for DataStore {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DataStore::Postgres),
            "sqlite" => Ok(DataStore::Sqlite),
            _ => Err(EtlError::Config(format!("Unsupported data store: {}", s))),
        }
    }
}

/// Load failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// First table failure aborts the remaining load.
    FailFast,
    /// Failures are recorded; remaining tables are still attempted.
    #[default]
    ContinueOnError,
}

impl std::str::FromStr for LoadStrategy {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fail_fast" => Ok(LoadStrategy::FailFast),
            "continue_on_error" => Ok(LoadStrategy::ContinueOnError),
            _ => Err(EtlError::Config(format!("Unsupported load strategy: {}", s))),
        }
    }
}

/// Filesystem layout for artifacts, checkpoints, and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root output directory; extracted/transformed artifacts live beneath it.
    pub output_dir: PathBuf,
    /// Directory for checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Directory for logs and run metrics.
    pub log_dir: PathBuf,
    /// Declarative column-mapping file (JSON).
    pub mappings_file: PathBuf,
    /// Optional reference schema catalog for destination table creation.
    pub schema_catalog_file: Option<PathBuf>,
}

impl PathsConfig {
    pub fn extracted_dir(&self) -> PathBuf {
        self.output_dir.join("extracted")
    }

    pub fn transformed_dir(&self) -> PathBuf {
        self.output_dir.join("transformed")
    }

    /// Create all directories this pipeline writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.output_dir.as_path(),
            &self.extracted_dir(),
            &self.transformed_dir(),
            self.checkpoint_dir.as_path(),
            self.log_dir.as_path(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Transform engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Records per batch handed to transform workers.
    pub batch_size: usize,
    /// Worker pool size; 1 disables the pool.
    pub workers: usize,
    /// Gzip the output artifact.
    pub compression: bool,
    /// Gzip level (0-9).
    pub compression_level: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_TRANSFORM_BATCH_SIZE,
            workers: DEFAULT_TRANSFORM_WORKERS,
            compression: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Load engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Batch size at or above which the bulk-copy path is used.
    pub bulk_copy_threshold: usize,
    /// Failure policy across tables.
    pub strategy: LoadStrategy,
    /// Artifact size in bytes above which tables are streamed one at a time.
    pub large_artifact_bytes: u64,
    /// Destination connect timeout.
    pub connect_timeout_secs: u64,
    /// Bounded retry attempts for transient destination errors.
    pub retry_count: u32,
    /// Delay between retries.
    pub retry_delay_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            bulk_copy_threshold: DEFAULT_BULK_COPY_THRESHOLD,
            strategy: LoadStrategy::default(),
            large_artifact_bytes: DEFAULT_LARGE_ARTIFACT_MB * 1024 * 1024,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

/// Join cache tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCacheConfig {
    /// Maximum cached records per join table; overflow records are skipped.
    pub per_table_cap: usize,
}

impl Default for JoinCacheConfig {
    fn default() -> Self {
        Self {
            per_table_cap: DEFAULT_JOIN_CACHE_CAP,
        }
    }
}

/// Value coercion tunables
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoercionConfig {
    /// Columns whose 0/1 values are coerced to booleans.
    pub boolean_columns: HashSet<String>,
}

/// Incremental extraction window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Configured fallback start date when no checkpoint exists.
    pub default_start_date: Option<NaiveDate>,
    /// Lookback window when neither checkpoint nor default date exists.
    pub lookback_days: i64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            default_start_date: None,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

/// Top-level configuration consumed by the ETL core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Environment label recorded in checkpoints (e.g. "local", "production").
    pub environment: String,
    /// Destination store kind.
    pub data_store: DataStore,
    /// Destination connection URL.
    pub database_url: String,
    pub paths: PathsConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
    pub join_cache: JoinCacheConfig,
    pub coercion: CoercionConfig,
    pub extraction: ExtractionConfig,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            environment: "local".to_string(),
            data_store: DataStore::Sqlite,
            database_url: "sqlite://data/silo.db".to_string(),
            paths: PathsConfig {
                output_dir: PathBuf::from("./output"),
                checkpoint_dir: PathBuf::from("./checkpoints"),
                log_dir: PathBuf::from("./logs"),
                mappings_file: PathBuf::from("./config/mappings.json"),
                schema_catalog_file: None,
            },
            transform: TransformConfig::default(),
            load: LoadConfig::default(),
            join_cache: JoinCacheConfig::default(),
            coercion: CoercionConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl EtlConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(env) = std::env::var("SILO_ENVIRONMENT") {
            config.environment = env;
        }
        if let Ok(store) = std::env::var("SILO_DATA_STORE") {
            config.data_store = store.parse()?;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(dir) = std::env::var("SILO_OUTPUT_DIR") {
            config.paths.output_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SILO_CHECKPOINT_DIR") {
            config.paths.checkpoint_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SILO_LOG_DIR") {
            config.paths.log_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var("SILO_MAPPINGS_FILE") {
            config.paths.mappings_file = PathBuf::from(file);
        }
        if let Ok(file) = std::env::var("SILO_SCHEMA_CATALOG") {
            config.paths.schema_catalog_file = Some(PathBuf::from(file));
        }

        if let Some(v) = parse_env("SILO_TRANSFORM_BATCH_SIZE")? {
            config.transform.batch_size = v;
        }
        if let Some(v) = parse_env("SILO_TRANSFORM_WORKERS")? {
            config.transform.workers = v;
        }
        if let Ok(v) = std::env::var("SILO_COMPRESSION") {
            config.transform.compression = v.to_lowercase() == "true";
        }
        if let Some(v) = parse_env("SILO_COMPRESSION_LEVEL")? {
            config.transform.compression_level = v;
        }

        if let Some(v) = parse_env("SILO_BULK_COPY_THRESHOLD")? {
            config.load.bulk_copy_threshold = v;
        }
        if let Ok(v) = std::env::var("SILO_LOAD_STRATEGY") {
            config.load.strategy = v.parse()?;
        }
        if let Some(mb) = parse_env::<u64>("SILO_LARGE_ARTIFACT_MB")? {
            config.load.large_artifact_bytes = mb * 1024 * 1024;
        }
        if let Some(v) = parse_env("SILO_CONNECT_TIMEOUT_SECS")? {
            config.load.connect_timeout_secs = v;
        }
        if let Some(v) = parse_env("SILO_RETRY_COUNT")? {
            config.load.retry_count = v;
        }
        if let Some(v) = parse_env("SILO_RETRY_DELAY_MS")? {
            config.load.retry_delay_ms = v;
        }

        if let Some(v) = parse_env("SILO_JOIN_CACHE_CAP")? {
            config.join_cache.per_table_cap = v;
        }

        if let Ok(cols) = std::env::var("SILO_BOOLEAN_COLUMNS") {
            config.coercion.boolean_columns = cols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(date) = std::env::var("SILO_DEFAULT_START_DATE") {
            let parsed = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                EtlError::Config(format!("Invalid SILO_DEFAULT_START_DATE '{}': {}", date, e))
            })?;
            config.extraction.default_start_date = Some(parsed);
        }
        if let Some(v) = parse_env("SILO_LOOKBACK_DAYS")? {
            config.extraction.lookback_days = v;
        }

        config.validate()?;

        Ok(config)
    }

    /// Load configuration with a mappings file override (CLI convenience).
    pub fn load_with_mappings(mappings_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::load()?;
        if let Some(path) = mappings_file {
            config.paths.mappings_file = path.to_path_buf();
        }
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(EtlError::Config("Database URL cannot be empty".into()));
        }
        if self.transform.batch_size == 0 {
            return Err(EtlError::Config("Transform batch size must be greater than 0".into()));
        }
        if self.transform.workers == 0 {
            return Err(EtlError::Config("Transform workers must be greater than 0".into()));
        }
        if self.transform.compression_level > 9 {
            return Err(EtlError::Config(format!(
                "Compression level must be 0-9, got {}",
                self.transform.compression_level
            )));
        }
        if self.load.bulk_copy_threshold == 0 {
            return Err(EtlError::Config("Bulk copy threshold must be greater than 0".into()));
        }
        if self.join_cache.per_table_cap == 0 {
            return Err(EtlError::Config("Join cache cap must be greater than 0".into()));
        }
        if self.extraction.lookback_days <= 0 {
            return Err(EtlError::Config("Lookback days must be positive".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .parse()
                .map_err(|_| EtlError::Config(format!("Invalid value for {}: '{}'", key, raw)))?;
            Ok(Some(parsed))
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EtlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.load.bulk_copy_threshold, DEFAULT_BULK_COPY_THRESHOLD);
        assert_eq!(config.join_cache.per_table_cap, DEFAULT_JOIN_CACHE_CAP);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = EtlConfig::default();
        config.load.bulk_copy_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_store_from_str() {
        assert_eq!("postgres".parse::<DataStore>().unwrap(), DataStore::Postgres);
        assert_eq!("SQLite".parse::<DataStore>().unwrap(), DataStore::Sqlite);
        assert!("oracle".parse::<DataStore>().is_err());
    }

    #[test]
    fn test_load_strategy_from_str() {
        assert_eq!("fail_fast".parse::<LoadStrategy>().unwrap(), LoadStrategy::FailFast);
        assert_eq!(
            "continue_on_error".parse::<LoadStrategy>().unwrap(),
            LoadStrategy::ContinueOnError
        );
        assert!("best_effort".parse::<LoadStrategy>().is_err());
    }
}
