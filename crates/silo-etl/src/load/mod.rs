//! Load engine
//!
//! Consumes a target document and persists it table by table, strictly
//! sequentially, choosing the bulk-copy or row-insert path purely by batch
//! size against the configured threshold. Artifacts above the configured size
//! threshold are never materialized whole: table names are discovered with a
//! structural scan and each table's records are streamed and loaded one table
//! at a time.

mod destination;
mod postgres;
mod schema;
mod sqlite;

pub use destination::{Destination, LoadObserver, LoadResult, NoopObserver, TableFailure};
pub use postgres::PgDestination;
pub use schema::{ColumnType, SchemaCatalog};
pub use sqlite::SqliteDestination;

use crate::config::{LoadConfig, LoadStrategy};
use crate::document::{load_target_document, open_reader, read_target_table, scan_target_tables, Record};
use crate::error::{EtlError, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Loads target documents into a destination store.
pub struct LoadEngine<'a> {
    destination: &'a dyn Destination,
    config: &'a LoadConfig,
}

impl<'a> LoadEngine<'a> {
    pub fn new(destination: &'a dyn Destination, config: &'a LoadConfig) -> Self {
        Self {
            destination,
            config,
        }
    }

    /// Load an artifact from disk.
    pub async fn load_path(&self, path: &Path) -> Result<LoadResult> {
        self.load_path_with(path, &mut NoopObserver).await
    }

    /// Load an artifact from disk, reporting per-table events to `observer`.
    pub async fn load_path_with(
        &self,
        path: &Path,
        observer: &mut dyn LoadObserver,
    ) -> Result<LoadResult> {
        let size = std::fs::metadata(path)?.len();
        info!(
            artifact = %path.display(),
            size_bytes = size,
            strategy = ?self.config.strategy,
            "Starting load"
        );

        if size >= self.config.large_artifact_bytes {
            info!(
                threshold = self.config.large_artifact_bytes,
                "Artifact exceeds size threshold; streaming table by table"
            );
            self.load_streaming(path, observer).await
        } else {
            // The structural scan preserves artifact order, which the
            // materialized table map does not.
            let entries = scan_target_tables(open_reader(path)?)?;
            let mut doc = load_target_document(path)?;
            let tables: Vec<(String, Vec<Record>)> = entries
                .into_iter()
                .filter_map(|entry| doc.tables.remove(&entry.name).map(|t| (entry.name, t.data)))
                .collect();
            self.load_tables(tables, observer).await
        }
    }

    /// Stream-and-load one table at a time, freeing memory between tables.
    async fn load_streaming(
        &self,
        path: &Path,
        observer: &mut dyn LoadObserver,
    ) -> Result<LoadResult> {
        let entries = scan_target_tables(open_reader(path)?)?;
        info!(tables = entries.len(), "Discovered tables via structural scan");

        let mut result = LoadResult::default();
        for entry in entries {
            if entry.record_count == 0 {
                self.record_skip(&mut result, observer, &entry.name)?;
                continue;
            }

            // One table's records in memory at a time.
            let mut records = Vec::with_capacity(entry.record_count as usize);
            read_target_table(open_reader(path)?, &entry.name, |record| {
                records.push(record);
                Ok(())
            })?;

            if !self
                .load_one_tracked(&entry.name, records, &mut result, observer)
                .await?
            {
                break;
            }
        }
        self.finalize(result)
    }

    /// Load already-materialized tables in artifact order.
    pub async fn load_tables(
        &self,
        tables: Vec<(String, Vec<Record>)>,
        observer: &mut dyn LoadObserver,
    ) -> Result<LoadResult> {
        if tables.is_empty() {
            warn!("No tables found in the target document");
        }

        let mut result = LoadResult::default();
        for (name, records) in tables {
            if records.is_empty() {
                self.record_skip(&mut result, observer, &name)?;
                continue;
            }
            if !self.load_one_tracked(&name, records, &mut result, observer).await? {
                break;
            }
        }
        self.finalize(result)
    }

    fn record_skip(
        &self,
        result: &mut LoadResult,
        observer: &mut dyn LoadObserver,
        table: &str,
    ) -> Result<()> {
        warn!(table, "Table has no records, skipping");
        result.skipped_tables.push(table.to_string());
        observer.on_table_skipped(table, "no records")
    }

    /// Load one table, tracking the outcome. Returns `false` when the load
    /// strategy says to abort the remaining tables.
    async fn load_one_tracked(
        &self,
        table: &str,
        records: Vec<Record>,
        result: &mut LoadResult,
        observer: &mut dyn LoadObserver,
    ) -> Result<bool> {
        let count = records.len() as u64;
        info!(table, records = count, "Loading table");

        match self.load_one(table, &records).await {
            Ok(loaded) => {
                result.loaded_table_count += 1;
                result.total_records += loaded;
                observer.on_table_loaded(table, loaded)?;
                info!(table, records = loaded, "Table loaded");
                Ok(true)
            },
            Err(e) => {
                let message = e.to_string();
                error!(table, error = %message, "Failed to load table");
                result.failed_tables.push(TableFailure {
                    table: table.to_string(),
                    error: message.clone(),
                });
                observer.on_table_failed(table, &message)?;

                match self.config.strategy {
                    LoadStrategy::FailFast => {
                        error!("Load strategy is fail_fast; aborting remaining tables");
                        Ok(false)
                    },
                    LoadStrategy::ContinueOnError => {
                        warn!(table, "Load strategy is continue_on_error; skipping table");
                        Ok(true)
                    },
                }
            },
        }
    }

    /// Load one table's records: reconcile schema, then insert via the path
    /// chosen purely by batch size against the configured threshold.
    async fn load_one(&self, table: &str, records: &[Record]) -> Result<u64> {
        let sample = records.first().ok_or_else(|| EtlError::TableLoad {
            table: table.to_string(),
            reason: "no records".into(),
        })?;

        self.with_retry("ensure_schema", || self.destination.ensure_schema(table, sample))
            .await?;

        if records.len() >= self.config.bulk_copy_threshold {
            match self
                .with_retry("bulk_copy", || self.destination.bulk_copy(table, records))
                .await
            {
                Ok(loaded) => {
                    if loaded < records.len() as u64 {
                        warn!(
                            table,
                            loaded,
                            total = records.len(),
                            "Bulk path loaded fewer rows than staged"
                        );
                    }
                    Ok(loaded)
                },
                Err(EtlError::BulkTransport(reason)) => {
                    warn!(table, reason = %reason, "Bulk path unavailable; falling back to row inserts");
                    self.destination.insert_batch(table, records).await?;
                    Ok(records.len() as u64)
                },
                Err(e) => Err(e),
            }
        } else {
            self.with_retry("insert_batch", || self.destination.insert_batch(table, records))
                .await?;
            Ok(records.len() as u64)
        }
    }

    /// Bounded retry for transient destination errors. Record-level failures
    /// are never retried; both insert paths are atomic or self-cleaning, so a
    /// transient retry never duplicates rows.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.retry_count => {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "Transient destination error; retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn finalize(&self, mut result: LoadResult) -> Result<LoadResult> {
        result.success = match self.config.strategy {
            LoadStrategy::FailFast => result.failed_tables.is_empty(),
            LoadStrategy::ContinueOnError => result.loaded_table_count > 0,
        };

        info!(
            loaded = result.loaded_table_count,
            failed = result.failed_tables.len(),
            skipped = result.skipped_tables.len(),
            records = result.total_records,
            success = result.success,
            "Load summary"
        );
        for failure in &result.failed_tables {
            warn!(table = %failure.table, error = %failure.error, "Table failed");
        }
        Ok(result)
    }
}
