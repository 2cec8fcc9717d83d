//! Destination store capability interface
//!
//! The load engine consumes destinations through this trait; the Postgres and
//! SQLite adapters in this crate implement it, and tests substitute an
//! in-memory mock.

use crate::document::Record;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;

/// Capabilities the load engine needs from a destination store.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Make the destination table compatible with `sample`: create it when
    /// absent, add missing columns, and drop-and-recreate on an
    /// irreconcilable type conflict. Returns `true` when the table was
    /// created or recreated.
    async fn ensure_schema(&self, table: &str, sample: &Record) -> Result<bool>;

    /// Row-insert path: one parameterized multi-row insert, atomic per batch.
    async fn insert_batch(&self, table: &str, records: &[Record]) -> Result<()>;

    /// Bulk-copy path: stage the batch server-side and load it with per-row
    /// error tolerance. Returns the number of rows loaded. Staged resources
    /// are released on every exit path. Environment-specific transport
    /// failures surface as [`crate::error::EtlError::BulkTransport`] so the
    /// caller can fall back to the row path.
    async fn bulk_copy(&self, table: &str, records: &[Record]) -> Result<u64>;

    /// Names of tables that already exist in the destination.
    async fn list_existing_tables(&self) -> Result<HashSet<String>>;

    /// Row count of one destination table.
    async fn row_count(&self, table: &str) -> Result<i64>;
}

/// A table that failed to load
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Aggregated outcome of a load run
#[derive(Debug, Clone, Serialize, Default)]
pub struct LoadResult {
    pub success: bool,
    pub loaded_table_count: usize,
    pub failed_tables: Vec<TableFailure>,
    pub total_records: u64,
    pub skipped_tables: Vec<String>,
}

impl LoadResult {
    /// Success with nothing to do (e.g. recovery found no outstanding tables).
    pub fn trivial_success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }
}

/// Hook for per-table load events; the job checkpoint implements this so it
/// is written after every mutating event.
pub trait LoadObserver: Send {
    fn on_table_loaded(&mut self, table: &str, record_count: u64) -> Result<()>;
    fn on_table_failed(&mut self, table: &str, error: &str) -> Result<()>;
    fn on_table_skipped(&mut self, table: &str, reason: &str) -> Result<()>;
}

/// Observer that records nothing.
pub struct NoopObserver;

impl LoadObserver for NoopObserver {
    fn on_table_loaded(&mut self, _table: &str, _record_count: u64) -> Result<()> {
        Ok(())
    }

    fn on_table_failed(&mut self, _table: &str, _error: &str) -> Result<()> {
        Ok(())
    }

    fn on_table_skipped(&mut self, _table: &str, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// Double-quote an identifier for SQL, escaping embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("dim_users"), "\"dim_users\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_trivial_success() {
        let result = LoadResult::trivial_success();
        assert!(result.success);
        assert_eq!(result.loaded_table_count, 0);
        assert!(result.failed_tables.is_empty());
    }
}
