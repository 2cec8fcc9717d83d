//! Shared test fixtures: an in-memory destination and document builders.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use silo_etl::document::Record;
use silo_etl::error::{EtlError, Result};
use silo_etl::load::Destination;
use silo_etl::mapping::{ColumnSource, MappingRegistry, PrimaryKey, TableMapping};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory destination that records which insert path each table took.
#[derive(Default)]
pub struct MockDestination {
    pub tables: Mutex<BTreeMap<String, Vec<Record>>>,
    pub bulk_calls: Mutex<Vec<(String, usize)>>,
    pub row_calls: Mutex<Vec<(String, usize)>>,
    pub fail_tables: Mutex<HashSet<String>>,
    pub bulk_transport_failure: AtomicBool,
}

impl MockDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_table(&self, table: &str) {
        self.fail_tables.lock().unwrap().insert(table.to_string());
    }

    pub fn break_bulk_transport(&self) {
        self.bulk_transport_failure.store(true, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    pub fn bulk_tables(&self) -> Vec<String> {
        self.bulk_calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn row_tables(&self) -> Vec<String> {
        self.row_calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    fn check_failure(&self, table: &str) -> Result<()> {
        if self.fail_tables.lock().unwrap().contains(table) {
            return Err(EtlError::TableLoad {
                table: table.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MockDestination {
    async fn ensure_schema(&self, table: &str, _sample: &Record) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let created = !tables.contains_key(table);
        tables.entry(table.to_string()).or_default();
        Ok(created)
    }

    async fn insert_batch(&self, table: &str, records: &[Record]) -> Result<()> {
        self.check_failure(table)?;
        self.row_calls.lock().unwrap().push((table.to_string(), records.len()));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn bulk_copy(&self, table: &str, records: &[Record]) -> Result<u64> {
        if self.bulk_transport_failure.load(Ordering::SeqCst) {
            return Err(EtlError::BulkTransport("injected transport failure".into()));
        }
        self.check_failure(table)?;
        self.bulk_calls.lock().unwrap().push((table.to_string(), records.len()));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn list_existing_tables(&self) -> Result<HashSet<String>> {
        Ok(self.tables.lock().unwrap().keys().map(|t| t.to_lowercase()).collect())
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.len() as i64)
            .unwrap_or(0))
    }
}

pub fn record(pairs: &[(&str, Value)]) -> Record {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Build a mapping with `source.column` specs.
pub fn table_mapping(sources: &[&str], pk: &str, columns: &[(&str, &str)]) -> TableMapping {
    TableMapping {
        source_tables: sources.iter().map(|s| s.to_string()).collect(),
        primary_key: PrimaryKey::Single(pk.to_string()),
        column_mappings: columns
            .iter()
            .map(|(target, spec)| {
                let source = match spec.split_once('.') {
                    Some((table, column)) => ColumnSource::qualified(table, column),
                    None => ColumnSource::bare(*spec),
                };
                (target.to_string(), source)
            })
            .collect(),
    }
}

pub fn registry(tables: Vec<(&str, TableMapping)>) -> MappingRegistry {
    MappingRegistry::from_tables(
        tables.into_iter().map(|(name, mapping)| (name.to_string(), mapping)).collect(),
    )
    .unwrap()
}

/// Write an extracted document file and return its path.
pub fn write_extracted(dir: &Path, doc: &Value) -> PathBuf {
    let path = dir.join("extracted_data_test.json");
    std::fs::write(&path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
    path
}
