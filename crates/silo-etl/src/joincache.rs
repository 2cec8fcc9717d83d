//! Bounded in-memory join cache
//!
//! A pre-pass over the extracted document loads the small "dimension" source
//! tables into a keyed index so the transform engine can resolve cross-table
//! columns without re-scanning the document. Each table's cache is capped:
//! once the cap is hit, further records for that table are skipped and joins
//! against them resolve to null. That is a documented data-loss tradeoff
//! favoring bounded memory, logged once per table as degraded accuracy.

use crate::document::{scan_extracted, open_reader, Record, RecordSink};
use crate::error::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Well-known join key candidates, in lookup priority order.
pub const WELL_KNOWN_KEYS: &[&str] = &[
    "id",
    "user_id",
    "tenant_id",
    "tenant_tsid",
    "account_id",
    "execution_id",
    "test_case_id",
    "application_id",
    "app_id",
];

/// Normalize a scalar join-key value into its index form.
///
/// Integers and strings participate in joins; anything else is not indexable.
fn key_repr(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        },
        _ => None,
    }
}

fn is_foreign_key_column(name: &str) -> bool {
    name != "id" && (name.ends_with("_id") || name.ends_with("_tsid"))
}

#[derive(Default)]
struct TableIndex {
    /// index key name -> key value -> record
    by_key: HashMap<String, HashMap<String, Arc<Record>>>,
    cached_records: usize,
    overflowed: bool,
}

impl TableIndex {
    fn insert(&mut self, record: Record) {
        let record = Arc::new(record);
        for (field, value) in record.iter() {
            let indexable = WELL_KNOWN_KEYS.contains(&field.as_str())
                || is_foreign_key_column(field);
            if !indexable {
                continue;
            }
            if let Some(repr) = key_repr(value) {
                self.by_key
                    .entry(field.clone())
                    .or_default()
                    .entry(repr)
                    .or_insert_with(|| Arc::clone(&record));
            }
        }
        self.cached_records += 1;
    }
}

/// Read-only keyed index over the cacheable join tables.
///
/// Built once per run before any parallel phase; safe for unsynchronized
/// concurrent reads thereafter.
pub struct JoinCache {
    tables: HashMap<String, TableIndex>,
}

impl JoinCache {
    /// Empty cache, for mappings with no join tables.
    pub fn empty() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    /// Build the cache by scanning only `tables_to_cache` in the extracted
    /// document at `path`, storing at most `per_table_cap` records per table.
    pub fn build(
        path: impl AsRef<Path>,
        tables_to_cache: &HashSet<String>,
        per_table_cap: usize,
    ) -> Result<Self> {
        if tables_to_cache.is_empty() {
            return Ok(Self::empty());
        }

        let mut builder = CacheBuilder {
            wanted: tables_to_cache,
            cap: per_table_cap,
            tables: HashMap::new(),
        };
        let reader = open_reader(path.as_ref())?;
        scan_extracted(reader, &mut builder)?;

        let cache = Self {
            tables: builder.tables,
        };
        info!(
            tables = cache.tables.len(),
            records = cache.cached_record_count(),
            "Join cache built"
        );
        Ok(cache)
    }

    /// Total records held across all tables.
    pub fn cached_record_count(&self) -> usize {
        self.tables.values().map(|t| t.cached_records).sum()
    }

    /// Resolve the join record for `join_table` matching the current primary
    /// record, trying each well-known key present on the record in priority
    /// order. The primary record's `id` matches foreign-key-shaped index
    /// columns on the join table first, then an exact `id` index; every other
    /// well-known key matches only its own name. No match resolves to `None`,
    /// never an error.
    pub fn resolve(&self, join_table: &str, record: &Record) -> Option<&Record> {
        let index = self.tables.get(join_table)?;

        for key in WELL_KNOWN_KEYS {
            let Some(value) = record.get(*key) else {
                continue;
            };
            let Some(repr) = key_repr(value) else {
                continue;
            };

            if *key == "id" {
                // pk -> fk join: prefer the join table's foreign-key columns.
                let mut fk_names: Vec<&String> = index
                    .by_key
                    .keys()
                    .filter(|name| is_foreign_key_column(name))
                    .collect();
                fk_names.sort();
                for name in fk_names {
                    if let Some(hit) = index.by_key.get(name).and_then(|m| m.get(&repr)) {
                        return Some(hit.as_ref());
                    }
                }
            }

            if let Some(hit) = index.by_key.get(*key).and_then(|m| m.get(&repr)) {
                return Some(hit.as_ref());
            }
        }
        None
    }
}

struct CacheBuilder<'a> {
    wanted: &'a HashSet<String>,
    cap: usize,
    tables: HashMap<String, TableIndex>,
}

impl RecordSink for CacheBuilder<'_> {
    // Only the configured join tables are ever parsed.
    fn wants_table(&self, _database: &str, table: &str) -> bool {
        self.wanted.contains(table)
    }

    fn on_record(&mut self, database: &str, table: &str, record: Record) -> Result<()> {
        let index = self.tables.entry(table.to_string()).or_default();
        if index.cached_records >= self.cap {
            if !index.overflowed {
                index.overflowed = true;
                warn!(
                    database,
                    table,
                    cap = self.cap,
                    "Join cache cap reached; further records for this table will not be cached and joins against them resolve to null"
                );
            }
            return Ok(());
        }

        index.insert(record);
        Ok(())
    }

    fn on_table_end(&mut self, database: &str, table: &str) -> Result<()> {
        if let Some(index) = self.tables.get(table) {
            debug!(
                database,
                table,
                records = index.cached_records,
                keys = index.by_key.len(),
                "Cached join table"
            );
        }
        Ok(())
    }
}
