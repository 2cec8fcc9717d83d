//! Declarative mapping registry
//!
//! Maps target tables to their source tables and column mappings. Pure data:
//! the registry carries no behavior beyond validation and index building.
//!
//! # File format
//!
//! ```json
//! {
//!   "dim_users": {
//!     "source_tables": ["users", "user_settings"],
//!     "primary_key": "user_id",
//!     "column_mappings": {
//!       "user_id": "users.id",
//!       "email": "users.email",
//!       "digest_enabled": "user_settings.digest_enabled"
//!     }
//!   }
//! }
//! ```
//!
//! `source_tables[0]` is the primary source table: every target record's
//! existence is driven by iterating primary-source records. All other listed
//! tables are join tables resolved through the join cache.

use crate::error::{EtlError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

/// Where a target column's value comes from: `table.column` or a bare column
/// on the primary source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSource {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnSource {
    pub fn bare(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{}.{}", t, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

// ColumnSource serializes as the compact "table.column" spec string.
impl Serialize for ColumnSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.table {
            Some(t) => serializer.serialize_str(&format!("{}.{}", t, self.column)),
            None => serializer.serialize_str(&self.column),
        }
    }
}

impl<'de> Deserialize<'de> for ColumnSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().is_empty() {
            return Err(D::Error::custom("empty column source"));
        }
        Ok(match raw.split_once('.') {
            Some((table, column)) => ColumnSource::qualified(table, column),
            None => ColumnSource::bare(raw),
        })
    }
}

/// Single or composite primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// Key columns in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            PrimaryKey::Single(c) => vec![c.as_str()],
            PrimaryKey::Composite(cs) => cs.iter().map(String::as_str).collect(),
        }
    }
}

/// Mapping configuration for one target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapping {
    /// Source tables; the first entry is the primary source table.
    pub source_tables: Vec<String>,
    pub primary_key: PrimaryKey,
    /// Target column -> source spec, in stable column order.
    pub column_mappings: BTreeMap<String, ColumnSource>,
}

impl TableMapping {
    /// The primary source table driving record existence.
    pub fn primary_source(&self) -> Option<&str> {
        self.source_tables.first().map(String::as_str)
    }

    /// Join tables (every listed source table except the primary).
    pub fn join_tables(&self) -> impl Iterator<Item = &str> {
        self.source_tables.iter().skip(1).map(String::as_str)
    }
}

/// Route from a primary source table to one target mapping
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub target: &'a str,
    pub mapping: &'a TableMapping,
}

/// Reverse index: primary source table -> routes into target tables.
/// Built once per run, O(mappings) not O(records).
pub struct ReverseIndex<'a> {
    routes: HashMap<&'a str, Vec<Route<'a>>>,
}

impl<'a> ReverseIndex<'a> {
    pub fn routes_for(&self, source_table: &str) -> Option<&[Route<'a>]> {
        self.routes.get(source_table).map(Vec::as_slice)
    }

    pub fn source_table_count(&self) -> usize {
        self.routes.len()
    }
}

/// The full declarative mapping set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingRegistry {
    tables: BTreeMap<String, TableMapping>,
}

impl MappingRegistry {
    /// Load and validate a registry from a JSON mappings file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            EtlError::Config(format!("Cannot open mappings file {}: {}", path.display(), e))
        })?;
        let registry: MappingRegistry = serde_json::from_reader(std::io::BufReader::new(file))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Build a registry from in-memory mappings (tests, embedding callers).
    pub fn from_tables(tables: BTreeMap<String, TableMapping>) -> Result<Self> {
        let registry = Self { tables };
        registry.validate()?;
        Ok(registry)
    }

    pub fn get(&self, target_table: &str) -> Option<&TableMapping> {
        self.tables.get(target_table)
    }

    /// Target table names in stable order.
    pub fn target_tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Every join table referenced by any mapping. This is the cacheable set
    /// handed to the join cache builder.
    pub fn join_tables(&self) -> BTreeSet<String> {
        self.tables
            .values()
            .flat_map(|m| m.join_tables().map(str::to_string))
            .collect()
    }

    /// Build the reverse index keyed by primary source table.
    pub fn reverse_index(&self) -> ReverseIndex<'_> {
        let mut routes: HashMap<&str, Vec<Route<'_>>> = HashMap::new();
        for (target, mapping) in &self.tables {
            if let Some(primary) = mapping.primary_source() {
                routes.entry(primary).or_default().push(Route {
                    target: target.as_str(),
                    mapping,
                });
            }
        }
        ReverseIndex { routes }
    }

    /// Validate structural invariants of every mapping.
    pub fn validate(&self) -> Result<()> {
        for (target, mapping) in &self.tables {
            if mapping.source_tables.is_empty() {
                return Err(EtlError::InvalidMapping {
                    table: target.clone(),
                    reason: "source_tables is empty".into(),
                });
            }
            if mapping.column_mappings.is_empty() {
                return Err(EtlError::InvalidMapping {
                    table: target.clone(),
                    reason: "column_mappings is empty".into(),
                });
            }
            for pk in mapping.primary_key.columns() {
                if !mapping.column_mappings.contains_key(pk) {
                    return Err(EtlError::InvalidMapping {
                        table: target.clone(),
                        reason: format!("primary key column '{}' has no mapping", pk),
                    });
                }
            }
            for (column, source) in &mapping.column_mappings {
                if let Some(src_table) = &source.table {
                    if !mapping.source_tables.iter().any(|t| t == src_table) {
                        return Err(EtlError::InvalidMapping {
                            table: target.clone(),
                            reason: format!(
                                "column '{}' references '{}', which is not in source_tables",
                                column, src_table
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
