//! Destination column typing
//!
//! Destination tables are created either from a reference schema catalog
//! (when configured) or from the runtime types of a sample record. Both
//! adapters share the logical [`ColumnType`]; each maps it onto its own SQL
//! dialect.

use crate::coerce::is_timestamp_column;
use crate::error::{EtlError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Logical destination column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Boolean,
    Text,
    TimestampTz,
    Jsonb,
}

impl ColumnType {
    /// Infer a column's type from its name and a sample value.
    pub fn infer(column: &str, value: &Value) -> Self {
        if column.ends_with("_json") {
            return ColumnType::Jsonb;
        }
        if is_timestamp_column(column) || column == "etl_timestamp" {
            return ColumnType::TimestampTz;
        }
        match value {
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::BigInt,
            Value::Number(_) => ColumnType::Double,
            _ => ColumnType::Text,
        }
    }

    /// PostgreSQL type name
    pub fn pg_sql(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
            ColumnType::Jsonb => "JSONB",
        }
    }

    /// SQLite type affinity
    pub fn sqlite_sql(&self) -> &'static str {
        match self {
            ColumnType::BigInt | ColumnType::Boolean => "INTEGER",
            ColumnType::Double => "REAL",
            ColumnType::Text | ColumnType::TimestampTz | ColumnType::Jsonb => "TEXT",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            "bigint" | "integer" => Ok(ColumnType::BigInt),
            "double" | "float" => Ok(ColumnType::Double),
            "boolean" => Ok(ColumnType::Boolean),
            "text" | "varchar" => Ok(ColumnType::Text),
            "timestamptz" | "timestamp" => Ok(ColumnType::TimestampTz),
            "jsonb" | "json" => Ok(ColumnType::Jsonb),
            _ => Err(EtlError::Config(format!("Unknown column type in schema catalog: {}", raw))),
        }
    }
}

/// Reference schema definitions, keyed by table then column.
///
/// File format: `{ "dim_users": { "user_id": "bigint", "email": "text" } }`
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, BTreeMap<String, ColumnType>>,
}

impl SchemaCatalog {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            EtlError::Config(format!("Cannot open schema catalog {}: {}", path.display(), e))
        })?;
        let raw: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_reader(std::io::BufReader::new(file))?;

        let mut tables = BTreeMap::new();
        for (table, columns) in raw {
            let mut parsed = BTreeMap::new();
            for (column, ty) in columns {
                parsed.insert(column, ColumnType::parse(&ty)?);
            }
            tables.insert(table, parsed);
        }
        Ok(Self { tables })
    }

    pub fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.tables.get(table).and_then(|cols| cols.get(column)).copied()
    }
}

/// Resolve the full column typing for a table from a sample record, with the
/// catalog taking precedence over runtime inference.
pub fn resolve_columns(
    catalog: Option<&SchemaCatalog>,
    table: &str,
    sample: &crate::document::Record,
) -> BTreeMap<String, ColumnType> {
    sample
        .iter()
        .map(|(column, value)| {
            let ty = catalog
                .and_then(|c| c.column_type(table, column))
                .unwrap_or_else(|| ColumnType::infer(column, value));
            (column.clone(), ty)
        })
        .collect()
}

/// Whether an existing destination type is irreconcilable with the wanted
/// type: structured data stored as plain text, or boolean/numeric mismatch.
pub fn is_conflict(wanted: ColumnType, existing: ColumnType) -> bool {
    use ColumnType::*;
    matches!(
        (wanted, existing),
        (Jsonb, Text)
            | (Boolean, BigInt)
            | (Boolean, Double)
            | (BigInt, Boolean)
            | (Double, Boolean)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_from_name_and_value() {
        assert_eq!(ColumnType::infer("config_json", &json!(null)), ColumnType::Jsonb);
        assert_eq!(ColumnType::infer("created_at", &json!("2026-08-04")), ColumnType::TimestampTz);
        assert_eq!(ColumnType::infer("etl_timestamp", &json!("x")), ColumnType::TimestampTz);
        assert_eq!(ColumnType::infer("is_active", &json!(true)), ColumnType::Boolean);
        assert_eq!(ColumnType::infer("user_id", &json!(5)), ColumnType::BigInt);
        assert_eq!(ColumnType::infer("ratio", &json!(0.5)), ColumnType::Double);
        assert_eq!(ColumnType::infer("name", &json!("acme")), ColumnType::Text);
    }

    #[test]
    fn test_catalog_overrides_inference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(&path, r#"{"dim_users": {"user_id": "text"}}"#).unwrap();

        let catalog = SchemaCatalog::from_path(&path).unwrap();
        let sample: crate::document::Record =
            [("user_id".to_string(), json!(5))].into_iter().collect();
        let columns = resolve_columns(Some(&catalog), "dim_users", &sample);
        assert_eq!(columns["user_id"], ColumnType::Text);

        let columns = resolve_columns(None, "dim_users", &sample);
        assert_eq!(columns["user_id"], ColumnType::BigInt);
    }

    #[test]
    fn test_conflict_matrix() {
        assert!(is_conflict(ColumnType::Jsonb, ColumnType::Text));
        assert!(is_conflict(ColumnType::Boolean, ColumnType::BigInt));
        assert!(is_conflict(ColumnType::BigInt, ColumnType::Boolean));
        assert!(!is_conflict(ColumnType::BigInt, ColumnType::Text));
        assert!(!is_conflict(ColumnType::Text, ColumnType::Text));
    }
}
