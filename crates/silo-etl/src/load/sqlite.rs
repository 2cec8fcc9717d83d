//! SQLite destination adapter
//!
//! Local-development destination. SQLite has no server-side copy protocol, so
//! the bulk path delegates to chunked multi-row inserts; the threshold policy
//! in the load engine is unchanged.

use crate::document::Record;
use crate::error::Result;
use crate::load::destination::{quote_ident, Destination};
use crate::load::schema::{resolve_columns, ColumnType, SchemaCatalog};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// SQLite's default bind-parameter ceiling is 999; stay below it.
const MAX_BIND_PARAMS: usize = 900;

pub struct SqliteDestination {
    pool: SqlitePool,
    catalog: Option<SchemaCatalog>,
}

impl SqliteDestination {
    /// Connect, creating the database file when missing.
    pub async fn connect(
        url: &str,
        connect_timeout_secs: u64,
        catalog: Option<SchemaCatalog>,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect_with(options)
            .await?;
        info!("Connected to SQLite destination");
        Ok(Self { pool, catalog })
    }

    async fn existing_columns(&self, table: &str) -> Result<BTreeMap<String, ColumnType>> {
        let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut columns = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            columns.insert(name, sqlite_type_category(&declared));
        }
        Ok(columns)
    }

    async fn create_table(&self, table: &str, columns: &BTreeMap<String, ColumnType>) -> Result<()> {
        let column_defs: Vec<String> = columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sqlite_sql()))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            column_defs.join(", ")
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table, columns = columns.len(), "Created destination table");
        Ok(())
    }
}

#[async_trait]
impl Destination for SqliteDestination {
    async fn ensure_schema(&self, table: &str, sample: &Record) -> Result<bool> {
        let wanted = resolve_columns(self.catalog.as_ref(), table, sample);
        let existing = self.existing_columns(table).await?;

        if existing.is_empty() {
            self.create_table(table, &wanted).await?;
            return Ok(true);
        }

        // SQLite's affinity typing reconciles every category this pipeline
        // emits, so schema drift here is only ever missing columns.
        for (column, ty) in &wanted {
            if !existing.contains_key(column) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(column),
                    ty.sqlite_sql()
                );
                sqlx::query(&sql).execute(&self.pool).await?;
                info!(table, column, r#type = ty.sqlite_sql(), "Added missing column");
            }
        }
        Ok(false)
    }

    async fn insert_batch(&self, table: &str, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = records[0].keys().cloned().collect();
        let chunk_rows = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);

        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(chunk_rows) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                quote_ident(table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            ));
            qb.push_values(chunk, |mut row, record| {
                for column in &columns {
                    push_bind(&mut row, record.get(column).unwrap_or(&Value::Null));
                }
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(table, rows = records.len(), "Row-insert batch committed");
        Ok(())
    }

    async fn bulk_copy(&self, table: &str, records: &[Record]) -> Result<u64> {
        // No copy protocol; chunked inserts stand in for the bulk path.
        self.insert_batch(table, records).await?;
        Ok(records.len() as u64)
    }

    async fn list_existing_tables(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut tables = HashSet::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            tables.insert(name.to_lowercase());
        }
        Ok(tables)
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}

/// Map a declared SQLite column type onto the shared category space.
fn sqlite_type_category(declared: &str) -> ColumnType {
    match declared.to_uppercase().as_str() {
        "INTEGER" | "INT" | "BIGINT" => ColumnType::BigInt,
        "REAL" | "DOUBLE" | "FLOAT" => ColumnType::Double,
        "BOOLEAN" => ColumnType::Boolean,
        _ => ColumnType::Text,
    }
}

fn push_bind(row: &mut sqlx::query_builder::Separated<'_, '_, Sqlite, &'static str>, value: &Value) {
    match value {
        Value::Null => {
            row.push("NULL");
        },
        Value::Bool(b) => {
            row.push_bind(*b);
        },
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                row.push_bind(i);
            } else if let Some(f) = n.as_f64() {
                row.push_bind(f);
            } else {
                row.push("NULL");
            }
        },
        Value::String(s) => {
            row.push_bind(s.clone());
        },
        other => {
            row.push_bind(other.to_string());
        },
    }
}
