//! PostgreSQL destination adapter
//!
//! Bulk path: COPY into a per-batch staging table on a single pooled
//! connection, then INSERT .. SELECT into the target; the staging table is
//! dropped on every exit path. Row path: one parameterized multi-row insert
//! inside a transaction, atomic per batch.

use crate::document::Record;
use crate::error::{EtlError, Result};
use crate::load::destination::{quote_ident, Destination};
use crate::load::schema::{is_conflict, resolve_columns, ColumnType, SchemaCatalog};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Postgres limits bind parameters to u16::MAX per statement; stay below it.
const MAX_BIND_PARAMS: usize = 60_000;

pub struct PgDestination {
    pool: PgPool,
    catalog: Option<SchemaCatalog>,
    /// Column typing computed by ensure_schema, consumed by the insert paths.
    columns: Mutex<HashMap<String, BTreeMap<String, ColumnType>>>,
}

impl PgDestination {
    /// Connect with a bounded pool and acquire timeout.
    pub async fn connect(
        url: &str,
        connect_timeout_secs: u64,
        catalog: Option<SchemaCatalog>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await?;
        info!("Connected to Postgres destination");
        Ok(Self {
            pool,
            catalog,
            columns: Mutex::new(HashMap::new()),
        })
    }

    fn remember_columns(&self, table: &str, columns: BTreeMap<String, ColumnType>) {
        let mut cache = self.columns.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(table.to_string(), columns);
    }

    fn column_type(&self, table: &str, column: &str, value: &Value) -> ColumnType {
        let cache = self.columns.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(table)
            .and_then(|cols| cols.get(column))
            .copied()
            .unwrap_or_else(|| ColumnType::infer(column, value))
    }

    async fn existing_columns(&self, table: &str) -> Result<BTreeMap<String, ColumnType>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut columns = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            columns.insert(name, pg_type_category(&data_type));
        }
        Ok(columns)
    }

    async fn create_table(&self, table: &str, columns: &BTreeMap<String, ColumnType>) -> Result<()> {
        let column_defs: Vec<String> = columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.pg_sql()))
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
impl Destination for PgDestination {
    async fn ensure_schema(&self, table: &str, sample: &Record) -> Result<bool> {
        let wanted = resolve_columns(self.catalog.as_ref(), table, sample);
        let existing = self.existing_columns(table).await?;

        if existing.is_empty() {
            self.create_table(table, &wanted).await?;
            self.remember_columns(table, wanted);
            return Ok(true);
        }

        // Destructive path: on an irreconcilable type conflict the table is
        // dropped and recreated. This throws away destination data and must
        // never happen silently.
        for (column, wanted_ty) in &wanted {
            if let Some(existing_ty) = existing.get(column) {
                if is_conflict(*wanted_ty, *existing_ty) {
                    error!(
                        table,
                        column,
                        existing = existing_ty.pg_sql(),
                        wanted = wanted_ty.pg_sql(),
                        "SCHEMA CONFLICT: dropping and recreating destination table; existing rows will be lost"
                    );
                    let drop_sql = format!("DROP TABLE {}", quote_ident(table));
                    sqlx::query(&drop_sql).execute(&self.pool).await?;
                    self.create_table(table, &wanted).await?;
                    self.remember_columns(table, wanted);
                    return Ok(true);
                }
            }
        }

        for (column, ty) in &wanted {
            if !existing.contains_key(column) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(column),
                    ty.pg_sql()
                );
                sqlx::query(&sql).execute(&self.pool).await?;
                info!(table, column, r#type = ty.pg_sql(), "Added missing column");
            }
        }

        self.remember_columns(table, wanted);
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
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                quote_ident(table),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            ));
            qb.push_values(chunk, |mut row, record| {
                for column in &columns {
                    let value = record.get(column).unwrap_or(&Value::Null);
                    let ty = self.column_type(table, column, value);
                    push_bind(&mut row, value, ty);
                }
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(table, rows = records.len(), "Row-insert batch committed");
        Ok(())
    }

    async fn bulk_copy(&self, table: &str, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = records[0].keys().cloned().collect();
        let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let staging = format!("_silo_stage_{}", uuid::Uuid::new_v4().simple());

        let mut conn = self.pool.acquire().await.map_err(transport_or_db)?;

        let create_sql = format!(
            "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS)",
            quote_ident(&staging),
            quote_ident(table)
        );
        sqlx::query(&create_sql)
            .execute(&mut *conn)
            .await
            .map_err(transport_or_db)?;

        // Everything after staging-table creation funnels through one result
        // so the staged resource is dropped on every exit path.
        let outcome: Result<u64> = async {
            let copy_sql = format!(
                "COPY {} ({}) FROM STDIN (FORMAT text)",
                quote_ident(&staging),
                column_list
            );
            let mut copy = conn.copy_in_raw(&copy_sql).await.map_err(transport_or_db)?;

            if let Err(e) = copy_send_all(&mut copy, &columns, records).await {
                let _ = copy.abort("send failed").await;
                return Err(transport_or_db(e));
            }
            let staged = copy.finish().await.map_err(transport_or_db)?;
            debug!(table, staged, "COPY into staging table complete");

            let insert_sql = format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_ident(table),
                column_list,
                column_list,
                quote_ident(&staging)
            );
            let inserted = sqlx::query(&insert_sql)
                .execute(&mut *conn)
                .await?
                .rows_affected();

            if inserted < staged {
                warn!(table, staged, inserted, "Some staged rows were not inserted");
            }
            Ok(inserted)
        }
        .await;

        let drop_sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&staging));
        if let Err(e) = sqlx::query(&drop_sql).execute(&mut *conn).await {
            warn!(table, staging = %staging, error = %e, "Failed to drop staging table");
        }

        outcome
    }

    async fn list_existing_tables(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT tablename FROM pg_tables WHERE schemaname = current_schema()")
            .fetch_all(&self.pool)
            .await?;
        let mut tables = HashSet::new();
        for row in rows {
            let name: String = row.try_get("tablename")?;
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

/// Stream all records into an open COPY, flushing in ~48 KiB chunks.
async fn copy_send_all(
    copy: &mut sqlx::postgres::PgCopyIn<&mut sqlx::PgConnection>,
    columns: &[String],
    records: &[Record],
) -> std::result::Result<(), sqlx::Error> {
    let mut buffer = String::with_capacity(64 * 1024);
    for record in records {
        encode_copy_row(columns, record, &mut buffer);
        if buffer.len() >= 48 * 1024 {
            copy.send(buffer.as_bytes()).await?;
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        copy.send(buffer.as_bytes()).await?;
    }
    Ok(())
}

/// Map COPY-phase errors: transport-class failures become BulkTransport so
/// the load engine can fall back to row inserts.
fn transport_or_db(e: sqlx::Error) -> EtlError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            EtlError::BulkTransport(e.to_string())
        },
        _ => EtlError::Database(e),
    }
}

/// Normalize Postgres `data_type` strings into the shared category space.
fn pg_type_category(data_type: &str) -> ColumnType {
    match data_type.to_lowercase().as_str() {
        "bigint" | "integer" | "smallint" | "numeric" => ColumnType::BigInt,
        "double precision" | "real" => ColumnType::Double,
        "boolean" => ColumnType::Boolean,
        "jsonb" | "json" => ColumnType::Jsonb,
        s if s.starts_with("timestamp") => ColumnType::TimestampTz,
        _ => ColumnType::Text,
    }
}

fn push_bind(
    row: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    value: &Value,
    ty: ColumnType,
) {
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
            match ty {
                ColumnType::TimestampTz => {
                    row.push_unseparated("::timestamptz");
                },
                ColumnType::Jsonb => {
                    row.push_unseparated("::jsonb");
                },
                _ => {},
            }
        },
        // Structured values are serialized upstream; guard anyway.
        other => {
            row.push_bind(other.to_string());
        },
    }
}

/// Encode one record as a COPY text-format row (tab separated, `\N` nulls).
fn encode_copy_row(columns: &[String], record: &Record, out: &mut String) {
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        match record.get(column).unwrap_or(&Value::Null) {
            Value::Null => out.push_str("\\N"),
            Value::Bool(true) => out.push('t'),
            Value::Bool(false) => out.push('f'),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::String(s) => escape_copy_text(s, out),
            other => {
                let serialized = other.to_string();
                escape_copy_text(&serialized, out);
            },
        }
    }
    out.push('\n');
}

fn escape_copy_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}
