//! Silo ETL core
//!
//! Transform-and-load engine with checkpointed recovery: moves data from
//! relational source systems through a schema-mapping transform stage into a
//! destination analytical store, incrementally and resumably.
//!
//! # Components
//!
//! - [`mapping`]: declarative column-mapping registry (target table ->
//!   source tables, primary key, column specs)
//! - [`joincache`]: bounded in-memory index of small lookup tables for
//!   cross-table column resolution
//! - [`transform`]: streaming transform engine (counting pre-pass + writing
//!   pass) producing target documents
//! - [`load`]: adaptive bulk-vs-row load engine with schema reconciliation
//!   and Postgres/SQLite destination adapters
//! - [`checkpoint`]: extraction and per-job checkpoints with atomic writes
//! - [`recovery`]: idempotent standalone recovery from a prior artifact
//! - [`pipeline`]: run orchestration and the phase state machine
//!
//! # Example
//!
//! ```no_run
//! use silo_etl::config::EtlConfig;
//! use silo_etl::load::{LoadEngine, SqliteDestination};
//!
//! #[tokio::main]
//! async fn main() -> silo_etl::Result<()> {
//!     let config = EtlConfig::load()?;
//!     let destination =
//!         SqliteDestination::connect(&config.database_url, 30, None).await?;
//!     let engine = LoadEngine::new(&destination, &config.load);
//!     let result = engine.load_path("output/transformed/target_data_x.json".as_ref()).await?;
//!     tracing::info!(tables = result.loaded_table_count, "loaded");
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod coerce;
pub mod config;
pub mod document;
pub mod error;
pub mod joincache;
pub mod load;
pub mod mapping;
pub mod pipeline;
pub mod recovery;
pub mod transform;

// Re-export commonly used types
pub use error::{EtlError, Result};
