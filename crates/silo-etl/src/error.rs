//! Error types for the transform-and-load core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for the ETL core
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid mapping for target table '{table}': {reason}")]
    InvalidMapping { table: String, reason: String },

    #[error("Failed to coerce record from '{source_table}': {reason}")]
    RecordCoercion {
        source_table: String,
        reason: String,
    },

    #[error("Fatal write error on output artifact '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load table '{table}': {reason}")]
    TableLoad { table: String, reason: String },

    #[error("Bulk load transport failure: {0}")]
    BulkTransport(String),

    #[error("No transformed artifact found under {0}")]
    ArtifactNotFound(PathBuf),

    #[error("Artifact is malformed: {0}")]
    MalformedArtifact(String),
}

impl EtlError {
    /// Transient errors are worth a bounded retry; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            EtlError::BulkTransport(_) => true,
            _ => false,
        }
    }
}
