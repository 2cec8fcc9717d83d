//! Error types shared across the silo workspace

use thiserror::Error;

/// Result type alias for common silo operations
pub type Result<T> = std::result::Result<T, SiloError>;

/// Error type for the shared utility layer
#[derive(Error, Debug)]
pub enum SiloError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact fingerprint mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
