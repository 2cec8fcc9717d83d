//! Silo Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the silo workspace:
//!
//! - **Error Handling**: the common error and result types
//! - **Checksums**: artifact fingerprints recorded in checkpoints
//! - **Logging**: centralized tracing initialization
//!
//! # Example
//!
//! ```no_run
//! use silo_common::checksum::artifact_sha256;
//!
//! fn fingerprint(path: &str) -> silo_common::Result<String> {
//!     artifact_sha256(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SiloError};
