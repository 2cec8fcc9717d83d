//! Artifact fingerprinting
//!
//! A transformed artifact is fingerprinted with SHA-256 when it is produced
//! and the digest is recorded in the run's checkpoint; recovery later checks
//! a candidate artifact against that recorded digest before trusting it.

use crate::error::{Result, SiloError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 fingerprint of an artifact file, streamed in 8 KiB chunks.
pub fn artifact_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check an artifact against a previously recorded fingerprint.
pub fn verify_artifact_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = artifact_sha256(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(SiloError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_sha256_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target_data_x.json");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = artifact_sha256(&path).unwrap();
        assert_eq!(digest, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        assert!(verify_artifact_sha256(&path, &digest).is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target_data_x.json");
        std::fs::write(&path, b"{}").unwrap();

        let err = verify_artifact_sha256(&path, "not-the-digest");
        assert!(matches!(err, Err(SiloError::ChecksumMismatch { .. })));
    }
}
