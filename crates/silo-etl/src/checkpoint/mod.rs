//! Checkpoint persistence
//!
//! Two checkpoint scopes: the long-lived extraction checkpoint (last
//! successful extraction date, advanced forward only) and the per-run job
//! checkpoint (phase statuses and per-table load outcomes). Both are small,
//! human-inspectable JSON files. Writes are write-new-then-replace so a crash
//! never leaves a half-written checkpoint; readers treat a missing or
//! unparsable file as "first run", never as an error.

mod extraction;
mod job;

pub use extraction::{ExtractionCheckpoint, ExtractionState, EXTRACTION_CHECKPOINT_FILE};
pub use job::{
    recorded_artifact_digest, ArtifactRef, JobCheckpoint, JobStatus, Phase, PhaseStatus,
};

use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Atomically replace `path` with the JSON serialization of `value`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_json_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        write_json_atomic(&path, &json!({"v": 1})).unwrap();
        write_json_atomic(&path, &json!({"v": 2})).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["v"], json!(2));

        // No stray temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "checkpoint.json")
            .collect();
        assert!(leftovers.is_empty());
    }
}
