//! Standalone recovery from a prior transformed artifact
//!
//! After a partial load failure, the transformed artifact on disk is the
//! recovery source of truth. Recovery computes which tables the destination
//! is still missing, extracts just those from the (possibly very large)
//! artifact into a temporary reduced artifact, and loads only them.
//! Re-running recovery against an unchanged destination is a no-op.

use crate::checkpoint::recorded_artifact_digest;
use crate::config::EtlConfig;
use crate::document::{
    filter_target_tables, find_latest_artifact, open_reader, read_target_table,
    scan_target_tables, ArtifactWriter,
};
use crate::error::Result;
use crate::load::{Destination, LoadEngine, LoadObserver, LoadResult, NoopObserver};
use chrono::Utc;
use silo_common::checksum::verify_artifact_sha256;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File-name prefix of transformed artifacts.
pub const TARGET_ARTIFACT_PREFIX: &str = "target_data_";

/// Recovery driver over a destination and the transformed-artifact directory.
pub struct Recovery<'a> {
    destination: &'a dyn Destination,
    config: &'a EtlConfig,
}

impl<'a> Recovery<'a> {
    pub fn new(destination: &'a dyn Destination, config: &'a EtlConfig) -> Self {
        Self {
            destination,
            config,
        }
    }

    /// Tables that already hold data in the destination (lowercased).
    pub async fn loaded_tables(&self) -> Result<HashSet<String>> {
        let mut loaded = HashSet::new();
        for table in self.destination.list_existing_tables().await? {
            let count = self.destination.row_count(&table).await?;
            info!(table = %table, records = count, "Destination table");
            if count > 0 {
                loaded.insert(table);
            }
        }
        Ok(loaded)
    }

    /// Most recent transformed artifact on disk.
    pub fn find_latest_artifact(&self) -> Result<PathBuf> {
        find_latest_artifact(&self.config.paths.transformed_dir(), TARGET_ARTIFACT_PREFIX)
    }

    /// Recover outstanding tables from `artifact` (or the newest artifact on
    /// disk). Tables already holding data and tables in `skip_tables` are
    /// left alone; when nothing is outstanding the result is a trivial
    /// success.
    pub async fn recover(
        &self,
        artifact: Option<&Path>,
        skip_tables: &[String],
    ) -> Result<LoadResult> {
        self.recover_with(artifact, skip_tables, &mut NoopObserver).await
    }

    pub async fn recover_with(
        &self,
        artifact: Option<&Path>,
        skip_tables: &[String],
        observer: &mut dyn LoadObserver,
    ) -> Result<LoadResult> {
        let artifact = match artifact {
            Some(path) => path.to_path_buf(),
            None => self.find_latest_artifact()?,
        };
        info!(artifact = %artifact.display(), "Recovering from transformed artifact");

        // Cross-check against the digest the producing run recorded, when known.
        if let Some(expected) =
            recorded_artifact_digest(&self.config.paths.checkpoint_dir, &artifact)
        {
            match verify_artifact_sha256(&artifact, &expected) {
                Ok(()) => info!("Artifact matches the recorded fingerprint"),
                Err(e) => warn!(
                    error = %e,
                    "Artifact differs from the fingerprint recorded at transform time"
                ),
            }
        }

        let entries = scan_target_tables(open_reader(&artifact)?)?;
        let loaded = self.loaded_tables().await?;
        let skip: HashSet<String> = skip_tables.iter().map(|t| t.to_lowercase()).collect();

        let mut to_load: HashSet<String> = HashSet::new();
        for entry in &entries {
            let lower = entry.name.to_lowercase();
            if loaded.contains(&lower) {
                info!(table = %entry.name, "Skipping (already loaded)");
            } else if skip.contains(&lower) {
                warn!(table = %entry.name, "Skipping (in skip list)");
            } else {
                info!(table = %entry.name, records = entry.record_count, "Will load");
                to_load.insert(entry.name.clone());
            }
        }

        if to_load.is_empty() {
            info!("No tables to load - recovery complete");
            return Ok(LoadResult::trivial_success());
        }

        // Reduced artifact in the transformed directory; the temp file handle
        // guarantees cleanup on every exit path, including errors below.
        let reduced = tempfile::Builder::new()
            .prefix("recovery_data_")
            .suffix(".json")
            .tempfile_in(self.config.paths.transformed_dir())?;

        let mut writer = ArtifactWriter::create(reduced.path(), None, &Utc::now().to_rfc3339())?;
        let carried = filter_target_tables(open_reader(&artifact)?, &to_load, &mut writer)?;
        writer.finish()?;
        info!(
            tables = to_load.len(),
            records = carried,
            reduced = %reduced.path().display(),
            "Created reduced recovery artifact"
        );

        let engine = LoadEngine::new(self.destination, &self.config.load);
        engine.load_path_with(reduced.path(), observer).await
    }

    /// Inspect an artifact for load hazards without mutating anything.
    /// Returns per-table issue lists; an empty map means no findings.
    pub fn validate_artifact(&self, artifact: &Path) -> Result<BTreeMap<String, Vec<String>>> {
        let entries = scan_target_tables(open_reader(artifact)?)?;
        let mut issues: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for entry in &entries {
            let mut table_issues = Vec::new();
            if entry.record_count == 0 {
                table_issues.push("No records to load".to_string());
            } else {
                let mut sample: Option<crate::document::Record> = None;
                read_target_table(open_reader(artifact)?, &entry.name, |record| {
                    if sample.is_none() {
                        sample = Some(record);
                    }
                    Ok(())
                })?;
                if let Some(sample) = sample {
                    for (field, value) in &sample {
                        if field.ends_with("_id") && matches!(value, Value::Null) {
                            table_issues.push(format!("NULL value in {}", field));
                        }
                    }
                }
            }

            if table_issues.is_empty() {
                info!(table = %entry.name, "Validation OK");
            } else {
                warn!(table = %entry.name, issues = ?table_issues, "Validation findings");
                issues.insert(entry.name.clone(), table_issues);
            }
        }
        Ok(issues)
    }
}
