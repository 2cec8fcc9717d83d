//! Per-run job checkpoint
//!
//! One file per pipeline run, written after every mutating event, recording
//! phase statuses and per-table load outcomes. Recovery reads it to explain a
//! partial failure; operators read it directly when debugging.

use super::write_json_atomic;
use crate::error::Result;
use crate::load::LoadObserver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Per-phase status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Phases {
    pub extraction: PhaseState,
    pub transformation: PhaseState,
    pub loading: PhaseState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedTable {
    pub table: String,
    pub record_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTable {
    pub table: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Pointer to the transformed artifact this run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
    pub phases: Phases,
    pub loaded_tables: Vec<LoadedTable>,
    pub failed_tables: Vec<FailedTable>,
    pub skipped_tables: Vec<SkippedTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Handle on one run's checkpoint file; every mutation saves.
pub struct JobCheckpoint {
    path: PathBuf,
    state: JobState,
}

impl JobCheckpoint {
    /// Create (or resume) the checkpoint for `job_id`.
    pub fn create(checkpoint_dir: impl AsRef<Path>, job_id: &str) -> Result<Self> {
        let path = checkpoint_dir
            .as_ref()
            .join(format!("{}_checkpoint.json", job_id));

        let state = if path.exists() {
            match std::fs::read(&path)
                .map_err(crate::error::EtlError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
            {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Job checkpoint unreadable; starting fresh"
                    );
                    Self::fresh_state(job_id)
                },
            }
        } else {
            Self::fresh_state(job_id)
        };

        let checkpoint = Self { path, state };
        checkpoint.save()?;
        Ok(checkpoint)
    }

    fn fresh_state(job_id: &str) -> JobState {
        JobState {
            job_id: job_id.to_string(),
            started_at: Utc::now(),
            status: JobStatus::InProgress,
            phases: Phases::default(),
            loaded_tables: Vec::new(),
            failed_tables: Vec::new(),
            skipped_tables: Vec::new(),
            artifact: None,
            completed_at: None,
            last_updated: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.state)?;
        debug!(path = %self.path.display(), "Job checkpoint saved");
        Ok(())
    }

    fn touch_and_save(&mut self) -> Result<()> {
        self.state.last_updated = Some(Utc::now());
        self.save()
    }

    pub fn update_phase(
        &mut self,
        phase: Phase,
        status: PhaseStatus,
        details: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<()> {
        let slot = match phase {
            Phase::Extraction => &mut self.state.phases.extraction,
            Phase::Transformation => &mut self.state.phases.transformation,
            Phase::Loading => &mut self.state.phases.loading,
        };
        slot.status = status;
        if let Some(details) = details {
            slot.details.extend(details);
        }
        self.touch_and_save()
    }

    pub fn record_artifact(&mut self, path: &Path, sha256: &str) -> Result<()> {
        self.state.artifact = Some(ArtifactRef {
            path: path.to_path_buf(),
            sha256: sha256.to_string(),
        });
        self.touch_and_save()
    }

    pub fn mark_table_loaded(&mut self, table: &str, record_count: u64) -> Result<()> {
        self.state.loaded_tables.push(LoadedTable {
            table: table.to_string(),
            record_count,
            timestamp: Utc::now(),
        });
        self.touch_and_save()
    }

    pub fn mark_table_failed(&mut self, table: &str, error: &str) -> Result<()> {
        self.state.failed_tables.push(FailedTable {
            table: table.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        self.touch_and_save()
    }

    pub fn mark_table_skipped(&mut self, table: &str, reason: &str) -> Result<()> {
        self.state.skipped_tables.push(SkippedTable {
            table: table.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.touch_and_save()
    }

    pub fn loaded_tables(&self) -> HashSet<String> {
        self.state
            .loaded_tables
            .iter()
            .map(|t| t.table.clone())
            .collect()
    }

    /// Mark the run terminal.
    pub fn complete(&mut self, success: bool) -> Result<()> {
        self.state.status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.state.completed_at = Some(Utc::now());
        self.touch_and_save()
    }
}

/// Pipeline phase selector for checkpoint updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Extraction,
    Transformation,
    Loading,
}

/// Digest recorded for `artifact` by the most recent run that produced it.
///
/// Scans the per-job checkpoint files in `checkpoint_dir`; unreadable or
/// foreign files are ignored.
pub fn recorded_artifact_digest(checkpoint_dir: &Path, artifact: &Path) -> Option<String> {
    let entries = std::fs::read_dir(checkpoint_dir).ok()?;
    let mut newest: Option<(DateTime<Utc>, String)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with("_checkpoint.json") || name == super::EXTRACTION_CHECKPOINT_FILE {
            continue;
        }
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        let Ok(state) = serde_json::from_slice::<JobState>(&bytes) else {
            continue;
        };
        let Some(artifact_ref) = state.artifact else {
            continue;
        };
        if artifact_ref.path != artifact {
            continue;
        }
        if newest.as_ref().map(|(t, _)| state.started_at > *t).unwrap_or(true) {
            newest = Some((state.started_at, artifact_ref.sha256));
        }
    }

    newest.map(|(_, digest)| digest)
}

impl LoadObserver for JobCheckpoint {
    fn on_table_loaded(&mut self, table: &str, record_count: u64) -> Result<()> {
        self.mark_table_loaded(table, record_count)
    }

    fn on_table_failed(&mut self, table: &str, error: &str) -> Result<()> {
        self.mark_table_failed(table, error)
    }

    fn on_table_skipped(&mut self, table: &str, reason: &str) -> Result<()> {
        self.mark_table_skipped(table, reason)
    }
}
