//! Pipeline orchestration
//!
//! Drives Extract -> Transform -> Load as an explicit state machine, owns the
//! run's job checkpoint and metrics, and applies the `skip_extraction` rule:
//! when extraction succeeded but a later phase failed, the extraction
//! checkpoint keeps its advance and the next run reuses the existing
//! extracted artifact instead of re-querying source systems.

use crate::checkpoint::{ExtractionCheckpoint, JobCheckpoint, Phase, PhaseStatus};
use crate::config::{DataStore, EtlConfig};
use crate::document::find_latest_artifact;
use crate::error::{EtlError, Result};
use crate::joincache::JoinCache;
use crate::load::{Destination, LoadEngine, LoadResult};
use crate::mapping::MappingRegistry;
use crate::transform::TransformEngine;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// File-name prefix of extracted artifacts.
pub const EXTRACTED_ARTIFACT_PREFIX: &str = "extracted_data_";

/// Pipeline run states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Succeeded,
    Failed,
}

impl PipelinePhase {
    /// Legal transitions of the run state machine.
    pub fn can_transition(self, next: PipelinePhase) -> bool {
        use PipelinePhase::*;
        matches!(
            (self, next),
            (Idle, Extracting)
                | (Extracting, Transforming)
                | (Extracting, Failed)
                | (Transforming, Loading)
                | (Transforming, Failed)
                | (Loading, Succeeded)
                | (Loading, Failed)
        )
    }
}

/// Incremental extraction window handed to the extractor.
#[derive(Debug, Clone)]
pub struct ExtractionWindow {
    pub start_date: NaiveDate,
    pub job_id: String,
}

/// External collaborator that produces the extracted document.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, window: &ExtractionWindow) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseMetrics {
    pub records: u64,
    pub tables: usize,
    pub success: bool,
}

/// Per-run metrics, persisted next to the logs at the end of every run.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub extraction: PhaseMetrics,
    pub transformation: PhaseMetrics,
    pub loading: PhaseMetrics,
    pub dropped_records: u64,
    pub errors: Vec<String>,
    pub success: bool,
}

impl RunMetrics {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            extraction: PhaseMetrics::default(),
            transformation: PhaseMetrics::default(),
            loading: PhaseMetrics::default(),
            dropped_records: 0,
            errors: Vec::new(),
            success: false,
        }
    }

    fn finish(&mut self) {
        let completed = Utc::now();
        self.duration_seconds = Some(
            (completed - self.started_at).num_milliseconds() as f64 / 1000.0,
        );
        self.completed_at = Some(completed);
    }

    fn save(&self, log_dir: &Path) {
        let path = log_dir.join(format!("etl_metrics_{}.json", self.job_id));
        if let Err(e) = crate::checkpoint::write_json_atomic(&path, self) {
            error!(path = %path.display(), error = %e, "Failed to save run metrics");
        } else {
            info!(path = %path.display(), "Run metrics saved");
        }
    }
}

/// One pipeline run
pub struct Pipeline<'a> {
    config: &'a EtlConfig,
    registry: &'a MappingRegistry,
    destination: &'a dyn Destination,
    job_id: String,
    phase: PipelinePhase,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a EtlConfig,
        registry: &'a MappingRegistry,
        destination: &'a dyn Destination,
    ) -> Result<Self> {
        config.paths.ensure_directories()?;
        let job_id = Utc::now().format("%Y%m%d_%H%M%S%3f").to_string();
        info!(job_id = %job_id, environment = %config.environment, "Initializing pipeline run");
        Ok(Self {
            config,
            registry,
            destination,
            job_id,
            phase: PipelinePhase::Idle,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    fn advance(&mut self, next: PipelinePhase) -> Result<()> {
        if !self.phase.can_transition(next) {
            return Err(EtlError::Config(format!(
                "Invalid pipeline transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    fn data_store_name(&self) -> &'static str {
        match self.config.data_store {
            DataStore::Postgres => "postgres",
            DataStore::Sqlite => "sqlite",
        }
    }

    /// Run the full pipeline: extract (or reuse), transform, load.
    pub async fn run<E: Extractor + ?Sized>(&mut self, extractor: &E) -> Result<RunMetrics> {
        let mut checkpoint = JobCheckpoint::create(&self.config.paths.checkpoint_dir, &self.job_id)?;
        let extraction_cp = ExtractionCheckpoint::new(&self.config.paths.checkpoint_dir);
        let mut metrics = RunMetrics::new(&self.job_id);

        // ---- Extraction phase ----
        self.advance(PipelinePhase::Extracting)?;
        checkpoint.update_phase(Phase::Extraction, PhaseStatus::Running, None)?;

        let state = extraction_cp.load();
        let extraction_outcome: Result<(PathBuf, bool)> = if state.skip_extraction {
            info!("skip_extraction is set - reusing the latest extracted artifact");
            find_latest_artifact(&self.config.paths.extracted_dir(), EXTRACTED_ARTIFACT_PREFIX)
                .map(|path| (path, false))
        } else {
            let window = ExtractionWindow {
                start_date: extraction_cp.recommended_start_date(&self.config.extraction),
                job_id: self.job_id.clone(),
            };
            info!(start_date = %window.start_date, "Extraction window");
            extractor.extract(&window).await.map(|path| (path, true))
        };

        let (extracted, freshly_extracted) = match extraction_outcome {
            Ok(value) => value,
            Err(e) => {
                checkpoint.update_phase(Phase::Extraction, PhaseStatus::Failed, None)?;
                return self.fail(e, checkpoint, metrics, false, &extraction_cp);
            },
        };
        info!(artifact = %extracted.display(), "Extraction phase complete");
        checkpoint.update_phase(
            Phase::Extraction,
            PhaseStatus::Completed,
            Some(phase_details(&[("artifact", extracted.display().to_string())])),
        )?;
        metrics.extraction.success = true;
        if freshly_extracted {
            extraction_cp.advance(
                Utc::now().date_naive(),
                &self.config.environment,
                self.data_store_name(),
            )?;
        }

        self.transform_and_load(extracted, checkpoint, extraction_cp, metrics)
            .await
    }

    /// Run from an already-extracted (or already-transformed) file.
    pub async fn run_from_file(&mut self, source: &Path) -> Result<RunMetrics> {
        let mut checkpoint = JobCheckpoint::create(&self.config.paths.checkpoint_dir, &self.job_id)?;
        let extraction_cp = ExtractionCheckpoint::new(&self.config.paths.checkpoint_dir);
        let mut metrics = RunMetrics::new(&self.job_id);

        self.advance(PipelinePhase::Extracting)?;
        info!(source = %source.display(), "Running from existing file; extraction skipped");
        checkpoint.update_phase(Phase::Extraction, PhaseStatus::Skipped, None)?;
        metrics.extraction.success = true;

        if is_target_document(source)? {
            // Already transformed; go straight to loading.
            self.advance(PipelinePhase::Transforming)?;
            checkpoint.update_phase(Phase::Transformation, PhaseStatus::Skipped, None)?;
            metrics.transformation.success = true;
            self.load_phase(source.to_path_buf(), checkpoint, extraction_cp, metrics)
                .await
        } else {
            self.transform_and_load(source.to_path_buf(), checkpoint, extraction_cp, metrics)
                .await
        }
    }

    async fn transform_and_load(
        &mut self,
        extracted: PathBuf,
        mut checkpoint: JobCheckpoint,
        extraction_cp: ExtractionCheckpoint,
        mut metrics: RunMetrics,
    ) -> Result<RunMetrics> {
        // ---- Transformation phase ----
        self.advance(PipelinePhase::Transforming)?;
        checkpoint.update_phase(Phase::Transformation, PhaseStatus::Running, None)?;

        let cacheable: std::collections::HashSet<String> =
            self.registry.join_tables().into_iter().collect();
        let transform_outcome = tokio::task::block_in_place(|| {
            let cache = JoinCache::build(
                &extracted,
                &cacheable,
                self.config.join_cache.per_table_cap,
            )?;
            let engine = TransformEngine::new(
                self.registry,
                &cache,
                &self.config.coercion.boolean_columns,
                &self.config.transform,
            );
            engine.transform(&extracted, &self.config.paths.transformed_dir(), &self.job_id)
        });

        let outcome = match transform_outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                checkpoint.update_phase(Phase::Transformation, PhaseStatus::Failed, None)?;
                return self.fail(e, checkpoint, metrics, true, &extraction_cp);
            },
        };

        metrics.extraction.records = outcome.source_records;
        metrics.transformation = PhaseMetrics {
            records: outcome.transformed_records,
            tables: outcome.per_table.len(),
            success: true,
        };
        metrics.dropped_records = outcome.dropped_records;

        // Fingerprint the artifact so recovery can verify it later.
        match silo_common::checksum::artifact_sha256(&outcome.artifact) {
            Ok(sha256) => checkpoint.record_artifact(&outcome.artifact, &sha256)?,
            Err(e) => error!(error = %e, "Failed to fingerprint artifact"),
        }
        checkpoint.update_phase(
            Phase::Transformation,
            PhaseStatus::Completed,
            Some(phase_details(&[
                ("artifact", outcome.artifact.display().to_string()),
                ("records", outcome.transformed_records.to_string()),
            ])),
        )?;

        self.load_phase(outcome.artifact, checkpoint, extraction_cp, metrics)
            .await
    }

    async fn load_phase(
        &mut self,
        artifact: PathBuf,
        mut checkpoint: JobCheckpoint,
        extraction_cp: ExtractionCheckpoint,
        mut metrics: RunMetrics,
    ) -> Result<RunMetrics> {
        self.advance(PipelinePhase::Loading)?;
        checkpoint.update_phase(Phase::Loading, PhaseStatus::Running, None)?;

        let engine = LoadEngine::new(self.destination, &self.config.load);
        let load_outcome = engine.load_path_with(&artifact, &mut checkpoint).await;

        let result: LoadResult = match load_outcome {
            Ok(result) => result,
            Err(e) => {
                checkpoint.update_phase(Phase::Loading, PhaseStatus::Failed, None)?;
                return self.fail(e, checkpoint, metrics, true, &extraction_cp);
            },
        };

        metrics.loading = PhaseMetrics {
            records: result.total_records,
            tables: result.loaded_table_count,
            success: result.success,
        };
        for failure in &result.failed_tables {
            metrics.errors.push(format!("{}: {}", failure.table, failure.error));
        }

        if !result.success {
            checkpoint.update_phase(Phase::Loading, PhaseStatus::Failed, None)?;
            let e = EtlError::TableLoad {
                table: result
                    .failed_tables
                    .first()
                    .map(|f| f.table.clone())
                    .unwrap_or_else(|| "<none>".to_string()),
                reason: "load phase reported failure".into(),
            };
            return self.fail(e, checkpoint, metrics, true, &extraction_cp);
        }

        checkpoint.update_phase(Phase::Loading, PhaseStatus::Completed, None)?;
        checkpoint.complete(true)?;
        extraction_cp.set_skip_extraction(false)?;
        self.advance(PipelinePhase::Succeeded)?;

        metrics.success = true;
        metrics.finish();
        metrics.save(&self.config.paths.log_dir);
        info!(
            job_id = %self.job_id,
            duration_seconds = metrics.duration_seconds,
            records = metrics.loading.records,
            "Pipeline completed successfully"
        );
        Ok(metrics)
    }

    /// Common failure path: terminal checkpoint, metrics, skip-flag rule.
    fn fail(
        &mut self,
        e: EtlError,
        mut checkpoint: JobCheckpoint,
        mut metrics: RunMetrics,
        extraction_succeeded: bool,
        extraction_cp: &ExtractionCheckpoint,
    ) -> Result<RunMetrics> {
        error!(job_id = %self.job_id, error = %e, "Pipeline failed");
        metrics.errors.push(e.to_string());
        metrics.finish();
        metrics.save(&self.config.paths.log_dir);

        if extraction_succeeded {
            // Keep the extracted artifact; the next run skips source systems.
            if let Err(flag_err) = extraction_cp.set_skip_extraction(true) {
                error!(error = %flag_err, "Failed to set skip_extraction flag");
            }
            info!("Extraction succeeded but pipeline failed - next run will reuse the extracted artifact");
        }
        if let Err(cp_err) = checkpoint.complete(false) {
            error!(error = %cp_err, "Failed to finalize job checkpoint");
        }
        self.phase = PipelinePhase::Failed;
        Err(e)
    }
}

fn phase_details(pairs: &[(&str, String)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
        .collect()
}

/// Whether a document file is already a target document (has a `tables`
/// block) as opposed to an extracted document.
fn is_target_document(path: &Path) -> Result<bool> {
    let entries = crate::document::scan_target_tables(crate::document::open_reader(path)?);
    Ok(matches!(entries, Ok(ref e) if !e.is_empty()))
}
