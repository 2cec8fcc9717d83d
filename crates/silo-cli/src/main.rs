//! silo - transform-and-load pipeline CLI

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use silo_common::logging::{init_logging, LogConfig};
use silo_etl::checkpoint::ExtractionCheckpoint;
use silo_etl::config::{DataStore, EtlConfig};
use silo_etl::document::find_latest_artifact;
use silo_etl::joincache::JoinCache;
use silo_etl::load::{Destination, LoadEngine, PgDestination, SchemaCatalog, SqliteDestination};
use silo_etl::mapping::MappingRegistry;
use silo_etl::pipeline::{ExtractionWindow, Extractor, Pipeline, EXTRACTED_ARTIFACT_PREFIX};
use silo_etl::recovery::{Recovery, TARGET_ARTIFACT_PREFIX};
use silo_etl::transform::TransformEngine;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "silo")]
#[command(author, version, about = "Transform-and-load pipeline with checkpointed recovery")]
struct Cli {
    /// Override the mappings file from configuration
    #[arg(short, long, global = true)]
    mappings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline (extract or reuse, transform, load)
    Run {
        /// Start from an existing extracted or transformed file
        #[arg(long)]
        from_file: Option<PathBuf>,
    },

    /// Transform an extracted document into a target document
    Transform {
        /// Extracted document path
        input: PathBuf,
    },

    /// Load a transformed artifact into the destination store
    Load {
        /// Target document path
        artifact: PathBuf,
    },

    /// Recover outstanding tables from a prior transformed artifact
    Recover {
        /// Artifact to recover from (default: the newest on disk)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Tables to skip, comma separated
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },

    /// Validate a transformed artifact without loading it
    Validate {
        /// Target document path
        artifact: PathBuf,
    },

    /// Show checkpoint state and the recommended next start date
    Status,
}

/// Stand-in extractor for deployments where an external extractor delivers
/// documents into the extracted-artifacts directory.
struct DropDirExtractor {
    dir: PathBuf,
}

#[async_trait]
impl Extractor for DropDirExtractor {
    async fn extract(&self, window: &ExtractionWindow) -> silo_etl::Result<PathBuf> {
        info!(
            start_date = %window.start_date,
            dir = %self.dir.display(),
            "Picking up the latest externally extracted artifact"
        );
        find_latest_artifact(&self.dir, EXTRACTED_ARTIFACT_PREFIX)
    }
}

async fn connect_destination(config: &EtlConfig) -> Result<Box<dyn Destination>> {
    let catalog = match &config.paths.schema_catalog_file {
        Some(path) => Some(SchemaCatalog::from_path(path)?),
        None => None,
    };
    let destination: Box<dyn Destination> = match config.data_store {
        DataStore::Postgres => Box::new(
            PgDestination::connect(
                &config.database_url,
                config.load.connect_timeout_secs,
                catalog,
            )
            .await?,
        ),
        DataStore::Sqlite => Box::new(
            SqliteDestination::connect(
                &config.database_url,
                config.load.connect_timeout_secs,
                catalog,
            )
            .await?,
        ),
    };
    Ok(destination)
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env()?;
    init_logging(&log_config)?;

    let cli = Cli::parse();
    let config = EtlConfig::load_with_mappings(cli.mappings.as_deref())?;

    match cli.command {
        Command::Run { from_file } => {
            let registry = MappingRegistry::from_path(&config.paths.mappings_file)?;
            let destination = connect_destination(&config).await?;
            let mut pipeline = Pipeline::new(&config, &registry, destination.as_ref())?;

            let metrics = match from_file {
                Some(path) => pipeline.run_from_file(&path).await?,
                None => {
                    let extractor = DropDirExtractor {
                        dir: config.paths.extracted_dir(),
                    };
                    pipeline.run(&extractor).await?
                },
            };
            info!(
                job_id = %metrics.job_id,
                records_loaded = metrics.loading.records,
                tables_loaded = metrics.loading.tables,
                duration_seconds = metrics.duration_seconds,
                "Run complete"
            );
        },

        Command::Transform { input } => {
            config.paths.ensure_directories()?;
            let registry = MappingRegistry::from_path(&config.paths.mappings_file)?;
            let cacheable: HashSet<String> = registry.join_tables().into_iter().collect();
            let cache = JoinCache::build(&input, &cacheable, config.join_cache.per_table_cap)?;
            let engine = TransformEngine::new(
                &registry,
                &cache,
                &config.coercion.boolean_columns,
                &config.transform,
            );

            let job_id = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let outcome =
                engine.transform(&input, &config.paths.transformed_dir(), &job_id)?;
            info!(
                artifact = %outcome.artifact.display(),
                records = outcome.transformed_records,
                tables = outcome.per_table.len(),
                "Transform complete"
            );
        },

        Command::Load { artifact } => {
            let destination = connect_destination(&config).await?;
            let engine = LoadEngine::new(destination.as_ref(), &config.load);
            let result = engine.load_path(&artifact).await?;
            info!(
                success = result.success,
                loaded = result.loaded_table_count,
                failed = result.failed_tables.len(),
                records = result.total_records,
                "Load complete"
            );
            if !result.success {
                anyhow::bail!("load reported failure");
            }
        },

        Command::Recover { file, skip } => {
            let destination = connect_destination(&config).await?;
            let recovery = Recovery::new(destination.as_ref(), &config);
            let result = recovery.recover(file.as_deref(), &skip).await?;
            info!(
                success = result.success,
                loaded = result.loaded_table_count,
                failed = result.failed_tables.len(),
                "Recovery complete"
            );
            if !result.success {
                anyhow::bail!("recovery reported failure");
            }
        },

        Command::Validate { artifact } => {
            let destination = connect_destination(&config).await?;
            let recovery = Recovery::new(destination.as_ref(), &config);
            let issues = recovery.validate_artifact(&artifact)?;
            if issues.is_empty() {
                info!("Artifact validation found no issues");
            } else {
                for (table, findings) in &issues {
                    warn!(table = %table, findings = ?findings, "Validation findings");
                }
                anyhow::bail!("validation found issues in {} tables", issues.len());
            }
        },

        Command::Status => {
            let checkpoint = ExtractionCheckpoint::new(&config.paths.checkpoint_dir);
            let state = checkpoint.load();
            info!(
                last_extraction_date = ?state.last_extraction_date,
                last_extraction_timestamp = ?state.last_extraction_timestamp,
                environment = %state.environment,
                skip_extraction = state.skip_extraction,
                "Extraction checkpoint"
            );
            info!(
                recommended_start_date = %checkpoint.recommended_start_date(&config.extraction),
                "Next incremental window"
            );
            match find_latest_artifact(&config.paths.transformed_dir(), TARGET_ARTIFACT_PREFIX) {
                Ok(artifact) => info!(artifact = %artifact.display(), "Latest transformed artifact"),
                Err(_) => info!("No transformed artifacts on disk"),
            }
        },
    }

    Ok(())
}
