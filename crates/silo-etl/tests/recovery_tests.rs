//! Recovery semantics: idempotence, skip lists, artifact discovery

mod common;

use common::{record, MockDestination};
use serde_json::json;
use silo_etl::config::EtlConfig;
use silo_etl::document::ArtifactWriter;
use silo_etl::error::EtlError;
use silo_etl::recovery::Recovery;
use std::path::{Path, PathBuf};

fn test_config(root: &Path) -> EtlConfig {
    let mut config = EtlConfig::default();
    config.paths.output_dir = root.join("output");
    config.paths.checkpoint_dir = root.join("checkpoints");
    config.paths.log_dir = root.join("logs");
    config.paths.ensure_directories().unwrap();
    config
}

fn write_artifact(config: &EtlConfig, name: &str) -> PathBuf {
    let path = config.paths.transformed_dir().join(name);
    let mut writer = ArtifactWriter::create(&path, None, "2026-08-04T00:00:00Z").unwrap();
    writer.begin_table("dim_users", 2).unwrap();
    writer.write_record(&record(&[("user_id", json!(1))])).unwrap();
    writer.write_record(&record(&[("user_id", json!(2))])).unwrap();
    writer.end_table().unwrap();
    writer.begin_table("fct_events", 1).unwrap();
    writer.write_record(&record(&[("event_id", json!(9))])).unwrap();
    writer.end_table().unwrap();
    writer.finish().unwrap()
}

#[tokio::test]
async fn test_recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_artifact(&config, "target_data_job1.json");

    let dest = MockDestination::new();
    let recovery = Recovery::new(&dest, &config);

    // First run loads both tables.
    let first = recovery.recover(None, &[]).await.unwrap();
    assert!(first.success);
    assert_eq!(first.loaded_table_count, 2);
    assert_eq!(dest.rows("dim_users").len(), 2);

    // Second run against an unchanged destination is a no-op, still a success.
    let second = recovery.recover(None, &[]).await.unwrap();
    assert!(second.success);
    assert_eq!(second.loaded_table_count, 0);
    assert_eq!(second.total_records, 0);
    assert_eq!(dest.rows("dim_users").len(), 2);
}

#[tokio::test]
async fn test_recovery_verifies_recorded_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let artifact = write_artifact(&config, "target_data_job1.json");

    // A prior run recorded the artifact's digest in its job checkpoint.
    let digest = silo_common::checksum::artifact_sha256(&artifact).unwrap();
    let mut checkpoint =
        silo_etl::checkpoint::JobCheckpoint::create(&config.paths.checkpoint_dir, "job1").unwrap();
    checkpoint.record_artifact(&artifact, &digest).unwrap();

    let dest = MockDestination::new();
    let recovery = Recovery::new(&dest, &config);
    let result = recovery.recover(None, &[]).await.unwrap();

    assert!(result.success);
    assert_eq!(result.loaded_table_count, 2);
}

#[tokio::test]
async fn test_recovery_honors_skip_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_artifact(&config, "target_data_job1.json");

    let dest = MockDestination::new();
    let recovery = Recovery::new(&dest, &config);

    let result = recovery
        .recover(None, &["DIM_USERS".to_string()])
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.loaded_table_count, 1);
    assert!(dest.rows("dim_users").is_empty());
    assert_eq!(dest.rows("fct_events").len(), 1);
}

#[tokio::test]
async fn test_recovery_loads_only_missing_tables() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_artifact(&config, "target_data_job1.json");

    let dest = MockDestination::new();
    // dim_users already holds data in the destination.
    dest.tables
        .lock()
        .unwrap()
        .insert("dim_users".to_string(), vec![record(&[("user_id", json!(99))])]);

    let recovery = Recovery::new(&dest, &config);
    let result = recovery.recover(None, &[]).await.unwrap();

    assert!(result.success);
    assert_eq!(result.loaded_table_count, 1);
    // Pre-existing rows are untouched; only the missing table was loaded.
    assert_eq!(dest.rows("dim_users").len(), 1);
    assert_eq!(dest.rows("fct_events").len(), 1);
}

#[tokio::test]
async fn test_recovery_without_artifact_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let dest = MockDestination::new();
    let recovery = Recovery::new(&dest, &config);

    let err = recovery.recover(None, &[]).await.unwrap_err();
    assert!(matches!(err, EtlError::ArtifactNotFound(_)));
}

#[tokio::test]
async fn test_recovery_cleans_up_reduced_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_artifact(&config, "target_data_job1.json");

    let dest = MockDestination::new();
    let recovery = Recovery::new(&dest, &config);
    recovery.recover(None, &[]).await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(config.paths.transformed_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("recovery_data_"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_validate_artifact_reports_issues() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let path = config.paths.transformed_dir().join("target_data_bad.json");
    let mut writer = ArtifactWriter::create(&path, None, "2026-08-04T00:00:00Z").unwrap();
    writer.begin_table("dim_users", 1).unwrap();
    writer
        .write_record(&record(&[("user_id", json!(null)), ("email", json!("a@example.com"))]))
        .unwrap();
    writer.end_table().unwrap();
    writer.finish().unwrap();

    let dest = MockDestination::new();
    let recovery = Recovery::new(&dest, &config);
    let issues = recovery.validate_artifact(&path).unwrap();

    assert_eq!(issues.len(), 1);
    assert!(issues["dim_users"][0].contains("user_id"));
}
