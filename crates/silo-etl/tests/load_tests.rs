//! Load engine policy behavior against an in-memory destination

mod common;

use common::{record, MockDestination};
use serde_json::json;
use silo_etl::config::{LoadConfig, LoadStrategy};
use silo_etl::document::{ArtifactWriter, Record};
use silo_etl::load::{LoadEngine, NoopObserver};

fn load_config(threshold: usize, strategy: LoadStrategy) -> LoadConfig {
    LoadConfig {
        bulk_copy_threshold: threshold,
        strategy,
        retry_delay_ms: 1,
        ..LoadConfig::default()
    }
}

fn batch(table: &str, n: usize) -> (String, Vec<Record>) {
    let records = (0..n)
        .map(|i| record(&[("id", json!(i as i64)), ("name", json!(format!("r{}", i)))]))
        .collect();
    (table.to_string(), records)
}

#[tokio::test]
async fn test_bulk_threshold_boundary() {
    let dest = MockDestination::new();
    let config = load_config(3, LoadStrategy::ContinueOnError);
    let engine = LoadEngine::new(&dest, &config);

    // threshold - 1 records: row-insert path
    let result = engine
        .load_tables(vec![batch("dim_small", 2)], &mut NoopObserver)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(dest.row_tables(), vec!["dim_small"]);
    assert!(dest.bulk_tables().is_empty());

    // exactly threshold records: bulk path
    let result = engine
        .load_tables(vec![batch("dim_large", 3)], &mut NoopObserver)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(dest.bulk_tables(), vec!["dim_large"]);
}

#[tokio::test]
async fn test_bulk_transport_failure_falls_back_to_rows() {
    let dest = MockDestination::new();
    dest.break_bulk_transport();
    let config = load_config(2, LoadStrategy::ContinueOnError);
    let engine = LoadEngine::new(&dest, &config);

    let result = engine
        .load_tables(vec![batch("dim_users", 5)], &mut NoopObserver)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.total_records, 5);
    assert_eq!(dest.row_tables(), vec!["dim_users"]);
    assert_eq!(dest.rows("dim_users").len(), 5);
}

#[tokio::test]
async fn test_fail_fast_aborts_remaining_tables() {
    let dest = MockDestination::new();
    dest.fail_table("dim_bad");
    let config = load_config(100, LoadStrategy::FailFast);
    let engine = LoadEngine::new(&dest, &config);

    let result = engine
        .load_tables(
            vec![batch("dim_bad", 2), batch("dim_after", 2)],
            &mut NoopObserver,
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_tables.len(), 1);
    assert_eq!(result.failed_tables[0].table, "dim_bad");
    // The table after the failure was never attempted.
    assert!(dest.rows("dim_after").is_empty());
    assert_eq!(result.loaded_table_count, 0);
}

#[tokio::test]
async fn test_continue_on_error_attempts_remaining_tables() {
    let dest = MockDestination::new();
    dest.fail_table("dim_bad");
    let config = load_config(100, LoadStrategy::ContinueOnError);
    let engine = LoadEngine::new(&dest, &config);

    let result = engine
        .load_tables(
            vec![batch("dim_bad", 2), batch("dim_after", 2)],
            &mut NoopObserver,
        )
        .await
        .unwrap();

    // At least one table loaded successfully => overall success.
    assert!(result.success);
    assert_eq!(result.loaded_table_count, 1);
    assert_eq!(result.failed_tables[0].table, "dim_bad");
    assert_eq!(dest.rows("dim_after").len(), 2);
}

#[tokio::test]
async fn test_empty_tables_are_skipped() {
    let dest = MockDestination::new();
    let config = load_config(100, LoadStrategy::ContinueOnError);
    let engine = LoadEngine::new(&dest, &config);

    let result = engine
        .load_tables(
            vec![("dim_empty".to_string(), Vec::new()), batch("dim_users", 1)],
            &mut NoopObserver,
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.skipped_tables, vec!["dim_empty"]);
    assert_eq!(result.loaded_table_count, 1);
}

#[tokio::test]
async fn test_large_artifact_streams_table_by_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target_data_big.json");

    let mut writer = ArtifactWriter::create(&path, None, "2026-08-04T00:00:00Z").unwrap();
    writer.begin_table("dim_users", 2).unwrap();
    writer.write_record(&record(&[("user_id", json!(1))])).unwrap();
    writer.write_record(&record(&[("user_id", json!(2))])).unwrap();
    writer.end_table().unwrap();
    writer.begin_table("fct_events", 1).unwrap();
    writer.write_record(&record(&[("event_id", json!(9))])).unwrap();
    writer.end_table().unwrap();
    writer.finish().unwrap();

    let dest = MockDestination::new();
    let mut config = load_config(100, LoadStrategy::ContinueOnError);
    // Force the streaming path regardless of actual artifact size.
    config.large_artifact_bytes = 1;
    let engine = LoadEngine::new(&dest, &config);

    let result = engine.load_path(&path).await.unwrap();
    assert!(result.success);
    assert_eq!(result.loaded_table_count, 2);
    assert_eq!(result.total_records, 3);
    assert_eq!(dest.rows("dim_users").len(), 2);
    assert_eq!(dest.rows("fct_events").len(), 1);
}
