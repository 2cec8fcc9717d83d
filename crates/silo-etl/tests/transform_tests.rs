//! Transform engine behavior over real artifact files

mod common;

use common::{registry, table_mapping, write_extracted};
use serde_json::json;
use silo_etl::config::TransformConfig;
use silo_etl::document::load_target_document;
use silo_etl::joincache::JoinCache;
use silo_etl::transform::TransformEngine;
use std::collections::HashSet;

fn transform_config(workers: usize) -> TransformConfig {
    TransformConfig {
        batch_size: 2,
        workers,
        compression: false,
        compression_level: 1,
    }
}

#[test]
fn test_round_trip_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "users": {
                    "record_count": 3,
                    "records": [
                        {"id": 1, "email": "a@example.com"},
                        {"id": 2, "email": "b@example.com"},
                        {"id": 3, "email": "c@example.com"}
                    ]
                }
            }
        }),
    );

    let registry = registry(vec![(
        "dim_users",
        table_mapping(&["users"], "user_id", &[
            ("user_id", "users.id"),
            ("email", "users.email"),
        ]),
    )]);
    let cache = JoinCache::empty();
    let booleans = HashSet::new();
    let config = transform_config(1);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &config);

    let outcome = engine.transform(&extracted, dir.path(), "job1").unwrap();
    assert_eq!(outcome.source_records, 3);
    assert_eq!(outcome.per_table["dim_users"], 3);

    let doc = load_target_document(&outcome.artifact).unwrap();
    let table = &doc.tables["dim_users"];
    assert_eq!(table.record_count, 3);
    assert_eq!(table.data.len(), 3);
    for record in &table.data {
        assert!(record["user_id"].is_i64());
        assert!(record["email"].is_string());
        assert!(record["etl_timestamp"].is_string());
    }
}

#[test]
fn test_fan_out_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "users": {
                    "record_count": 1,
                    "records": [{"id": 7, "email": "x@example.com", "name": "Xan"}]
                }
            }
        }),
    );

    let registry = registry(vec![
        (
            "dim_users",
            table_mapping(&["users"], "user_id", &[
                ("user_id", "users.id"),
                ("email", "users.email"),
            ]),
        ),
        (
            "dim_contacts",
            table_mapping(&["users"], "contact_id", &[
                ("contact_id", "users.id"),
                ("contact_name", "users.name"),
            ]),
        ),
    ]);
    let cache = JoinCache::empty();
    let booleans = HashSet::new();
    let config = transform_config(1);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &config);

    let outcome = engine.transform(&extracted, dir.path(), "job2").unwrap();
    let doc = load_target_document(&outcome.artifact).unwrap();

    let users = &doc.tables["dim_users"].data[0];
    let contacts = &doc.tables["dim_contacts"].data[0];
    assert_eq!(users["user_id"], json!(7));
    assert_eq!(contacts["contact_id"], json!(7));
    // Columns from one mapping never leak into the other's output.
    assert!(!users.contains_key("contact_name"));
    assert!(!contacts.contains_key("email"));
}

#[test]
fn test_join_resolution_with_boolean_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "accounts": {
                    "record_count": 2,
                    "records": [{"id": 5}, {"id": 9}]
                },
                "account_flags": {
                    "record_count": 1,
                    "records": [{"a_id": 5, "flag": 1}]
                }
            }
        }),
    );

    let registry = registry(vec![(
        "dim_accounts",
        table_mapping(&["accounts", "account_flags"], "account_id", &[
            ("account_id", "accounts.id"),
            ("flag", "account_flags.flag"),
        ]),
    )]);
    let cacheable: HashSet<String> = registry.join_tables().into_iter().collect();
    assert_eq!(cacheable.len(), 1);
    let cache = JoinCache::build(&extracted, &cacheable, 1000).unwrap();
    let booleans: HashSet<String> = ["flag".to_string()].into_iter().collect();
    let config = transform_config(1);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &config);

    let outcome = engine.transform(&extracted, dir.path(), "job3").unwrap();
    let doc = load_target_document(&outcome.artifact).unwrap();
    let data = &doc.tables["dim_accounts"].data;

    assert_eq!(data.len(), 2);
    let matched = data.iter().find(|r| r["account_id"] == json!(5)).unwrap();
    assert_eq!(matched["flag"], json!(true));
    // Missing secondary record resolves to null, not an error.
    let unmatched = data.iter().find(|r| r["account_id"] == json!(9)).unwrap();
    assert_eq!(unmatched["flag"], json!(null));
}

#[test]
fn test_all_null_records_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "users": {
                    "record_count": 2,
                    "records": [
                        {"id": 1, "email": "a@example.com"},
                        {"unmapped_field": "ignored"}
                    ]
                }
            }
        }),
    );

    let registry = registry(vec![(
        "dim_users",
        table_mapping(&["users"], "user_id", &[
            ("user_id", "users.id"),
            ("email", "users.email"),
        ]),
    )]);
    let cache = JoinCache::empty();
    let booleans = HashSet::new();
    let config = transform_config(1);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &config);

    let outcome = engine.transform(&extracted, dir.path(), "job4").unwrap();
    assert_eq!(outcome.per_table["dim_users"], 1);

    let doc = load_target_document(&outcome.artifact).unwrap();
    assert_eq!(doc.tables["dim_users"].record_count, 1);
}

#[test]
fn test_pooled_pass_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<_> = (0..25)
        .map(|i| json!({"id": i, "email": format!("u{}@example.com", i)}))
        .collect();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "users": {"record_count": 25, "records": records},
                "user_notes": {
                    "record_count": 2,
                    "records": [{"user_id": 1, "note": "a"}, {"user_id": 2, "note": "b"}]
                }
            }
        }),
    );

    let registry = registry(vec![
        (
            "dim_users",
            table_mapping(&["users"], "user_id", &[
                ("user_id", "users.id"),
                ("email", "users.email"),
            ]),
        ),
        (
            "fct_notes",
            table_mapping(&["user_notes"], "user_id", &[
                ("user_id", "user_notes.user_id"),
                ("note", "user_notes.note"),
            ]),
        ),
    ]);
    let cache = JoinCache::empty();
    let booleans = HashSet::new();

    let sequential_config = transform_config(1);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &sequential_config);
    let sequential = engine.transform(&extracted, dir.path(), "seq").unwrap();

    let pooled_config = transform_config(3);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &pooled_config);
    let pooled = engine.transform(&extracted, dir.path(), "pool").unwrap();

    let seq_doc = load_target_document(&sequential.artifact).unwrap();
    let pool_doc = load_target_document(&pooled.artifact).unwrap();

    assert_eq!(seq_doc.tables.len(), pool_doc.tables.len());
    for (name, table) in &seq_doc.tables {
        let pooled_table = &pool_doc.tables[name];
        assert_eq!(table.record_count, pooled_table.record_count);
        // Same records in the same order; only etl_timestamp may differ.
        for (a, b) in table.data.iter().zip(&pooled_table.data) {
            assert_eq!(a["user_id"], b["user_id"]);
        }
    }
}

#[test]
fn test_gzip_artifact_output() {
    let dir = tempfile::tempdir().unwrap();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "users": {"record_count": 1, "records": [{"id": 1}]}
            }
        }),
    );

    let registry = registry(vec![(
        "dim_users",
        table_mapping(&["users"], "user_id", &[("user_id", "users.id")]),
    )]);
    let cache = JoinCache::empty();
    let booleans = HashSet::new();
    let config = TransformConfig {
        batch_size: 10,
        workers: 1,
        compression: true,
        compression_level: 1,
    };
    let engine = TransformEngine::new(&registry, &cache, &booleans, &config);

    let outcome = engine.transform(&extracted, dir.path(), "gz").unwrap();
    assert!(outcome.artifact.to_string_lossy().ends_with(".json.gz"));

    let doc = load_target_document(&outcome.artifact).unwrap();
    assert_eq!(doc.tables["dim_users"].record_count, 1);
}

#[test]
fn test_failed_write_leaves_no_complete_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let extracted = write_extracted(
        dir.path(),
        &json!({
            "identity": {
                "users": {"record_count": 1, "records": [{"id": 1}]}
            }
        }),
    );

    let registry = registry(vec![(
        "dim_users",
        table_mapping(&["users"], "user_id", &[("user_id", "users.id")]),
    )]);
    let cache = JoinCache::empty();
    let booleans = HashSet::new();
    let config = transform_config(1);
    let engine = TransformEngine::new(&registry, &cache, &booleans, &config);

    // Occupy the provisional path with a directory so the write fails
    // mid-setup; nothing complete-looking may appear at the final path.
    let final_path = dir.path().join("target_data_fail.json");
    std::fs::create_dir(dir.path().join("target_data_fail.json.tmp")).unwrap();

    let result = engine.transform_to(&extracted, &final_path);
    assert!(result.is_err());
    assert!(!final_path.exists());
}
