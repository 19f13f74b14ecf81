//! Integration tests for JSON drill tables on a local directory.

use chrono::{TimeZone, Utc};
use conflux_common::{EdgeFlags, OutputBatch, PolygonFailure, SummaryRecord};
use storage::{ObjectStorage, ResultStore, TableStore};

fn batch(wet: f64) -> OutputBatch {
    versioned_batch("0.0.1", wet)
}

fn versioned_batch(version: &str, wet: f64) -> OutputBatch {
    let date = Utc.with_ymd_and_hms(2001, 3, 14, 0, 12, 5).unwrap();
    let mut batch = OutputBatch::empty("scene-1", "ga_ls_wo_3", version, date);
    batch.records.push(SummaryRecord {
        polygon_id: "p1".to_string(),
        scene_id: "scene-1".to_string(),
        date,
        plugin_version: version.to_string(),
        measurements: [
            ("wet_percentage".to_string(), wet),
            ("invalid_percentage".to_string(), f64::NAN),
        ]
        .into_iter()
        .collect(),
        overflow: EdgeFlags {
            east: true,
            ..EdgeFlags::default()
        },
    });
    batch.failures.push(PolygonFailure {
        polygon_id: "p2".to_string(),
        message: "boom".to_string(),
    });
    batch
}

#[tokio::test]
async fn test_table_written_under_scene_date() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(ObjectStorage::local(dir.path()).unwrap());

    store.write_batch(&batch(50.0)).await.unwrap();

    let expected = dir
        .path()
        .join("20010314")
        .join("ga_ls_wo_3_0.0.1_scene-1_20010314-001205-000000.json");
    assert!(expected.exists(), "missing {}", expected.display());

    let table = store.read_table(&batch(50.0)).await.unwrap().unwrap();
    assert_eq!(table.drill, "ga_ls_wo_3");
    assert_eq!(table.version, "0.0.1");
    assert_eq!(table.records.len(), 1);
    assert_eq!(table.records[0].measurements["wet_percentage"], 50.0);
    assert!(table.records[0].measurements["invalid_percentage"].is_nan());
    assert!(table.records[0].overflow.east);
    assert_eq!(table.failures[0].polygon_id, "p2");
}

#[tokio::test]
async fn test_rewrite_replaces_table_and_marks_committed() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(ObjectStorage::local(dir.path()).unwrap());
    assert!(!store.is_committed("scene-1", "ga_ls_wo_3", "0.0.1").await.unwrap());

    store.write_batch(&batch(10.0)).await.unwrap();
    store.write_batch(&batch(20.0)).await.unwrap();

    assert!(store.is_committed("scene-1", "ga_ls_wo_3", "0.0.1").await.unwrap());
    assert!(!store.is_committed("scene-1", "ga_ls_wo_3", "0.0.2").await.unwrap());

    let day_dir = dir.path().join("20010314");
    assert_eq!(std::fs::read_dir(&day_dir).unwrap().count(), 1);
    let table = store.read_table(&batch(0.0)).await.unwrap().unwrap();
    assert_eq!(table.records[0].measurements["wet_percentage"], 20.0);
}

#[tokio::test]
async fn test_plugin_versions_keep_separate_tables() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(ObjectStorage::local(dir.path()).unwrap());

    store.write_batch(&versioned_batch("1.0.0", 10.0)).await.unwrap();
    store.write_batch(&versioned_batch("2.0.0", 20.0)).await.unwrap();

    assert!(store.is_committed("scene-1", "ga_ls_wo_3", "1.0.0").await.unwrap());
    assert!(store.is_committed("scene-1", "ga_ls_wo_3", "2.0.0").await.unwrap());

    let day_dir = dir.path().join("20010314");
    assert_eq!(std::fs::read_dir(&day_dir).unwrap().count(), 2);

    let v1 = store
        .read_table(&versioned_batch("1.0.0", 0.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v1.version, "1.0.0");
    assert_eq!(v1.records[0].plugin_version, "1.0.0");
    assert_eq!(v1.records[0].measurements["wet_percentage"], 10.0);

    let v2 = store
        .read_table(&versioned_batch("2.0.0", 0.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v2.version, "2.0.0");
    assert_eq!(v2.records[0].measurements["wet_percentage"], 20.0);
}

#[tokio::test]
async fn test_load_records_reads_every_table_of_one_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(ObjectStorage::local(dir.path()).unwrap());

    let mut later = versioned_batch("1.0.0", 30.0);
    later.scene_id = "scene-2".to_string();
    later.date = Utc.with_ymd_and_hms(2001, 4, 1, 0, 0, 0).unwrap();
    for record in &mut later.records {
        record.scene_id = "scene-2".to_string();
        record.date = later.date;
    }

    store.write_batch(&versioned_batch("1.0.0", 10.0)).await.unwrap();
    store.write_batch(&later).await.unwrap();
    store.write_batch(&versioned_batch("2.0.0", 20.0)).await.unwrap();

    let records = store.load_records("ga_ls_wo_3", "1.0.0").await.unwrap();
    let mut scenes: Vec<&str> = records.iter().map(|r| r.scene_id.as_str()).collect();
    scenes.sort();
    assert_eq!(scenes, vec!["scene-1", "scene-2"]);
    assert!(records.iter().all(|r| r.plugin_version == "1.0.0"));

    assert_eq!(store.load_records("ga_ls_wo_3", "2.0.0").await.unwrap().len(), 1);
    assert!(store.load_records("ga_ls_wo_3", "3.0.0").await.unwrap().is_empty());
}
