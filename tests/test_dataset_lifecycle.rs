mod common;

use std::time::Duration;

use common::*;
use groovedb::catalog::{Column, ColumnType, DatasetKeys, GenerationState, Schema};
use groovedb::storage::Value;
use groovedb::ErrorKind;
use tempfile::TempDir;

#[test]
fn test_cursor_sees_rows_committed_before_it_opened() {
    let dir = TempDir::new().unwrap();
    let db = open_with(&dir, |c| c.scan_chunk_size(4).page_rows(4));
    create_events(&db);
    db.put("events", (0..20).map(|i| event(i, i, "old")).collect(), None)
        .unwrap();

    let mut cursor = db.query("select id, payload from events", None).unwrap();
    let first = cursor.next_batch().unwrap().unwrap();
    assert!(first.num_rows() > 0);

    db.put("events", (20..40).map(|i| event(i, i, "new")).collect(), None)
        .unwrap();

    let mut seen = first.num_rows();
    while let Some(batch) = cursor.next_batch().unwrap() {
        seen += batch.num_rows();
    }
    assert_eq!(seen, 20);

    let rows = db.query("select id from events", None).unwrap().collect_rows().unwrap();
    assert_eq!(rows.len(), 40);
}

#[test]
fn test_storage_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let storage = db.storage();

    storage.put(b"k1".to_vec(), b"v1".to_vec()).unwrap();
    let snapshot = storage.snapshot();
    storage.put(b"k1".to_vec(), b"v2".to_vec()).unwrap();
    storage.put(b"k2".to_vec(), b"v1".to_vec()).unwrap();

    assert_eq!(&storage.get(&snapshot, b"k1").unwrap()[..], b"v1");
    assert!(storage.get(&snapshot, b"k2").is_err());
    let latest = storage.snapshot();
    assert_eq!(&storage.get(&latest, b"k1").unwrap()[..], b"v2");
}

#[test]
fn test_closing_cursor_releases_snapshot_and_lease() {
    let dir = TempDir::new().unwrap();
    let db = open_with(&dir, |c| c.scan_chunk_size(2).page_rows(2));
    create_events(&db);
    db.put("events", (0..50).map(|i| event(i, i, "x")).collect(), None)
        .unwrap();

    let generation = db.describe_dataset("events").unwrap().generation;
    let refs = db.catalog().ref_count(generation);
    let snapshots = db.storage().live_snapshots();

    let mut cursor = db.query("select * from events", None).unwrap();
    cursor.next_batch().unwrap().unwrap();
    assert_eq!(db.catalog().ref_count(generation), refs + 1);
    assert_eq!(db.storage().live_snapshots(), snapshots + 1);

    cursor.close();
    assert!(cursor.is_closed());
    assert_eq!(db.catalog().ref_count(generation), refs);
    assert_eq!(db.storage().live_snapshots(), snapshots);
    assert!(cursor.next_batch().unwrap().is_none());

    // Dropping without close releases too
    let mut cursor = db.query("select * from events", None).unwrap();
    cursor.next_batch().unwrap().unwrap();
    drop(cursor);
    assert_eq!(db.catalog().ref_count(generation), refs);
    assert_eq!(db.storage().live_snapshots(), snapshots);
}

#[test]
fn test_drop_twice_is_not_found() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);

    db.drop_dataset("events").unwrap();
    let err = db.drop_dataset("events").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(db.list_datasets().is_empty());

    let err = db.put("events", vec![event(1, 1, "a")], None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_dropped_generation_outlives_open_cursor() {
    let dir = TempDir::new().unwrap();
    let db = open_with(&dir, |c| c.scan_chunk_size(2).page_rows(2));
    create_events(&db);
    db.put("events", (0..10).map(|i| event(i, i, "x")).collect(), None)
        .unwrap();
    let generation = db.describe_dataset("events").unwrap().generation;

    let mut cursor = db.query("select id from events", None).unwrap();
    db.drop_dataset("events").unwrap();
    assert_eq!(
        db.catalog().generation_state(generation),
        Some(GenerationState::Retired)
    );

    // The reader still sees its generation
    assert_eq!(cursor.collect_rows().unwrap().len(), 10);
    assert_eq!(db.catalog().ref_count(generation), 0);

    assert_eq!(db.reclaim().unwrap(), vec![generation]);
    assert_eq!(db.catalog().generation_state(generation), None);

    // A new dataset of the same name starts empty at a fresh generation
    create_events(&db);
    let info = db.describe_dataset("events").unwrap();
    assert!(info.generation > generation);
    assert!(db
        .query("select * from events", None)
        .unwrap()
        .collect_rows()
        .unwrap()
        .is_empty());
}

#[test]
fn test_create_conflicts_and_invalid_definitions() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);

    let schema = Schema::from_columns(vec![Column::new("id", ColumnType::Int64)]);
    let err = db
        .create_dataset("events", schema.clone(), DatasetKeys::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaConflict);

    let err = db
        .create_dataset("other", schema, DatasetKeys::partition(["missing"]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[test]
fn test_get_returns_latest_row_for_key() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);
    db.put("events", vec![event(1, 100, "first"), event(2, 5, "b")], None)
        .unwrap();
    db.put("events", vec![event(1, 200, "second")], None).unwrap();

    let row = db.get("events", &[Value::Int64(1)], None).unwrap();
    assert_eq!(
        row,
        vec![Value::Int64(1), Value::Int64(200), Value::from("second")]
    );

    let err = db.get("events", &[Value::Int64(3)], None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = db.get("events", &[Value::from("1")], None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SemanticError);
}

#[test]
fn test_session_rows_are_private_until_flushed() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);

    let outcome = db
        .put("events", vec![event(7, 1, "buffered")], Some("s1"))
        .unwrap();
    assert_eq!(outcome.accepted, 1);
    assert_eq!(outcome.seq(), None);

    let mine = db
        .query("select payload from events where id = 7", Some("s1"))
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(mine, vec![vec![Value::from("buffered")]]);
    let others = db
        .query("select payload from events where id = 7", Some("s2"))
        .unwrap()
        .collect_rows()
        .unwrap();
    assert!(others.is_empty());
    assert!(db.get("events", &[Value::Int64(7)], None).is_err());

    assert!(db.flush("s1").unwrap().is_some());
    let row = db.get("events", &[Value::Int64(7)], None).unwrap();
    assert_eq!(row[2], Value::from("buffered"));
    assert_eq!(db.flush("s1").unwrap(), None);
}

#[test]
fn test_cancelled_and_timed_out_queries() {
    let dir = TempDir::new().unwrap();
    let db = open_with(&dir, |c| c.scan_chunk_size(8).page_rows(8));
    create_events(&db);
    db.put("events", (0..100).map(|i| event(i, i, "x")).collect(), None)
        .unwrap();

    let mut cursor = db.query("select * from events", None).unwrap();
    cursor.next_batch().unwrap().unwrap();
    cursor.token().cancel();
    let err = cursor.next_batch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(cursor.is_closed());

    let ctx = db.context().with_timeout(Some(Duration::ZERO));
    let mut cursor = db.query_with("select * from events", None, ctx).unwrap();
    let err = cursor.next_batch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir);
        create_events(&db);
        db.create_dataset(
            "gone",
            Schema::from_columns(vec![Column::new("x", ColumnType::Int64)]),
            DatasetKeys::default(),
        )
        .unwrap();
        db.put("events", (0..10).map(|i| event(i, i * 2, "p")).collect(), None)
            .unwrap();
        db.put("events", vec![event(99, 0, "pending")], Some("s"))
            .unwrap();
        db.drop_dataset("gone").unwrap();
        db.shutdown().unwrap();
    }

    let db = open(&dir);
    assert_eq!(db.list_datasets(), vec!["events".to_string()]);
    let rows = db
        .query("select id, ts from events where id < 3", None)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Int64(0), Value::Int64(0)],
            vec![Value::Int64(1), Value::Int64(2)],
            vec![Value::Int64(2), Value::Int64(4)],
        ]
    );
    // shutdown sealed the session buffer
    assert!(db.get("events", &[Value::Int64(99)], None).is_ok());

    // row ids continue after reopen
    db.put("events", vec![event(0, 500, "newer")], None).unwrap();
    let row = db.get("events", &[Value::Int64(0)], None).unwrap();
    assert_eq!(row[1], Value::Int64(500));
}

#[test]
fn test_compact_keeps_live_rows() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);
    db.put("events", (0..30).map(|i| event(i, i, "x")).collect(), None)
        .unwrap();
    db.create_dataset(
        "scratch",
        Schema::from_columns(vec![Column::new("x", ColumnType::Int64)]),
        DatasetKeys::default(),
    )
    .unwrap();
    db.put(
        "scratch",
        (0..30).map(|i| record(&[("x", Value::Int64(i))])).collect(),
        None,
    )
    .unwrap();
    db.drop_dataset("scratch").unwrap();

    db.compact().unwrap();
    let rows = db.query("select id from events", None).unwrap().collect_rows().unwrap();
    assert_eq!(ints(&rows, 0), (0..30).collect::<Vec<_>>());
}
