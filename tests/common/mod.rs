#![allow(dead_code)]

use groovedb::catalog::{Column, ColumnType, DatasetKeys, Schema};
use groovedb::storage::{Record, Value};
use groovedb::{Database, EngineConfig};
use tempfile::TempDir;

pub fn open(dir: &TempDir) -> Database {
    open_with(dir, |c| c)
}

pub fn open_with(dir: &TempDir, tweak: impl FnOnce(EngineConfig) -> EngineConfig) -> Database {
    Database::open(tweak(EngineConfig::new(dir.path()))).unwrap()
}

pub fn record(fields: &[(&str, Value)]) -> Record {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// `events {id int64 not null, ts int64, payload string}` keyed by id
pub fn create_events(db: &Database) {
    db.create_dataset(
        "events",
        Schema::from_columns(vec![
            Column::new("id", ColumnType::Int64).nullable(false),
            Column::new("ts", ColumnType::Int64),
            Column::new("payload", ColumnType::String),
        ]),
        DatasetKeys::partition(["id"]),
    )
    .unwrap();
}

pub fn event(id: i64, ts: i64, payload: &str) -> Record {
    record(&[
        ("id", Value::Int64(id)),
        ("ts", Value::Int64(ts)),
        ("payload", Value::from(payload)),
    ])
}

pub fn ints(rows: &[Vec<Value>], column: usize) -> Vec<i64> {
    rows.iter().filter_map(|r| r[column].as_i64()).collect()
}
