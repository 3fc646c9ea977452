mod common;

use common::*;
use groovedb::catalog::{Column, ColumnType, DatasetKeys, Schema};
use groovedb::dsl;
use groovedb::executor::{self, Planner};
use groovedb::storage::Value;
use groovedb::ErrorKind;
use tempfile::TempDir;

#[test]
fn test_events_example() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);
    db.put("events", vec![event(1, 100, "a"), event(2, 101, "b")], None)
        .unwrap();

    let mut cursor = db
        .query("select id, payload from events where id = 1", None)
        .unwrap();
    assert_eq!(cursor.column_names(), vec!["id", "payload"]);
    let rows = cursor.collect_rows().unwrap();
    assert_eq!(rows, vec![vec![Value::Int64(1), Value::from("a")]]);
}

#[test]
fn test_select_all_returns_ingested_rows_in_row_id_order() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    db.create_dataset(
        "readings",
        Schema::from_columns(vec![
            Column::new("sensor", ColumnType::String),
            Column::new("value", ColumnType::Float64),
            Column::new("ok", ColumnType::Boolean),
        ]),
        DatasetKeys::default(),
    )
    .unwrap();

    let mut expected = Vec::new();
    for call in 0..3i64 {
        let records: Vec<_> = (0..50i64)
            .map(|i| {
                let n = call * 50 + i;
                let value = if n % 7 == 0 {
                    Value::Null
                } else {
                    Value::Float64(n as f64 / 4.0)
                };
                expected.push(vec![
                    Value::String(format!("s{}", 149 - n)),
                    value.clone(),
                    Value::Boolean(n % 2 == 0),
                ]);
                record(&[
                    ("sensor", Value::String(format!("s{}", 149 - n))),
                    ("value", value),
                    ("ok", Value::Boolean(n % 2 == 0)),
                ])
            })
            .collect();
        db.put("readings", records, None).unwrap();
    }

    let rows = db
        .query("select * from readings", None)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, expected);
}

#[test]
fn test_keyed_select_all_is_key_then_row_id_order() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);
    db.put("events", vec![event(2, 10, "first")], None).unwrap();
    db.put("events", vec![event(1, 20, "second")], None).unwrap();
    db.put("events", vec![event(2, 30, "third"), event(-5, 40, "fourth")], None)
        .unwrap();

    let rows = db
        .query("select * from events", None)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(ints(&rows, 0), vec![-5, 1, 2, 2]);
    // equal keys keep ingest order
    assert_eq!(ints(&rows, 1), vec![40, 20, 10, 30]);
}

#[test]
fn test_int_widens_into_float_column() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    db.create_dataset(
        "m",
        Schema::from_columns(vec![Column::new("x", ColumnType::Float64)]),
        DatasetKeys::default(),
    )
    .unwrap();
    db.put("m", vec![record(&[("x", Value::Int64(3))])], None)
        .unwrap();
    let rows = db.query("select x from m where x > 2", None).unwrap().collect_rows().unwrap();
    assert_eq!(rows, vec![vec![Value::Float64(3.0)]]);
}

#[test]
fn test_group_by_treats_signed_zeros_as_one_group() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    db.create_dataset(
        "m",
        Schema::from_columns(vec![
            Column::new("x", ColumnType::Float64),
            Column::new("n", ColumnType::Int64),
        ]),
        DatasetKeys::default(),
    )
    .unwrap();
    let records = [-0.0, 0.0, 1.5, -0.0]
        .iter()
        .enumerate()
        .map(|(i, x)| record(&[("x", Value::Float64(*x)), ("n", Value::Int64(i as i64))]))
        .collect();
    db.put("m", records, None).unwrap();

    let rows = db
        .query("select x, count(*), sum(n) from m group by x", None)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::Float64(0.0), Value::Int64(3), Value::Int64(4)],
            vec![Value::Float64(1.5), Value::Int64(1), Value::Int64(2)],
        ]
    );
}

#[test]
fn test_malformed_row_does_not_abort_siblings() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);

    let mut records: Vec<_> = (0..5).map(|i| event(i, i, "ok")).collect();
    records.insert(
        2,
        record(&[("id", Value::from("not a number")), ("ts", Value::Int64(0))]),
    );
    let outcome = db.put("events", records, None).unwrap();
    assert_eq!(outcome.accepted, 5);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].row, 2);
    assert!(outcome.seq().is_some());

    let rows = db.query("select id from events", None).unwrap().collect_rows().unwrap();
    assert_eq!(rows.len(), 5);

    // missing non-null column and unknown column are row failures too
    let outcome = db
        .put(
            "events",
            vec![
                record(&[("ts", Value::Int64(1))]),
                record(&[("id", Value::Int64(9)), ("color", Value::from("red"))]),
                event(10, 1, "fine"),
            ],
            None,
        )
        .unwrap();
    assert_eq!(outcome.accepted, 1);
    let failed: Vec<usize> = outcome.failures.iter().map(|f| f.row).collect();
    assert_eq!(failed, vec![0, 1]);
}

fn metrics(db: &groovedb::Database) {
    db.create_dataset(
        "metrics",
        Schema::from_columns(vec![
            Column::new("host", ColumnType::String).nullable(false),
            Column::new("ts", ColumnType::Int64).nullable(false),
            Column::new("cpu", ColumnType::Float64),
        ]),
        DatasetKeys::partition(["host"]).with_sort(["ts"]),
    )
    .unwrap();
    let hosts = ["alpha", "beta", "gamma"];
    let records = (0..300i64)
        .map(|i| {
            record(&[
                ("host", Value::from(hosts[(i % 3) as usize])),
                ("ts", Value::Int64(i / 3)),
                ("cpu", Value::Float64((i % 17) as f64)),
            ])
        })
        .collect();
    db.put("metrics", records, None).unwrap();
}

#[test]
fn test_pushdown_matches_unpushed_scan() {
    let dir = TempDir::new().unwrap();
    let db = open_with(&dir, |c| c.scan_chunk_size(16));
    metrics(&db);

    let queries = [
        "select host, ts, cpu from metrics where host = 'beta'",
        "select ts, cpu from metrics where host = 'beta' and ts >= 10 and ts < 20",
        "select ts from metrics where host = 'gamma' and ts between 95 and 200",
        "select ts from metrics where host = 'alpha' and ts > 40 and cpu > 3.5",
        "select ts from metrics where ts < 5 and host = 'alpha'",
        "select ts from metrics where host = 'delta'",
        "select host, ts from metrics where host = 'beta' or ts = 3",
    ];
    for text in queries {
        let query = dsl::parse(text).unwrap();
        let lease = db.catalog().lease("metrics").unwrap();
        let unoptimized = Planner::new(lease.def()).plan(&query).unwrap();
        assert!(unoptimized.scan().unwrap().range.is_full());
        let mut full = executor::execute(
            &unoptimized,
            lease,
            db.storage(),
            db.storage().snapshot(),
            Vec::new(),
            db.context(),
        )
        .unwrap();
        let expected = full.collect_rows().unwrap();

        let rows = db.query(text, None).unwrap().collect_rows().unwrap();
        assert_eq!(rows, expected, "{}", text);
    }

    let plan = db
        .compile("select ts from metrics where host = 'beta' and ts >= 10 and ts < 20")
        .unwrap();
    assert!(!plan.scan().unwrap().range.is_full());
    assert_eq!(plan.scan().unwrap().projection, vec![0, 1]);
}

#[test]
fn test_pushdown_reads_fewer_steps() {
    let dir = TempDir::new().unwrap();
    let db = open_with(&dir, |c| c.scan_chunk_size(16));
    metrics(&db);

    let steps = |text: &str| {
        let before = db.storage().scan_steps();
        db.query(text, None).unwrap().collect_rows().unwrap();
        db.storage().scan_steps() - before
    };
    let narrowed = steps("select ts from metrics where host = 'beta' and ts < 10");
    let full = steps("select ts from metrics where cpu < 100");
    assert!(narrowed < full, "{} vs {}", narrowed, full);
}

#[test]
fn test_limit_one_uses_fewer_scan_steps() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);
    let records = (0..1000).map(|i| event(i, i * 10, "x")).collect();
    db.put("events", records, None).unwrap();

    let before = db.storage().scan_steps();
    let all = db.query("select * from events", None).unwrap().collect_rows().unwrap();
    let unlimited = db.storage().scan_steps() - before;
    assert_eq!(all.len(), 1000);

    let before = db.storage().scan_steps();
    let one = db
        .query("select * from events limit 1", None)
        .unwrap()
        .collect_rows()
        .unwrap();
    let limited = db.storage().scan_steps() - before;
    assert_eq!(one.len(), 1);
    assert!(limited < unlimited, "{} vs {}", limited, unlimited);
}

#[test]
fn test_order_limit_offset_and_aggregates() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    metrics(&db);

    let rows = db
        .query(
            "select ts from metrics where host = 'alpha' order by ts desc limit 3 offset 2",
            None,
        )
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(ints(&rows, 0), vec![97, 96, 95]);

    // ordering by a column that is not returned
    let rows = db
        .query(
            "select cpu from metrics where host = 'beta' order by ts limit 2",
            None,
        )
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Float64(1.0)], vec![Value::Float64(4.0)]]);

    let mut cursor = db
        .query(
            "select host, count(*) as n, max(ts) from metrics group by host order by host",
            None,
        )
        .unwrap();
    assert_eq!(cursor.column_names(), vec!["host", "n", "max(ts)"]);
    let rows = cursor.collect_rows().unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::from("alpha"), Value::Int64(100), Value::Int64(99)],
            vec![Value::from("beta"), Value::Int64(100), Value::Int64(99)],
            vec![Value::from("gamma"), Value::Int64(100), Value::Int64(99)],
        ]
    );
}

#[test]
fn test_compile_errors() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);

    let err = db.query("select id events", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
    let detail = err.detail().unwrap();
    assert_eq!(detail["position"], 10);
    assert_eq!(detail["expected"], "FROM");

    let err = db.query("select nope from events", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SemanticError);

    let err = db.query("select id from events where payload > 3", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SemanticError);

    let err = db.query("select id from missing", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let deep = format!(
        "select id from events where {}id = 1{}",
        "(".repeat(50_000),
        ")".repeat(50_000)
    );
    let err = db.query(&deep, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
    assert_eq!(err.detail().unwrap()["expected"], "shallower nesting");
    // the engine keeps serving afterwards
    assert!(db.query("select id from events", None).is_ok());
}

#[test]
fn test_division_by_zero_is_execution_error() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    create_events(&db);
    db.put("events", vec![event(1, 0, "a")], None).unwrap();

    let err = db
        .query("select id / ts from events", None)
        .unwrap()
        .collect_rows()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
}

#[test]
fn test_sort_ceiling_and_spill() {
    let dir = TempDir::new().unwrap();
    let spill = TempDir::new().unwrap();
    let records: Vec<_> = (0..2000).map(|i| event(i, (i * 7919) % 2000, "payload")).collect();

    let db = open_with(&dir, |c| c.sort_memory_limit(4096));
    create_events(&db);
    db.put("events", records.clone(), None).unwrap();
    let err = db
        .query("select ts from events order by ts", None)
        .unwrap()
        .collect_rows()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    drop(db);

    let db = open_with(&dir, |c| {
        c.sort_memory_limit(4096).spill(true).spill_dir(spill.path())
    });
    let rows = db
        .query("select ts from events order by ts", None)
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(ints(&rows, 0), (0..2000).collect::<Vec<_>>());
}
