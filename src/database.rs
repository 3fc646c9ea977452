//! Database facade
//!
//! Owns one storage engine, catalog and batch builder, and wires them
//! together. Every method is synchronous; the server runs them on a blocking
//! worker pool.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batch::{AppendOutcome, BatchBuilder};
use crate::catalog::{
    Catalog, DatasetDef, DatasetInfo, DatasetKeys, GenerationId, GenerationState, Schema,
};
use crate::config::EngineConfig;
use crate::dsl;
use crate::error::{Error, Result};
use crate::executor::{self, Cursor, ExecContext, ExecOptions, Plan};
use crate::storage::key::{self, KeyEncoder};
use crate::storage::row::decode_row;
use crate::storage::{CompactionStats, Record, StorageEngine, StorageOptions, Value};

/// What a compaction pass did
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub reclaimed: Vec<GenerationId>,
    pub stats: CompactionStats,
}

/// A single-node dataset store
pub struct Database {
    config: EngineConfig,
    storage: Arc<StorageEngine>,
    catalog: Catalog,
    builder: BatchBuilder,
}

impl Database {
    /// Open (or create) a database under `config.data_dir`
    pub fn open(config: EngineConfig) -> Result<Self> {
        let storage = Arc::new(StorageEngine::open(
            &config.data_dir,
            StorageOptions::from(&config),
        )?);
        let catalog = Catalog::open(storage.clone())?;
        let builder = BatchBuilder::open(
            storage.clone(),
            &config.ingest_log_path(),
            config.batch_row_threshold,
            config.batch_byte_threshold,
            |generation| catalog.generation_state(generation) == Some(GenerationState::Active),
        )?;

        // generations dropped before a restart are reclaimed now
        let reclaimed = catalog.reclaim()?;
        info!(
            data_dir = %config.data_dir.display(),
            datasets = catalog.list().len(),
            reclaimed = reclaimed.len(),
            "database opened"
        );
        Ok(Self {
            config,
            storage,
            catalog,
            builder,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ========== Admin ==========

    pub fn create_dataset(
        &self,
        name: &str,
        schema: Schema,
        keys: DatasetKeys,
    ) -> Result<Arc<DatasetDef>> {
        self.catalog.create_dataset(name, schema, keys)
    }

    /// Soft-delete a dataset. Its generation is reclaimed right away when no
    /// reader holds it, otherwise once the last reader lets go.
    pub fn drop_dataset(&self, name: &str) -> Result<GenerationId> {
        let generation = self.catalog.drop_dataset(name)?;
        self.builder.discard_generation(generation);
        if let Err(e) = self.catalog.reclaim() {
            warn!(generation, error = %e, "reclaim after drop failed; will retry");
        }
        Ok(generation)
    }

    pub fn describe_dataset(&self, name: &str) -> Result<DatasetInfo> {
        self.catalog.describe(name)
    }

    pub fn list_datasets(&self) -> Vec<String> {
        self.catalog.list()
    }

    /// Physically delete dropped generations that are no longer referenced
    pub fn reclaim(&self) -> Result<Vec<GenerationId>> {
        self.catalog.reclaim()
    }

    /// Reclaim, then rewrite the data log without dead versions
    pub fn compact(&self) -> Result<CompactionReport> {
        let reclaimed = self.catalog.reclaim()?;
        let stats = self.storage.compact()?;
        Ok(CompactionReport { reclaimed, stats })
    }

    // ========== Put ==========

    /// Validate and ingest records.
    ///
    /// Invalid rows are reported individually and never abort valid siblings.
    /// Without a session the valid rows are durable when this returns.
    pub fn put(
        &self,
        dataset: &str,
        records: Vec<Record>,
        session: Option<&str>,
    ) -> Result<AppendOutcome> {
        let lease = self.catalog.lease(dataset)?;
        let generation = lease.generation();
        let outcome = self.guard(generation, self.builder.append(&lease, session, records))?;
        debug!(
            dataset,
            generation,
            accepted = outcome.accepted,
            rejected = outcome.failures.len(),
            seq = ?outcome.seq(),
            "put"
        );
        Ok(outcome)
    }

    /// Seal everything a session has buffered; returns the last sequence number
    pub fn flush(&self, session: &str) -> Result<Option<u64>> {
        let sealed = self.builder.flush(session)?;
        Ok(sealed.last().map(|b| b.seq))
    }

    /// Seal every buffered row of every session
    pub fn flush_all(&self) -> Result<usize> {
        self.builder.flush_all()
    }

    // ========== Get ==========

    /// Most recently written row with exactly this key, in schema order.
    ///
    /// `key` holds one value per key column, partition columns first. With a
    /// session, that session's unflushed rows count as written.
    pub fn get(&self, dataset: &str, key: &[Value], session: Option<&str>) -> Result<Vec<Value>> {
        let lease = self.catalog.lease(dataset)?;
        let def = lease.def().clone();
        let positions = def.key_positions();
        if key.len() != positions.len() {
            return Err(Error::InvalidDefinition(format!(
                "dataset '{}' has {} key columns, got {} values",
                dataset,
                positions.len(),
                key.len()
            )));
        }

        let mut key_values = Vec::with_capacity(key.len());
        for (&pos, value) in positions.iter().zip(key) {
            let column = &def.schema.columns()[pos];
            let value = value.clone().coerce_to(column.column_type).map_err(|v| {
                Error::TypeMismatch {
                    context: format!("key column '{}'", column.name),
                    expected: column.column_type.to_string(),
                    found: v.type_name().to_string(),
                }
            })?;
            key_values.push(value);
        }

        if let Some(session) = session {
            let pending = self.builder.pending_rows(def.generation, session);
            let hit = pending.into_iter().rev().find(|row| {
                positions
                    .iter()
                    .zip(&key_values)
                    .all(|(&p, v)| row[p] == *v)
            });
            if let Some(row) = hit {
                return Ok(row);
            }
        }

        let mut encoder = KeyEncoder::new(def.generation);
        for value in &key_values {
            encoder.push(value);
        }
        let lower = encoder.into_prefix();
        let end = key::rows_end(def.generation);
        let upper = match key::prefix_successor(&lower) {
            Some(upper) if upper < end => upper,
            _ => end,
        };

        let snapshot = self.storage.snapshot();
        let found = self.storage.last_key_in_range(&snapshot, &lower, &upper);
        let Some(row_key) = found else {
            return Err(Error::RowNotFound(dataset.to_string()));
        };
        let bytes = self.storage.get(&snapshot, &row_key)?;
        let row = self.guard(def.generation, decode_row(&bytes).map_err(|e| {
            Error::InvariantViolation {
                generation: def.generation,
                message: format!("undecodable row: {}", e),
            }
        }))?;
        Ok(row)
    }

    // ========== Query ==========

    /// Parse and compile a query against the current generation
    pub fn compile(&self, text: &str) -> Result<Plan> {
        let query = dsl::parse(text)?;
        let def = self.catalog.get(&query.source)?;
        executor::compile(&def, &query)
    }

    /// Render the optimized plan of a query
    pub fn explain(&self, text: &str) -> Result<String> {
        Ok(self.compile(text)?.to_string())
    }

    /// Fresh execution context carrying the configured limits and timeout
    pub fn context(&self) -> ExecContext {
        ExecContext::new(ExecOptions::from(&self.config)).with_timeout(self.config.query_timeout)
    }

    /// Run a query with the default context
    pub fn query(&self, text: &str, session: Option<&str>) -> Result<Cursor> {
        self.query_with(text, session, self.context())
    }

    /// Run a query; the returned cursor pins the generation and a snapshot
    /// until it is closed or dropped.
    pub fn query_with(&self, text: &str, session: Option<&str>, ctx: ExecContext) -> Result<Cursor> {
        let query = dsl::parse(text)?;
        let lease = self.catalog.lease(&query.source)?;
        let generation = lease.generation();
        let plan = self.guard(generation, executor::compile(lease.def(), &query))?;
        debug!(dataset = %plan.dataset, generation, plan = %plan, "query compiled");

        let (snapshot, overlay) = self.builder.read_view(generation, session);
        self.guard(
            generation,
            executor::execute(&plan, lease, &self.storage, snapshot, overlay, ctx),
        )
    }

    /// Poison the generation when a call hits an invariant violation
    fn guard<T>(&self, generation: GenerationId, result: Result<T>) -> Result<T> {
        if let Err(Error::InvariantViolation { message, .. }) = &result {
            self.catalog.poison(generation, message);
        }
        result
    }

    /// Seal all buffers before the process goes away
    pub fn shutdown(&self) -> Result<()> {
        let sealed = self.builder.flush_all()?;
        info!(sealed, "database shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Database {
        Database::open(EngineConfig::new(dir.path())).unwrap()
    }

    fn record(id: i64, ts: i64, payload: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".into(), Value::Int64(id));
        r.insert("ts".into(), Value::Int64(ts));
        r.insert("payload".into(), Value::from(payload));
        r
    }

    fn events(db: &Database) {
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

    #[test]
    fn test_get_returns_latest_row_for_key() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        events(&db);
        db.put("events", vec![record(1, 100, "a"), record(2, 101, "b")], None)
            .unwrap();
        db.put("events", vec![record(1, 102, "c")], None).unwrap();

        let row = db.get("events", &[Value::Int64(1)], None).unwrap();
        assert_eq!(
            row,
            vec![Value::Int64(1), Value::Int64(102), Value::from("c")]
        );
        let err = db.get("events", &[Value::Int64(9)], None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(db.get("events", &[], None).is_err());
    }

    #[test]
    fn test_session_rows_visible_to_same_session_only() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        events(&db);
        db.put("events", vec![record(1, 100, "a")], Some("s1")).unwrap();

        let mine = db.query("select id from events", Some("s1")).unwrap().collect_rows().unwrap();
        assert_eq!(mine, vec![vec![Value::Int64(1)]]);
        let theirs = db.query("select id from events", Some("s2")).unwrap().collect_rows().unwrap();
        assert!(theirs.is_empty());
        assert!(db.get("events", &[Value::Int64(1)], Some("s1")).is_ok());
        assert!(db.get("events", &[Value::Int64(1)], None).is_err());

        assert!(db.flush("s1").unwrap().is_some());
        let after = db.query("select id from events", None).unwrap().collect_rows().unwrap();
        assert_eq!(after, vec![vec![Value::Int64(1)]]);
    }

    #[test]
    fn test_explain_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        events(&db);
        let text = "select payload from events where id = 3 order by payload limit 2";
        assert_eq!(db.explain(text).unwrap(), db.explain(text).unwrap());
        assert!(db.explain(text).unwrap().contains("range=[id = 3]"));
    }

    #[test]
    fn test_drop_discards_buffers_and_reclaims() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        events(&db);
        db.put("events", vec![record(1, 100, "a")], Some("s")).unwrap();
        let generation = db.drop_dataset("events").unwrap();
        assert_eq!(db.catalog().generation_state(generation), None);
        assert_eq!(db.flush("s").unwrap(), None);
    }
}
