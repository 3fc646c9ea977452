//! Schema Catalog for GrooveDB
//!
//! The catalog maps dataset names to their current generation. The mapping is
//! an immutable `BTreeMap` behind an `Arc`; writers build a new map and swap
//! the pointer, so readers only ever clone an `Arc` and never wait on a writer.
//!
//! Generations live in a separate table indexed by id. Readers pin a
//! generation with a [`GenerationLease`]; a dropped generation is reclaimed
//! only once its last lease is gone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::schema::{DatasetDef, DatasetKeys, Schema};
use crate::error::{Error, Result};
use crate::storage::key::{self, CATALOG_NAMESPACE};
use crate::storage::StorageEngine;

/// Generation identifier; doubles as the storage namespace
pub type GenerationId = u64;

/// Lifecycle state of a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationState {
    /// Current generation of a dataset
    Active,
    /// Dropped; waiting for its last reader before reclamation
    Retired,
    /// Hit an invariant violation; refuses further work
    Poisoned,
}

/// Entry in the durable catalog change log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum CatalogEvent {
    Created { def: DatasetDef },
    Dropped { name: String, generation: GenerationId },
    Reclaimed { generation: GenerationId },
}

#[derive(Debug)]
struct EntryState {
    state: GenerationState,
    refs: usize,
    queued: bool,
}

/// One generation in the table
#[derive(Debug)]
struct GenerationEntry {
    def: Arc<DatasetDef>,
    state: Mutex<EntryState>,
}

/// Generation table plus the reclamation queue
#[derive(Debug, Default)]
struct GenerationTable {
    entries: RwLock<HashMap<GenerationId, Arc<GenerationEntry>>>,
    reclaimable: Mutex<Vec<GenerationId>>,
}

impl GenerationTable {
    fn get(&self, generation: GenerationId) -> Option<Arc<GenerationEntry>> {
        self.entries.read().get(&generation).cloned()
    }

    fn queue(&self, generation: GenerationId, state: &mut EntryState) {
        if !state.queued {
            state.queued = true;
            self.reclaimable.lock().push(generation);
        }
    }
}

/// Pins one generation for the lifetime of a read or write.
///
/// Dropping the lease decrements the generation's reference count.
#[derive(Debug)]
pub struct GenerationLease {
    entry: Arc<GenerationEntry>,
    table: Arc<GenerationTable>,
}

impl GenerationLease {
    /// Definition of the leased generation
    pub fn def(&self) -> &Arc<DatasetDef> {
        &self.entry.def
    }

    pub fn generation(&self) -> GenerationId {
        self.entry.def.generation
    }
}

impl Drop for GenerationLease {
    fn drop(&mut self) {
        let mut state = self.entry.state.lock();
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 && state.state == GenerationState::Retired {
            self.table.queue(self.entry.def.generation, &mut state);
        }
    }
}

/// What `describeDataset` reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub generation: GenerationId,
    pub schema: Schema,
    pub keys: DatasetKeys,
    pub state: GenerationState,
}

#[derive(Debug)]
struct WriterState {
    next_generation: GenerationId,
    next_log_seq: u64,
}

/// Schema Catalog
pub struct Catalog {
    storage: Arc<StorageEngine>,
    /// Name to current definition; replaced wholesale on every change
    datasets: RwLock<Arc<BTreeMap<String, Arc<DatasetDef>>>>,
    generations: Arc<GenerationTable>,
    /// The single writer lane
    writer: Mutex<WriterState>,
}

impl Catalog {
    /// Load the catalog by replaying its change log from storage
    pub fn open(storage: Arc<StorageEngine>) -> Result<Self> {
        let snapshot = storage.snapshot();
        let scan = storage.range_scan(
            &snapshot,
            key::namespace_start(CATALOG_NAMESPACE),
            Some(key::namespace_end(CATALOG_NAMESPACE)),
        );

        let mut datasets = BTreeMap::new();
        let mut entries: HashMap<GenerationId, Arc<GenerationEntry>> = HashMap::new();
        let mut retired = Vec::new();
        let mut next_generation = 1;
        let mut events = 0u64;

        for item in scan {
            let (_, value) = item?;
            let event: CatalogEvent = serde_json::from_slice(&value)?;
            events += 1;
            match event {
                CatalogEvent::Created { def } => {
                    next_generation = next_generation.max(def.generation + 1);
                    let def = Arc::new(def);
                    datasets.insert(def.name.clone(), def.clone());
                    entries.insert(def.generation, new_entry(def, GenerationState::Active));
                }
                CatalogEvent::Dropped { name, generation } => {
                    datasets.remove(&name);
                    if let Some(entry) = entries.get(&generation) {
                        entry.state.lock().state = GenerationState::Retired;
                        retired.push(generation);
                    }
                }
                CatalogEvent::Reclaimed { generation } => {
                    entries.remove(&generation);
                    retired.retain(|g| *g != generation);
                }
            }
        }

        let generations = Arc::new(GenerationTable::default());
        for generation in &retired {
            if let Some(entry) = entries.get(generation) {
                generations.queue(*generation, &mut entry.state.lock());
            }
        }
        *generations.entries.write() = entries;

        info!(
            datasets = datasets.len(),
            pending_reclaim = retired.len(),
            events,
            "catalog loaded"
        );

        Ok(Self {
            storage,
            datasets: RwLock::new(Arc::new(datasets)),
            generations,
            writer: Mutex::new(WriterState {
                next_generation,
                next_log_seq: events + 1,
            }),
        })
    }

    /// Current mapping; a cheap copy that never blocks on writers for long
    fn current(&self) -> Arc<BTreeMap<String, Arc<DatasetDef>>> {
        self.datasets.read().clone()
    }

    fn append_event(&self, writer: &mut WriterState, event: &CatalogEvent) -> Result<u64> {
        let payload = serde_json::to_vec(event)?;
        let key = key::catalog_log_key(writer.next_log_seq);
        let seq = self.storage.put(key, payload)?;
        writer.next_log_seq += 1;
        Ok(seq)
    }

    /// Create a dataset as a fresh generation
    pub fn create_dataset(
        &self,
        name: &str,
        schema: Schema,
        keys: DatasetKeys,
    ) -> Result<Arc<DatasetDef>> {
        let mut writer = self.writer.lock();
        let current = self.current();
        if current.contains_key(name) {
            return Err(Error::SchemaConflict(name.to_string()));
        }

        let generation = writer.next_generation;
        let def = DatasetDef::new(name, generation, schema, keys)?;
        self.append_event(&mut writer, &CatalogEvent::Created { def: def.clone() })?;
        writer.next_generation += 1;

        let def = Arc::new(def);
        self.generations
            .entries
            .write()
            .insert(generation, new_entry(def.clone(), GenerationState::Active));

        let mut next = (*current).clone();
        next.insert(name.to_string(), def.clone());
        *self.datasets.write() = Arc::new(next);

        info!(dataset = %name, generation, "dataset created");
        Ok(def)
    }

    /// Soft-delete a dataset; returns the retired generation
    pub fn drop_dataset(&self, name: &str) -> Result<GenerationId> {
        let mut writer = self.writer.lock();
        let current = self.current();
        let def = current
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DatasetNotFound(name.to_string()))?;
        let generation = def.generation;

        self.append_event(
            &mut writer,
            &CatalogEvent::Dropped {
                name: name.to_string(),
                generation,
            },
        )?;

        let mut next = (*current).clone();
        next.remove(name);
        *self.datasets.write() = Arc::new(next);

        if let Some(entry) = self.generations.get(generation) {
            let mut state = entry.state.lock();
            state.state = GenerationState::Retired;
            if state.refs == 0 {
                self.generations.queue(generation, &mut state);
            }
            debug!(generation, refs = state.refs, "generation retired");
        }

        info!(dataset = %name, generation, "dataset dropped");
        Ok(generation)
    }

    /// Definition of the current generation of a dataset
    pub fn get(&self, name: &str) -> Result<Arc<DatasetDef>> {
        self.current()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DatasetNotFound(name.to_string()))
    }

    /// Describe a dataset
    pub fn describe(&self, name: &str) -> Result<DatasetInfo> {
        let def = self.get(name)?;
        let state = self
            .generations
            .get(def.generation)
            .map(|e| e.state.lock().state)
            .unwrap_or(GenerationState::Active);
        Ok(DatasetInfo {
            name: def.name.clone(),
            generation: def.generation,
            schema: def.schema.clone(),
            keys: def.keys.clone(),
            state,
        })
    }

    /// Active dataset names in order
    pub fn list(&self) -> Vec<String> {
        self.current().keys().cloned().collect()
    }

    /// Active definitions, used by recovery
    pub fn definitions(&self) -> Vec<Arc<DatasetDef>> {
        self.current().values().cloned().collect()
    }

    /// Pin the current generation of a dataset
    pub fn lease(&self, name: &str) -> Result<GenerationLease> {
        let def = self.get(name)?;
        self.lease_generation(def.generation)
            .map_err(|e| match e {
                // Dropped between lookup and pin
                Error::Internal(_) => Error::DatasetNotFound(name.to_string()),
                other => other,
            })
    }

    /// Pin a generation by id
    pub fn lease_generation(&self, generation: GenerationId) -> Result<GenerationLease> {
        let entry = self
            .generations
            .get(generation)
            .ok_or_else(|| Error::Internal(format!("generation {} is gone", generation)))?;
        {
            let mut state = entry.state.lock();
            match state.state {
                GenerationState::Active => state.refs += 1,
                GenerationState::Retired => {
                    return Err(Error::Internal(format!(
                        "generation {} is retired",
                        generation
                    )))
                }
                GenerationState::Poisoned => {
                    return Err(Error::InvariantViolation {
                        generation,
                        message: "generation is poisoned".to_string(),
                    })
                }
            }
        }
        Ok(GenerationLease {
            entry,
            table: self.generations.clone(),
        })
    }

    /// Live leases on a generation; zero for unknown generations
    pub fn ref_count(&self, generation: GenerationId) -> usize {
        self.generations
            .get(generation)
            .map(|e| e.state.lock().refs)
            .unwrap_or(0)
    }

    /// Lifecycle state of a generation; None once reclaimed
    pub fn generation_state(&self, generation: GenerationId) -> Option<GenerationState> {
        self.generations.get(generation).map(|e| e.state.lock().state)
    }

    /// Mark a generation unusable after an invariant violation
    pub fn poison(&self, generation: GenerationId, reason: &str) {
        if let Some(entry) = self.generations.get(generation) {
            let mut state = entry.state.lock();
            if state.state == GenerationState::Active {
                state.state = GenerationState::Poisoned;
                error!(generation, reason, "generation poisoned");
            }
        }
    }

    /// Physically delete retired generations nobody references any more
    pub fn reclaim(&self) -> Result<Vec<GenerationId>> {
        let pending: Vec<GenerationId> = std::mem::take(&mut *self.generations.reclaimable.lock());
        if pending.is_empty() {
            return Ok(pending);
        }

        let mut writer = self.writer.lock();
        let mut done = Vec::with_capacity(pending.len());
        for (i, generation) in pending.iter().copied().enumerate() {
            let result = self
                .storage
                .delete_range(&key::namespace_start(generation), &key::namespace_end(generation))
                .and_then(|_| {
                    self.append_event(&mut writer, &CatalogEvent::Reclaimed { generation })
                });
            if let Err(e) = result {
                // Put the rest back so a later pass retries them
                self.generations
                    .reclaimable
                    .lock()
                    .extend_from_slice(&pending[i..]);
                return Err(e);
            }
            self.generations.entries.write().remove(&generation);
            info!(generation, "generation reclaimed");
            done.push(generation);
        }
        Ok(done)
    }
}

fn new_entry(def: Arc<DatasetDef>, state: GenerationState) -> Arc<GenerationEntry> {
    Arc::new(GenerationEntry {
        def,
        state: Mutex::new(EntryState {
            state,
            refs: 0,
            queued: false,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType};
    use crate::storage::StorageOptions;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> Arc<StorageEngine> {
        Arc::new(StorageEngine::open(dir.path(), StorageOptions::default()).unwrap())
    }

    fn schema() -> Schema {
        Schema::from_columns(vec![
            Column::new("id", ColumnType::Int64).nullable(false),
            Column::new("payload", ColumnType::String),
        ])
    }

    #[test]
    fn test_create_and_conflict() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(storage(&dir)).unwrap();

        let def = catalog
            .create_dataset("events", schema(), DatasetKeys::partition(["id"]))
            .unwrap();
        assert_eq!(def.generation, 1);
        assert!(matches!(
            catalog.create_dataset("events", schema(), DatasetKeys::default()),
            Err(Error::SchemaConflict(_))
        ));
        assert_eq!(catalog.list(), vec!["events".to_string()]);
    }

    #[test]
    fn test_drop_twice_is_not_found() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(storage(&dir)).unwrap();
        catalog
            .create_dataset("events", schema(), DatasetKeys::default())
            .unwrap();

        catalog.drop_dataset("events").unwrap();
        let err = catalog.drop_dataset("events").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_readers_keep_old_mapping() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(storage(&dir)).unwrap();
        catalog
            .create_dataset("a", schema(), DatasetKeys::default())
            .unwrap();

        let before = catalog.current();
        catalog
            .create_dataset("b", schema(), DatasetKeys::default())
            .unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(catalog.current().len(), 2);
    }

    #[test]
    fn test_reclaim_waits_for_leases() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(storage(&dir)).unwrap();
        let def = catalog
            .create_dataset("events", schema(), DatasetKeys::default())
            .unwrap();

        let lease = catalog.lease("events").unwrap();
        assert_eq!(catalog.ref_count(def.generation), 1);

        catalog.drop_dataset("events").unwrap();
        assert!(catalog.reclaim().unwrap().is_empty());
        assert_eq!(
            catalog.generation_state(def.generation),
            Some(GenerationState::Retired)
        );

        drop(lease);
        assert_eq!(catalog.reclaim().unwrap(), vec![def.generation]);
        assert_eq!(catalog.generation_state(def.generation), None);
    }

    #[test]
    fn test_recreate_gets_new_generation() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(storage(&dir)).unwrap();
        let first = catalog
            .create_dataset("events", schema(), DatasetKeys::default())
            .unwrap();
        catalog.drop_dataset("events").unwrap();
        let second = catalog
            .create_dataset("events", schema(), DatasetKeys::default())
            .unwrap();
        assert!(second.generation > first.generation);
    }

    #[test]
    fn test_change_log_replay() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = Catalog::open(storage(&dir)).unwrap();
            catalog
                .create_dataset("keep", schema(), DatasetKeys::partition(["id"]))
                .unwrap();
            catalog
                .create_dataset("gone", schema(), DatasetKeys::default())
                .unwrap();
            catalog.drop_dataset("gone").unwrap();
        }

        let catalog = Catalog::open(storage(&dir)).unwrap();
        assert_eq!(catalog.list(), vec!["keep".to_string()]);
        assert_eq!(catalog.describe("keep").unwrap().keys.partition, vec!["id"]);
        // The dropped generation is still pending and gets reclaimed now
        assert_eq!(catalog.reclaim().unwrap(), vec![2]);

        let next = catalog
            .create_dataset("fresh", schema(), DatasetKeys::default())
            .unwrap();
        assert_eq!(next.generation, 3);
    }

    #[test]
    fn test_poisoned_generation_refuses_leases() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(storage(&dir)).unwrap();
        let def = catalog
            .create_dataset("events", schema(), DatasetKeys::default())
            .unwrap();
        catalog
            .create_dataset("other", schema(), DatasetKeys::default())
            .unwrap();

        catalog.poison(def.generation, "corrupt row");
        let err = catalog.lease("events").unwrap_err();
        assert_eq!(
            err.kind(),
            crate::error::ErrorKind::InternalInvariantViolation
        );
        assert!(catalog.lease("other").is_ok());
    }
}
