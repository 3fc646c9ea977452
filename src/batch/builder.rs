//! Columnar Batch Builder
//!
//! Rows are validated one by one against the generation's schema; bad rows are
//! reported by index and never take their siblings down with them. Valid rows
//! collect in a buffer per (generation, session) until a threshold or an
//! explicit flush seals them into a column-major batch with a contiguous
//! row-id range.
//!
//! Sealing is guarded by the ingest marker log:
//!
//! 1. `Begin` with the exact storage writes, synced
//! 2. one atomic storage write
//! 3. `Commit` (or `Abort` if the storage write failed)
//!
//! On restart every `Begin` without a matching `Commit`/`Abort` is applied
//! again. Keys carry row ids, so applying twice writes identical entries. The
//! row id mark of a replayed seal is only written when it moves the stored
//! mark forward.
//!
//! Session rows stay in their buffer until the seal that covers them commits.
//! Sealing a buffer and taking a read view both hold the buffer lock, so a
//! reader sees every row exactly once: buffered or stored.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::convert::{row_values, rows_to_batch};
use crate::catalog::{DatasetDef, GenerationId, GenerationLease};
use crate::error::{Error, Result};
use crate::storage::key::{self, KeyEncoder};
use crate::storage::row::encode_row;
use crate::storage::wal::{self, LogWriter};
use crate::storage::{Record, Snapshot, StorageEngine, Value, WriteOp};

/// The marker log is truncated after a seal once it grows past this
const MARKER_RESET_BYTES: u64 = 1024 * 1024;

const MARK_BEGIN: u8 = 1;
const MARK_COMMIT: u8 = 2;
const MARK_ABORT: u8 = 3;

/// A row that failed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    /// Index of the row within its Put call
    pub row: usize,
    pub message: String,
}

/// A sealed, immutable column-major batch
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub generation: GenerationId,
    pub first_row_id: u64,
    /// Commit sequence number of the storage write
    pub seq: u64,
    pub batch: RecordBatch,
}

impl SealedBatch {
    /// Row ids covered, end exclusive
    pub fn row_ids(&self) -> std::ops::Range<u64> {
        self.first_row_id..self.first_row_id + self.batch.num_rows() as u64
    }
}

/// Outcome of appending rows
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// Rows that passed validation
    pub accepted: usize,
    pub failures: Vec<RowFailure>,
    /// Batches sealed during this call
    pub sealed: Vec<SealedBatch>,
}

impl AppendOutcome {
    /// Sequence number of the last seal in this call
    pub fn seq(&self) -> Option<u64> {
        self.sealed.last().map(|b| b.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    generation: GenerationId,
    session: String,
}

struct RowBuffer {
    def: Arc<DatasetDef>,
    rows: Vec<Vec<Value>>,
    bytes: usize,
}

/// Validates, buffers and seals ingested rows
pub struct BatchBuilder {
    storage: Arc<StorageEngine>,
    /// Ingest marker log; held for the whole seal, so seals never interleave
    marker: Mutex<LogWriter>,
    buffers: Mutex<HashMap<BufferKey, RowBuffer>>,
    /// Next free row id per generation
    row_ids: Mutex<HashMap<GenerationId, u64>>,
    row_threshold: usize,
    byte_threshold: usize,
}

impl BatchBuilder {
    /// Open the builder, replaying unfinished seals from the marker log.
    ///
    /// `is_live` tells whether a generation still exists; seals for dropped
    /// generations are discarded.
    pub fn open<F>(
        storage: Arc<StorageEngine>,
        marker_path: &Path,
        row_threshold: usize,
        byte_threshold: usize,
        is_live: F,
    ) -> Result<Self>
    where
        F: Fn(GenerationId) -> bool,
    {
        let mut open_seals: Vec<((GenerationId, u64), Vec<WriteOp>)> = Vec::new();
        let valid_len = wal::replay(marker_path, |offset, payload| {
            let (mark, generation, first_row_id, ops) = decode_marker(offset, payload)?;
            match mark {
                MARK_BEGIN => open_seals.push(((generation, first_row_id), ops)),
                _ => open_seals.retain(|(id, _)| *id != (generation, first_row_id)),
            }
            Ok(())
        })?;

        let mut replayed = 0;
        for ((generation, first_row_id), mut ops) in open_seals {
            if !is_live(generation) {
                debug!(generation, first_row_id, "skipping seal of dropped generation");
                continue;
            }
            // later seals may already have moved the mark past this one
            let stored = stored_row_id_mark(&storage, generation)?.unwrap_or(0);
            let mark_key = key::row_id_mark_key(generation);
            ops.retain(|op| match op {
                WriteOp::Put { key, value } if *key == mark_key => {
                    decode_row_id_mark(generation, value).is_ok_and(|next| next > stored)
                }
                _ => true,
            });
            let seq = storage.write_batch(ops)?;
            info!(generation, first_row_id, seq, "replayed unfinished seal");
            replayed += 1;
        }

        let mut writer = LogWriter::open(marker_path, valid_len, true)?;
        writer.reset()?;
        if replayed > 0 {
            info!(replayed, "ingest recovery complete");
        }

        Ok(Self {
            storage,
            marker: Mutex::new(writer),
            buffers: Mutex::new(HashMap::new()),
            row_ids: Mutex::new(HashMap::new()),
            row_threshold,
            byte_threshold,
        })
    }

    /// Validate and ingest records for the leased generation.
    ///
    /// Without a session the valid rows are sealed before returning. With a
    /// session they are buffered and sealed when a threshold is reached.
    pub fn append(
        &self,
        lease: &GenerationLease,
        session: Option<&str>,
        records: Vec<Record>,
    ) -> Result<AppendOutcome> {
        let def = lease.def().clone();
        let mut outcome = AppendOutcome::default();
        let mut valid = Vec::with_capacity(records.len());
        let mut bytes = 0;

        for (row, record) in records.into_iter().enumerate() {
            match validate_record(&def, row, record) {
                Ok(values) => {
                    bytes += values.iter().map(Value::estimated_size).sum::<usize>();
                    valid.push(values);
                }
                Err(Error::Validation { row, message }) => {
                    outcome.failures.push(RowFailure { row, message })
                }
                Err(other) => return Err(other),
            }
        }
        outcome.accepted = valid.len();
        if !outcome.failures.is_empty() {
            debug!(
                dataset = %def.name,
                rejected = outcome.failures.len(),
                accepted = outcome.accepted,
                "rows failed validation"
            );
        }

        let session = match session {
            Some(s) => s,
            None => {
                if !valid.is_empty() {
                    outcome.sealed.push(self.seal(&def, &valid)?);
                }
                return Ok(outcome);
            }
        };

        let key = BufferKey {
            generation: def.generation,
            session: session.to_string(),
        };
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(key.clone()).or_insert_with(|| RowBuffer {
            def: def.clone(),
            rows: Vec::new(),
            bytes: 0,
        });
        let (kept_rows, kept_bytes) = (buffer.rows.len(), buffer.bytes);
        buffer.rows.extend(valid);
        buffer.bytes += bytes;
        if buffer.rows.len() < self.row_threshold && buffer.bytes < self.byte_threshold {
            return Ok(outcome);
        }
        match self.seal(&def, &buffer.rows) {
            Ok(sealed) => {
                buffers.remove(&key);
                outcome.sealed.push(sealed);
                Ok(outcome)
            }
            Err(e) => {
                // a failed call leaves the buffer as it found it
                buffer.rows.truncate(kept_rows);
                buffer.bytes = kept_bytes;
                Err(e)
            }
        }
    }

    /// Seal every buffer of a session
    pub fn flush(&self, session: &str) -> Result<Vec<SealedBatch>> {
        let mut buffers = self.buffers.lock();
        let keys: Vec<BufferKey> = buffers
            .keys()
            .filter(|k| k.session == session)
            .cloned()
            .collect();
        let mut sealed = Vec::new();
        for key in keys {
            if let Some(buffer) = buffers.get(&key) {
                if !buffer.rows.is_empty() {
                    sealed.push(self.seal(&buffer.def, &buffer.rows)?);
                }
            }
            buffers.remove(&key);
        }
        Ok(sealed)
    }

    /// Seal every buffer of every session
    pub fn flush_all(&self) -> Result<usize> {
        let mut buffers = self.buffers.lock();
        let keys: Vec<BufferKey> = buffers.keys().cloned().collect();
        let mut count = 0;
        for key in keys {
            if let Some(buffer) = buffers.get(&key) {
                if !buffer.rows.is_empty() {
                    self.seal(&buffer.def, &buffer.rows)?;
                    count += 1;
                }
            }
            buffers.remove(&key);
        }
        Ok(count)
    }

    /// Forget buffered rows of a dropped generation
    pub fn discard_generation(&self, generation: GenerationId) {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|k, _| k.generation != generation);
        if buffers.len() != before {
            warn!(generation, discarded = before - buffers.len(), "discarded unflushed buffers");
        }
        self.row_ids.lock().remove(&generation);
    }

    /// Unflushed rows a session has buffered for a generation
    pub fn pending_rows(&self, generation: GenerationId, session: &str) -> Vec<Vec<Value>> {
        self.buffers
            .lock()
            .get(&BufferKey {
                generation,
                session: session.to_string(),
            })
            .map(|b| b.rows.clone())
            .unwrap_or_default()
    }

    /// A storage snapshot together with the session's unflushed rows for a
    /// generation, taken atomically with respect to seals
    pub fn read_view(
        &self,
        generation: GenerationId,
        session: Option<&str>,
    ) -> (Snapshot, Vec<Vec<Value>>) {
        let buffers = self.buffers.lock();
        let snapshot = self.storage.snapshot();
        let pending = session
            .and_then(|session| {
                buffers.get(&BufferKey {
                    generation,
                    session: session.to_string(),
                })
            })
            .map(|b| b.rows.clone())
            .unwrap_or_default();
        (snapshot, pending)
    }

    /// Number of buffered rows across all sessions
    pub fn buffered_rows(&self) -> usize {
        self.buffers.lock().values().map(|b| b.rows.len()).sum()
    }

    /// Reserve `count` row ids; the caller holds the marker lock
    fn allocate_row_ids(&self, generation: GenerationId, count: usize) -> Result<u64> {
        let mut row_ids = self.row_ids.lock();
        let next = match row_ids.get(&generation) {
            Some(next) => *next,
            None => stored_row_id_mark(&self.storage, generation)?.unwrap_or(0),
        };
        row_ids.insert(generation, next + count as u64);
        Ok(next)
    }

    fn seal(&self, def: &Arc<DatasetDef>, rows: &[Vec<Value>]) -> Result<SealedBatch> {
        let generation = def.generation;
        let mut marker = self.marker.lock();
        let first_row_id = self.allocate_row_ids(generation, rows.len())?;
        let batch = rows_to_batch(def.schema.to_arrow(), rows)?;

        let ops = storage_ops(def, first_row_id, &batch);
        marker.append(&encode_marker(MARK_BEGIN, generation, first_row_id, &ops)?)?;

        let written = self.storage.write_batch(ops);
        let mark = if written.is_ok() { MARK_COMMIT } else { MARK_ABORT };
        let closed = close_marker(&mut marker, mark, generation, first_row_id);
        drop(marker);

        // the seal stands once storage has the rows
        if let Err(e) = &closed {
            warn!(generation, first_row_id, error = %e, "ingest marker left open");
        }
        let seq = written?;
        debug!(
            dataset = %def.name,
            generation,
            first_row_id,
            rows = batch.num_rows(),
            seq,
            "batch sealed"
        );
        Ok(SealedBatch {
            generation,
            first_row_id,
            seq,
            batch,
        })
    }
}

fn close_marker(
    marker: &mut LogWriter,
    mark: u8,
    generation: GenerationId,
    first_row_id: u64,
) -> Result<()> {
    marker.append(&encode_marker(mark, generation, first_row_id, &[])?)?;
    if marker.offset() > MARKER_RESET_BYTES {
        marker.reset()?;
    }
    Ok(())
}

/// Next free row id recorded in storage for a generation
fn stored_row_id_mark(storage: &StorageEngine, generation: GenerationId) -> Result<Option<u64>> {
    let snapshot = storage.snapshot();
    match storage.get(&snapshot, &key::row_id_mark_key(generation)) {
        Ok(bytes) => decode_row_id_mark(generation, &bytes).map(Some),
        Err(Error::KeyNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn decode_row_id_mark(generation: GenerationId, bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| Error::InvariantViolation {
        generation,
        message: "malformed row id mark".to_string(),
    })?;
    Ok(u64::from_be_bytes(raw))
}

/// Check one record against the schema; returns values in schema order
pub fn validate_record(def: &DatasetDef, row: usize, mut record: Record) -> Result<Vec<Value>> {
    let fail = |message: String| Error::Validation { row, message };
    let mut values = Vec::with_capacity(def.schema.column_count());

    for column in def.schema.columns() {
        let value = record.shift_remove(&column.name).unwrap_or(Value::Null);
        let value = value.coerce_to(column.column_type).map_err(|v| {
            fail(format!(
                "column '{}' expects {}, found {}",
                column.name,
                column.column_type,
                v.type_name()
            ))
        })?;
        if value.is_null() && !column.nullable {
            return Err(fail(format!("column '{}' cannot be null", column.name)));
        }
        values.push(value);
    }
    if let Some(extra) = record.keys().next() {
        return Err(fail(format!("unknown column '{}'", extra)));
    }
    Ok(values)
}

/// Row key for a row laid out in schema order
pub fn row_key(def: &DatasetDef, key_positions: &[usize], values: &[Value], row_id: u64) -> Vec<u8> {
    let mut encoder = KeyEncoder::new(def.generation);
    for &pos in key_positions {
        encoder.push(&values[pos]);
    }
    encoder.finish(row_id)
}

/// Storage writes for a sealed batch, walking it row by row, plus the
/// updated row id mark
fn storage_ops(def: &DatasetDef, first_row_id: u64, batch: &RecordBatch) -> Vec<WriteOp> {
    let key_positions = def.key_positions();
    let rows = batch.num_rows();
    let mut ops: Vec<WriteOp> = (0..rows)
        .map(|r| {
            let values = row_values(batch, r);
            WriteOp::Put {
                key: row_key(def, &key_positions, &values, first_row_id + r as u64),
                value: encode_row(&values),
            }
        })
        .collect();
    ops.push(WriteOp::Put {
        key: key::row_id_mark_key(def.generation),
        value: (first_row_id + rows as u64).to_be_bytes().to_vec(),
    });
    ops
}

// ========== Marker Codec ==========

fn encode_marker(
    mark: u8,
    generation: GenerationId,
    first_row_id: u64,
    ops: &[WriteOp],
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u8(mark)?;
    buf.write_u64::<BigEndian>(generation)?;
    buf.write_u64::<BigEndian>(first_row_id)?;
    buf.write_u32::<BigEndian>(ops.len() as u32)?;
    for op in ops {
        if let WriteOp::Put { key, value } = op {
            buf.write_u32::<BigEndian>(key.len() as u32)?;
            buf.extend_from_slice(key);
            buf.write_u32::<BigEndian>(value.len() as u32)?;
            buf.extend_from_slice(value);
        }
    }
    Ok(buf)
}

fn decode_marker(offset: u64, payload: &[u8]) -> Result<(u8, GenerationId, u64, Vec<WriteOp>)> {
    let corrupt = |_| Error::Corruption {
        offset,
        reason: "truncated ingest marker".to_string(),
    };
    let mut cursor = Cursor::new(payload);
    let mark = cursor.read_u8().map_err(corrupt)?;
    let generation = cursor.read_u64::<BigEndian>().map_err(corrupt)?;
    let first_row_id = cursor.read_u64::<BigEndian>().map_err(corrupt)?;
    let count = cursor.read_u32::<BigEndian>().map_err(corrupt)?;

    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = cursor.read_u32::<BigEndian>().map_err(corrupt)? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key).map_err(corrupt)?;
        let value_len = cursor.read_u32::<BigEndian>().map_err(corrupt)? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value).map_err(corrupt)?;
        ops.push(WriteOp::Put { key, value });
    }
    Ok((mark, generation, first_row_id, ops))
}
