//! Storage Engine
//!
//! A log-structured, multi-version, ordered key-value store.
//!
//! Every write call becomes one frame in `data.log` and one sequence number.
//! The in-memory index maps each key to its version chain; a version points at
//! the value bytes inside the log, so reads go back to the file and are
//! retried with bounded backoff when the file misbehaves. Writes are never
//! retried.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::snapshot::{Snapshot, SnapshotRegistry};
use super::wal::{self, LogWriter};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Tunables for the storage engine
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Maximum visible entries collected per range-scan step
    pub scan_chunk_size: usize,
    pub read_retries: u32,
    pub read_backoff: Duration,
    pub sync_writes: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for StorageOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            scan_chunk_size: config.scan_chunk_size,
            read_retries: config.read_retries,
            read_backoff: config.read_backoff,
            sync_writes: config.sync_writes,
        }
    }
}

/// One mutation inside an atomic write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Location of a value inside the data log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValuePointer {
    offset: u64,
    len: u32,
}

/// One version of a key; `value` is None for a tombstone
#[derive(Debug, Clone, Copy)]
struct Version {
    seq: u64,
    value: Option<ValuePointer>,
}

type Index = BTreeMap<Vec<u8>, Vec<Version>>;

/// Latest version of a chain visible at `seq`
fn visible(versions: &[Version], seq: u64) -> Option<ValuePointer> {
    versions
        .iter()
        .rev()
        .find(|v| v.seq <= seq)
        .and_then(|v| v.value)
}

/// BTreeMap::range panics on inverted bounds; treat them as empty instead
fn is_empty_range(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

fn as_ref_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Collect up to `limit` visible entries; the flag reports whether more
/// keys remain past the last one collected.
fn collect_visible(
    index: &Index,
    snapshot: &Snapshot,
    lower: &Bound<Vec<u8>>,
    upper: &Bound<Vec<u8>>,
    limit: usize,
    reverse: bool,
) -> (Vec<(Vec<u8>, ValuePointer)>, bool) {
    let mut out = Vec::new();
    if is_empty_range(lower, upper) {
        return (out, false);
    }
    let range = index.range::<[u8], _>((as_ref_bound(lower), as_ref_bound(upper)));
    let seq = snapshot.seq();

    let mut push = |key: &Vec<u8>, versions: &Vec<Version>| -> bool {
        if let Some(p) = visible(versions, seq) {
            out.push((key.clone(), p));
        }
        out.len() >= limit
    };

    let mut more = false;
    if reverse {
        for (key, versions) in range.rev() {
            if push(key, versions) {
                more = true;
                break;
            }
        }
    } else {
        for (key, versions) in range {
            if push(key, versions) {
                more = true;
                break;
            }
        }
    }
    (out, more)
}

/// Run a read, retrying retryable failures with exponential backoff
pub(crate) fn retry_read<T, F>(retries: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < retries => {
                let delay = backoff * 2u32.saturating_pow(attempt);
                warn!(attempt, ?delay, error = %e, "storage read failed, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of one paged iteration call
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub entries: Vec<(Vec<u8>, Bytes)>,
    /// Pass back to continue after the last returned key
    pub next_token: Option<Vec<u8>>,
}

/// Counters reported by a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub versions_before: usize,
    pub versions_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// The storage engine
pub struct StorageEngine {
    path: PathBuf,
    options: StorageOptions,
    index: RwLock<Index>,
    /// Serializes writers; sequence numbers are assigned under this lock
    writer: Mutex<LogWriter>,
    reader: Mutex<File>,
    /// Highest committed and visible sequence number
    last_seq: AtomicU64,
    snapshots: Arc<SnapshotRegistry>,
    scan_steps: AtomicU64,
}

impl StorageEngine {
    /// Open (or create) the engine in `dir`, replaying its data log
    pub fn open(dir: &Path, options: StorageOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("data.log");

        let mut index = Index::new();
        let mut last_seq = 0u64;
        let valid_len = wal::replay(&path, |offset, payload| {
            let (seq, ops) = decode_frame(offset, payload)?;
            for (key, value) in ops {
                index.entry(key).or_default().push(Version { seq, value });
            }
            last_seq = last_seq.max(seq);
            Ok(())
        })?;

        let writer = LogWriter::open(&path, valid_len, options.sync_writes)?;
        let reader = File::open(&path)?;

        info!(
            path = %path.display(),
            keys = index.len(),
            last_seq,
            "storage engine opened"
        );

        Ok(Self {
            path,
            options,
            index: RwLock::new(index),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            last_seq: AtomicU64::new(last_seq),
            snapshots: Arc::new(SnapshotRegistry::new()),
            scan_steps: AtomicU64::new(0),
        })
    }

    // ========== Writes ==========

    /// Store a value; returns the commit sequence number
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<u64> {
        self.write_batch(vec![WriteOp::Put { key, value }])
    }

    /// Delete a key; returns the commit sequence number
    pub fn delete(&self, key: Vec<u8>) -> Result<u64> {
        self.write_batch(vec![WriteOp::Delete { key }])
    }

    /// Commit several mutations atomically under one sequence number.
    ///
    /// An empty batch commits nothing and returns the current sequence number.
    pub fn write_batch(&self, ops: Vec<WriteOp>) -> Result<u64> {
        let mut writer = self.writer.lock();
        self.commit(&mut writer, ops)
    }

    /// Delete every live key in `[lower, upper)` in one atomic write
    pub fn delete_range(&self, lower: &[u8], upper: &[u8]) -> Result<u64> {
        let mut writer = self.writer.lock();
        let seq = self.last_seq.load(Ordering::Acquire);
        let ops: Vec<WriteOp> = {
            let index = self.index.read();
            if lower >= upper {
                Vec::new()
            } else {
                index
                    .range::<[u8], _>((Bound::Included(lower), Bound::Excluded(upper)))
                    .filter(|(_, versions)| visible(versions, seq).is_some())
                    .map(|(key, _)| WriteOp::Delete { key: key.clone() })
                    .collect()
            }
        };
        debug!(keys = ops.len(), "deleting key range");
        self.commit(&mut writer, ops)
    }

    fn commit(&self, writer: &mut LogWriter, ops: Vec<WriteOp>) -> Result<u64> {
        let current = self.last_seq.load(Ordering::Acquire);
        if ops.is_empty() {
            return Ok(current);
        }
        let seq = current + 1;
        let (payload, relative) = encode_frame(seq, &ops)?;
        let base = writer.append(&payload)?;

        let mut index = self.index.write();
        for (op, rel) in ops.into_iter().zip(relative) {
            let value = rel.map(|(off, len)| ValuePointer {
                offset: base + off,
                len,
            });
            let key = match op {
                WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
            };
            index.entry(key).or_default().push(Version { seq, value });
        }
        drop(index);

        self.last_seq.store(seq, Ordering::Release);
        Ok(seq)
    }

    // ========== Reads ==========

    /// Take a read view of everything committed so far
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.last_seq.load(Ordering::Acquire), self.snapshots.clone())
    }

    /// Point read; a missing or deleted key is `KeyNotFound`
    pub fn get(&self, snapshot: &Snapshot, key: &[u8]) -> Result<Bytes> {
        let index = self.index.read();
        let pointer = index
            .get(key)
            .and_then(|versions| visible(versions, snapshot.seq()));
        match pointer {
            Some(p) => self.read_value(p),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Lazy ascending scan of `[lower, upper)`; `upper = None` is unbounded
    pub fn range_scan(
        self: &Arc<Self>,
        snapshot: &Snapshot,
        lower: Vec<u8>,
        upper: Option<Vec<u8>>,
    ) -> RangeScan {
        RangeScan {
            engine: self.clone(),
            snapshot: snapshot.clone(),
            next: Bound::Included(lower),
            upper: upper.map_or(Bound::Unbounded, Bound::Excluded),
            exhausted: false,
            pending: VecDeque::new(),
        }
    }

    /// Paged iteration over `[lower, upper)`, resuming after `token`
    pub fn scan_page(
        &self,
        snapshot: &Snapshot,
        lower: &[u8],
        upper: &[u8],
        token: Option<&[u8]>,
        limit: usize,
    ) -> Result<ScanPage> {
        let start = match token {
            Some(t) => Bound::Excluded(t.to_vec()),
            None => Bound::Included(lower.to_vec()),
        };
        let (entries, more) = self.read_visible(
            snapshot,
            &start,
            &Bound::Excluded(upper.to_vec()),
            limit.max(1),
        )?;
        let next_token = if more {
            entries.last().map(|(k, _)| k.clone())
        } else {
            None
        };
        Ok(ScanPage {
            entries,
            next_token,
        })
    }

    /// Greatest visible key in `[lower, upper)`
    pub fn last_key_in_range(
        &self,
        snapshot: &Snapshot,
        lower: &[u8],
        upper: &[u8],
    ) -> Option<Vec<u8>> {
        let index = self.index.read();
        collect_visible(
            &index,
            snapshot,
            &Bound::Included(lower.to_vec()),
            &Bound::Excluded(upper.to_vec()),
            1,
            true,
        )
        .0
        .pop()
        .map(|(k, _)| k)
    }

    /// First visible key at or after `key` (strictly after when `exclusive`)
    pub fn key_after(&self, snapshot: &Snapshot, key: &[u8], exclusive: bool) -> Option<Vec<u8>> {
        let lower = if exclusive {
            Bound::Excluded(key.to_vec())
        } else {
            Bound::Included(key.to_vec())
        };
        let index = self.index.read();
        collect_visible(&index, snapshot, &lower, &Bound::Unbounded, 1, false)
            .0
            .pop()
            .map(|(k, _)| k)
    }

    /// Last visible key at or before `key` (strictly before when `exclusive`)
    pub fn key_before(
        &self,
        snapshot: &Snapshot,
        key: &[u8],
        exclusive: bool,
    ) -> Option<Vec<u8>> {
        let upper = if exclusive {
            Bound::Excluded(key.to_vec())
        } else {
            Bound::Included(key.to_vec())
        };
        let index = self.index.read();
        collect_visible(&index, snapshot, &Bound::Unbounded, &upper, 1, true)
            .0
            .pop()
            .map(|(k, _)| k)
    }

    /// Up to `limit` visible entries with their values, ascending.
    ///
    /// Values are read while the index read lock is held; compaction needs
    /// the write lock to rewrite the log, so no pointer can go stale mid-read.
    fn read_visible(
        &self,
        snapshot: &Snapshot,
        lower: &Bound<Vec<u8>>,
        upper: &Bound<Vec<u8>>,
        limit: usize,
    ) -> Result<(Vec<(Vec<u8>, Bytes)>, bool)> {
        let index = self.index.read();
        let (located, more) = collect_visible(&index, snapshot, lower, upper, limit, false);
        let entries = located
            .into_iter()
            .map(|(key, p)| Ok((key, self.read_value(p)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok((entries, more))
    }

    fn read_value(&self, pointer: ValuePointer) -> Result<Bytes> {
        retry_read(self.options.read_retries, self.options.read_backoff, || {
            let mut reader = self.reader.lock();
            reader.seek(SeekFrom::Start(pointer.offset))?;
            let mut buf = vec![0u8; pointer.len as usize];
            reader.read_exact(&mut buf)?;
            Ok(Bytes::from(buf))
        })
    }

    // ========== Maintenance ==========

    /// Rewrite the data log keeping only versions a live snapshot can see
    pub fn compact(&self) -> Result<CompactionStats> {
        let writer = self.writer.lock();
        let mut index = self.index.write();
        let mut reader = self.reader.lock();

        let last_seq = self.last_seq.load(Ordering::Acquire);
        let horizon = self.snapshots.oldest().unwrap_or(last_seq).min(last_seq);
        let bytes_before = writer.offset();
        let versions_before: usize = index.values().map(Vec::len).sum();

        // (seq, key, value) in commit order
        let mut retained: Vec<(u64, Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        for (key, versions) in index.iter() {
            let base = versions.iter().rposition(|v| v.seq <= horizon);
            for (pos, version) in versions.iter().enumerate() {
                let keep = match base {
                    Some(b) if pos < b => false,
                    Some(b) if pos == b => version.value.is_some(),
                    _ => true,
                };
                if !keep {
                    continue;
                }
                let value = match version.value {
                    Some(p) => {
                        reader.seek(SeekFrom::Start(p.offset))?;
                        let mut buf = vec![0u8; p.len as usize];
                        reader.read_exact(&mut buf)?;
                        Some(buf)
                    }
                    None => None,
                };
                retained.push((version.seq, key.clone(), value));
            }
        }
        retained.sort_by_key(|(seq, _, _)| *seq);

        let tmp_path = self.path.with_extension("log.compact");
        let _ = fs::remove_file(&tmp_path);
        let mut out = LogWriter::open(&tmp_path, 0, false)?;
        let mut new_index = Index::new();
        let mut max_written = 0u64;

        let mut i = 0;
        while i < retained.len() {
            let seq = retained[i].0;
            let mut j = i;
            while j < retained.len() && retained[j].0 == seq {
                j += 1;
            }
            let ops: Vec<WriteOp> = retained[i..j]
                .iter()
                .map(|(_, key, value)| match value {
                    Some(v) => WriteOp::Put {
                        key: key.clone(),
                        value: v.clone(),
                    },
                    None => WriteOp::Delete { key: key.clone() },
                })
                .collect();
            let (payload, relative) = encode_frame(seq, &ops)?;
            let base = out.append(&payload)?;
            for (op, rel) in ops.into_iter().zip(relative) {
                let value = rel.map(|(off, len)| ValuePointer {
                    offset: base + off,
                    len,
                });
                new_index
                    .entry(op.key().to_vec())
                    .or_default()
                    .push(Version { seq, value });
            }
            max_written = seq;
            i = j;
        }
        // Keep the sequence counter from moving backwards after reopen
        if max_written < last_seq {
            let (payload, _) = encode_frame(last_seq, &[])?;
            out.append(&payload)?;
        }
        out.sync()?;
        let bytes_after = out.offset();
        drop(out);

        fs::rename(&tmp_path, &self.path)?;
        let sync = self.options.sync_writes;
        let mut writer = writer;
        *writer = LogWriter::open(&self.path, bytes_after, sync)?;
        *reader = File::open(&self.path)?;

        let versions_after = new_index.values().map(Vec::len).sum();
        *index = new_index;

        let stats = CompactionStats {
            versions_before,
            versions_after,
            bytes_before,
            bytes_after,
        };
        info!(horizon, ?stats, "data log compacted");
        Ok(stats)
    }

    // ========== Introspection ==========

    /// Highest committed sequence number
    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    /// Range-scan steps performed since open
    pub fn scan_steps(&self) -> u64 {
        self.scan_steps.load(Ordering::Relaxed)
    }

    /// Number of live snapshots
    pub fn live_snapshots(&self) -> usize {
        self.snapshots.live_count()
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }
}

/// Lazy ascending sequence of `(key, value)` bound to one snapshot.
///
/// Each call to [`RangeScan::next_chunk`] is one range-scan step: the index is
/// visited under its read lock for at most `scan_chunk_size` visible entries,
/// whose values are read before the lock is released.
pub struct RangeScan {
    engine: Arc<StorageEngine>,
    snapshot: Snapshot,
    next: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    exhausted: bool,
    pending: VecDeque<(Vec<u8>, Bytes)>,
}

impl RangeScan {
    /// Fetch the next chunk of entries; None once the range is exhausted
    pub fn next_chunk(&mut self) -> Result<Option<Vec<(Vec<u8>, Bytes)>>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.drain(..).collect()));
        }
        if self.exhausted {
            return Ok(None);
        }

        let chunk = self.engine.options.scan_chunk_size;
        self.engine.scan_steps.fetch_add(1, Ordering::Relaxed);
        let (entries, more) =
            match self
                .engine
                .read_visible(&self.snapshot, &self.next, &self.upper, chunk)
            {
                Ok(found) => found,
                Err(e) => {
                    self.exhausted = true;
                    return Err(e);
                }
            };

        if let Some((last, _)) = entries.last() {
            self.next = Bound::Excluded(last.clone());
        }
        if !more {
            self.exhausted = true;
        }
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(entries))
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Iterator for RangeScan {
    type Item = Result<(Vec<u8>, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() {
            match self.next_chunk() {
                Ok(Some(entries)) => self.pending.extend(entries),
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        self.pending.pop_front().map(Ok)
    }
}

// ========== Frame Codec ==========

/// Encode a frame payload; returns it with the (offset, len) of every put
/// value relative to the payload start.
fn encode_frame(seq: u64, ops: &[WriteOp]) -> Result<(Vec<u8>, Vec<Option<(u64, u32)>>)> {
    let mut buf = Vec::new();
    let mut relative = Vec::with_capacity(ops.len());
    buf.write_u64::<BigEndian>(seq)?;
    buf.write_u32::<BigEndian>(ops.len() as u32)?;
    for op in ops {
        match op {
            WriteOp::Put { key, value } => {
                buf.write_u8(OP_PUT)?;
                buf.write_u32::<BigEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                buf.write_u32::<BigEndian>(value.len() as u32)?;
                relative.push(Some((buf.len() as u64, value.len() as u32)));
                buf.extend_from_slice(value);
            }
            WriteOp::Delete { key } => {
                buf.write_u8(OP_DELETE)?;
                buf.write_u32::<BigEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                relative.push(None);
            }
        }
    }
    Ok((buf, relative))
}

type DecodedFrame = (u64, Vec<(Vec<u8>, Option<ValuePointer>)>);

fn decode_frame(offset: u64, payload: &[u8]) -> Result<DecodedFrame> {
    let corrupt = |reason: &str| Error::Corruption {
        offset,
        reason: reason.to_string(),
    };
    let mut cursor = Cursor::new(payload);
    let seq = cursor
        .read_u64::<BigEndian>()
        .map_err(|_| corrupt("missing sequence number"))?;
    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| corrupt("missing op count"))?;

    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = cursor.read_u8().map_err(|_| corrupt("missing op kind"))?;
        let key_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| corrupt("missing key length"))? as usize;
        let mut key = vec![0u8; key_len];
        cursor
            .read_exact(&mut key)
            .map_err(|_| corrupt("truncated key"))?;
        match kind {
            OP_PUT => {
                let len = cursor
                    .read_u32::<BigEndian>()
                    .map_err(|_| corrupt("missing value length"))?;
                let start = cursor.position();
                if start + len as u64 > payload.len() as u64 {
                    return Err(corrupt("truncated value"));
                }
                cursor.set_position(start + len as u64);
                ops.push((
                    key,
                    Some(ValuePointer {
                        offset: offset + start,
                        len,
                    }),
                ));
            }
            OP_DELETE => ops.push((key, None)),
            _ => return Err(corrupt("unknown op kind")),
        }
    }
    Ok((seq, ops))
}
