//! Engine configuration
//!
//! Values arrive already validated from whoever bootstraps the process. The
//! setters follow the consuming builder style used by `ServerConfig`.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of rows a buffer holds before it is sealed
pub const DEFAULT_BATCH_ROWS: usize = 4096;

/// Default number of entries visited per range-scan step
pub const DEFAULT_SCAN_CHUNK: usize = 256;

/// Configuration for a [`crate::Database`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the data log and the ingest marker log
    pub data_dir: PathBuf,
    /// Size of the Put/Get/Query worker pool
    pub worker_threads: usize,
    /// Seal a buffer once it holds this many rows
    pub batch_row_threshold: usize,
    /// Seal a buffer once its estimated size reaches this many bytes
    pub batch_byte_threshold: usize,
    /// Maximum entries collected by one range-scan step
    pub scan_chunk_size: usize,
    /// Per-query memory ceiling for Sort and Aggregate, in bytes
    pub sort_memory_limit: usize,
    /// Stage sort overflow to temporary files instead of failing
    pub spill_enabled: bool,
    /// Where spill files go; the system temp dir when unset
    pub spill_dir: Option<PathBuf>,
    /// Deadline applied to queries that do not carry their own
    pub query_timeout: Option<Duration>,
    /// Attempts made for a failing storage read before surfacing it
    pub read_retries: u32,
    /// Backoff before the first read retry; doubles on every attempt
    pub read_backoff: Duration,
    /// fsync the data log after every write
    pub sync_writes: bool,
    /// Rows per streamed result page
    pub page_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("groovedb-data"),
            worker_threads: 8,
            batch_row_threshold: DEFAULT_BATCH_ROWS,
            batch_byte_threshold: 4 * 1024 * 1024,
            scan_chunk_size: DEFAULT_SCAN_CHUNK,
            sort_memory_limit: 64 * 1024 * 1024,
            spill_enabled: false,
            spill_dir: None,
            query_timeout: None,
            read_retries: 3,
            read_backoff: Duration::from_millis(5),
            sync_writes: false,
            page_rows: 1024,
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Set the worker pool size
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    /// Set the row and byte thresholds that trigger a seal
    pub fn batch_thresholds(mut self, rows: usize, bytes: usize) -> Self {
        self.batch_row_threshold = rows.max(1);
        self.batch_byte_threshold = bytes.max(1);
        self
    }

    /// Set the number of entries visited per range-scan step
    pub fn scan_chunk_size(mut self, n: usize) -> Self {
        self.scan_chunk_size = n.max(1);
        self
    }

    /// Set the per-query memory ceiling
    pub fn sort_memory_limit(mut self, bytes: usize) -> Self {
        self.sort_memory_limit = bytes;
        self
    }

    /// Enable spilling sort runs to temporary files
    pub fn spill(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }

    /// Set the spill directory
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Set the default query deadline
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Set the read retry policy
    pub fn read_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.read_retries = retries;
        self.read_backoff = backoff;
        self
    }

    /// fsync after every write
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the rows per streamed page
    pub fn page_rows(mut self, n: usize) -> Self {
        self.page_rows = n.max(1);
        self
    }

    /// Path of the storage data log
    pub fn data_log_path(&self) -> PathBuf {
        self.data_dir.join("data.log")
    }

    /// Path of the ingest marker log
    pub fn ingest_log_path(&self) -> PathBuf {
        self.data_dir.join("ingest.wal")
    }
}
