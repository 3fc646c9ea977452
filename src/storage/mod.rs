//! Storage engine module
//!
//! This module contains the storage engine components:
//! - Versioned ordered key-value engine over a framed data log
//! - Snapshots and their registry
//! - Order-preserving key encoding
//! - Stored row format

pub mod engine;
pub mod key;
pub mod row;
pub mod snapshot;
pub mod wal;

pub use engine::{CompactionStats, RangeScan, ScanPage, StorageEngine, StorageOptions, WriteOp};
pub use key::KeyEncoder;
pub use row::{Record, Value};
pub use snapshot::{Snapshot, SnapshotRegistry};
pub use wal::LogWriter;
