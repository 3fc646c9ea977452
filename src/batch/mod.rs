//! Columnar Batch Builder module
//!
//! Row validation, buffering, sealing and conversion between rows and Arrow
//! column batches.

pub mod builder;
pub mod convert;

pub use builder::{validate_record, AppendOutcome, BatchBuilder, RowFailure, SealedBatch};
pub use convert::{batch_to_rows, rows_to_batch, value_at};
