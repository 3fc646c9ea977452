//! Schema Catalog module
//!
//! Dataset definitions, column types and the generation lifecycle.

#[allow(clippy::module_inception)]
mod catalog;
mod schema;
mod types;

pub use catalog::{Catalog, DatasetInfo, GenerationId, GenerationLease, GenerationState};
pub use schema::{Column, DatasetDef, DatasetKeys, Schema};
pub use types::ColumnType;
