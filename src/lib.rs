//! GrooveDB - a single-node dataset storage and query engine
//!
//! This library provides the core components:
//! - Storage engine (versioned key-value log, snapshots, key encoding)
//! - Schema catalog with copy-on-write generations
//! - Columnar batch builder for ingestion
//! - Query DSL (lexer, parser, AST)
//! - Query compilation and pull-based execution over Arrow batches
//! - TCP server and client

pub mod batch;
pub mod catalog;
pub mod config;
pub mod database;
pub mod dsl;
pub mod error;
pub mod executor;
pub mod server;
pub mod storage;

pub use config::EngineConfig;
pub use database::{CompactionReport, Database};
pub use error::{Error, ErrorInfo, ErrorKind, Result};
