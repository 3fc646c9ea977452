//! Error types for GrooveDB
//!
//! Every failure in the engine is an [`Error`]. Each variant maps onto one
//! [`ErrorKind`], which is what crosses the RPC boundary together with the
//! message and a structured detail.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for GrooveDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Validation Errors ==========
    #[error("Validation error: row {row}: {message}")]
    Validation { row: usize, message: String },

    #[error("Validation error: {0}")]
    InvalidDefinition(String),

    // ========== Query Compile Errors ==========
    #[error("Syntax error at position {position}: expected {expected}, found {found}")]
    Syntax {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("Semantic error: column '{column}' not found in dataset '{dataset}'")]
    UnknownColumn { column: String, dataset: String },

    #[error("Semantic error: type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Semantic error: {0}")]
    Semantic(String),

    // ========== Catalog Errors ==========
    #[error("Catalog error: dataset '{0}' not found")]
    DatasetNotFound(String),

    #[error("Catalog error: dataset '{0}' already exists")]
    SchemaConflict(String),

    // ========== Storage Errors ==========
    #[error("Storage error: key not found")]
    KeyNotFound,

    #[error("Storage error: no row with the given key in dataset '{0}'")]
    RowNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage error: corrupted log at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    // ========== Execution Errors ==========
    #[error("Resource exhausted: {resource} exceeded limit of {limit} bytes")]
    ResourceExhausted { resource: String, limit: usize },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Execution error: query cancelled")]
    Cancelled,

    #[error("Execution error: query exceeded its deadline")]
    DeadlineExceeded,

    // ========== Internal Errors ==========
    #[error("Internal invariant violated for generation {generation}: {message}")]
    InvariantViolation { generation: u64, message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    // ========== Transport Errors ==========
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error reported by the server, as received by a client
    #[error("{0}")]
    Remote(ErrorInfo),
}

/// Result type alias for GrooveDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    SyntaxError,
    SemanticError,
    NotFound,
    SchemaConflict,
    ResourceExhausted,
    IOFailure,
    ExecutionError,
    Cancelled,
    InternalInvariantViolation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::SemanticError => "SemanticError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::SchemaConflict => "SchemaConflict",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::IOFailure => "IOFailure",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InternalInvariantViolation => "InternalInvariantViolation",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } | Error::InvalidDefinition(_) | Error::Protocol(_) => {
                ErrorKind::ValidationError
            }
            Error::Syntax { .. } => ErrorKind::SyntaxError,
            Error::UnknownColumn { .. } | Error::TypeMismatch { .. } | Error::Semantic(_) => {
                ErrorKind::SemanticError
            }
            Error::DatasetNotFound(_) | Error::KeyNotFound | Error::RowNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::SchemaConflict(_) => ErrorKind::SchemaConflict,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::IoError(_) | Error::Corruption { .. } => ErrorKind::IOFailure,
            Error::ExecutionError(_) => ErrorKind::ExecutionError,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            Error::InvariantViolation { .. } | Error::Internal(_) => {
                ErrorKind::InternalInvariantViolation
            }
            Error::Remote(info) => info.kind,
        }
    }

    /// Structured detail for the error, if the variant carries any
    pub fn detail(&self) -> Option<serde_json::Value> {
        use serde_json::json;

        match self {
            Error::Validation { row, .. } => Some(json!({ "row": row })),
            Error::Syntax {
                position,
                expected,
                found,
            } => Some(json!({ "position": position, "expected": expected, "found": found })),
            Error::UnknownColumn { column, dataset } => {
                Some(json!({ "column": column, "dataset": dataset }))
            }
            Error::TypeMismatch {
                expected, found, ..
            } => Some(json!({ "expected": expected, "found": found })),
            Error::DatasetNotFound(name) | Error::SchemaConflict(name) => {
                Some(json!({ "dataset": name }))
            }
            Error::ResourceExhausted { resource, limit } => {
                Some(json!({ "resource": resource, "limit": limit }))
            }
            Error::Corruption { offset, .. } => Some(json!({ "offset": offset })),
            Error::InvariantViolation { generation, .. } => {
                Some(json!({ "generation": generation }))
            }
            Error::Remote(info) => info.detail.clone(),
            _ => None,
        }
    }

    /// Whether a read that failed with this error may be attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::IoError(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    /// Convert into the structured form used on the wire
    pub fn to_info(&self) -> ErrorInfo {
        if let Error::Remote(info) = self {
            return info.clone();
        }
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
            detail: self.detail(),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        match e {
            arrow::error::ArrowError::DivideByZero => {
                Error::ExecutionError("division by zero".to_string())
            }
            arrow::error::ArrowError::ArithmeticOverflow(msg) => {
                Error::ExecutionError(format!("arithmetic overflow: {}", msg))
            }
            arrow::error::ArrowError::IoError(msg, err) => {
                Error::IoError(std::io::Error::new(err.kind(), msg))
            }
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", e))
    }
}

/// An error as it crosses the RPC boundary: (kind, message, detail)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

impl From<Error> for ErrorInfo {
    fn from(e: Error) -> Self {
        e.to_info()
    }
}
