//! Column types for GrooveDB
//!
//! This enumeration is the only type system shared between ingestion, storage
//! and query execution. Arrow types are derived from it.

use std::fmt;
use std::str::FromStr;

use arrow::datatypes::DataType as ArrowType;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean type
    #[serde(alias = "bool")]
    Boolean,
    /// 64-bit signed integer
    Int64,
    /// 64-bit floating point
    #[serde(alias = "double")]
    Float64,
    /// UTF-8 string
    String,
}

impl ColumnType {
    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::String => "string",
        }
    }

    /// The Arrow type used for columns of this type
    pub fn arrow_type(&self) -> ArrowType {
        match self {
            ColumnType::Boolean => ArrowType::Boolean,
            ColumnType::Int64 => ArrowType::Int64,
            ColumnType::Float64 => ArrowType::Float64,
            ColumnType::String => ArrowType::Utf8,
        }
    }

    /// Map an Arrow type back, if it is one of ours
    pub fn from_arrow(data_type: &ArrowType) -> Option<Self> {
        match data_type {
            ArrowType::Boolean => Some(ColumnType::Boolean),
            ArrowType::Int64 => Some(ColumnType::Int64),
            ArrowType::Float64 => Some(ColumnType::Float64),
            ArrowType::Utf8 => Some(ColumnType::String),
            _ => None,
        }
    }

    /// Check if this type is numeric
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int64 | ColumnType::Float64)
    }

    /// Check if values of the two types can be compared
    pub fn is_comparable_with(&self, other: &ColumnType) -> bool {
        self == other || (self.is_numeric() && other.is_numeric())
    }

    /// Result type of arithmetic between two numeric types
    pub fn numeric_result(&self, other: &ColumnType) -> Option<ColumnType> {
        match (self, other) {
            (ColumnType::Int64, ColumnType::Int64) => Some(ColumnType::Int64),
            (a, b) if a.is_numeric() && b.is_numeric() => Some(ColumnType::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "int64" | "bigint" | "int" | "integer" => Ok(ColumnType::Int64),
            "float64" | "double" | "float" => Ok(ColumnType::Float64),
            "string" | "text" | "varchar" => Ok(ColumnType::String),
            other => Err(Error::InvalidDefinition(format!(
                "unknown column type '{}'",
                other
            ))),
        }
    }
}
