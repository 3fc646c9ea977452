//! Schema definitions for GrooveDB
//!
//! This module defines dataset schemas, key definitions and the full dataset
//! definition owned by one generation.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::{Field, Schema as ArrowSchema, SchemaRef};
use serde::{Deserialize, Serialize};

use super::types::ColumnType;
use crate::error::{Error, Result};

/// Column definition in a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Column position (0-indexed)
    #[serde(default)]
    pub position: usize,
    /// Is this column nullable?
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    /// Create a nullable column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            position: 0,
            nullable: true,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn arrow_field(&self) -> Field {
        Field::new(&self.name, self.column_type.arrow_type(), self.nullable)
    }
}

/// Dataset schema: an ordered list of columns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Column>", into = "Vec<Column>")]
pub struct Schema {
    /// Ordered list of columns
    columns: Vec<Column>,
    /// Column name to index mapping
    name_to_index: HashMap<String, usize>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}

impl From<Vec<Column>> for Schema {
    fn from(columns: Vec<Column>) -> Self {
        Self::from_columns(columns)
    }
}

impl From<Schema> for Vec<Column> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}

impl Schema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            name_to_index: HashMap::new(),
        }
    }

    /// Create a schema from a list of columns
    pub fn from_columns(columns: Vec<Column>) -> Self {
        let mut schema = Self::new();
        for col in columns {
            schema.add_column(col);
        }
        schema
    }

    /// Add a column to the schema; positions are reassigned in order
    pub fn add_column(&mut self, mut column: Column) {
        column.position = self.columns.len();
        self.name_to_index
            .entry(column.name.clone())
            .or_insert(column.position);
        self.columns.push(column);
    }

    /// Get column by name
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.name_to_index.get(name).map(|&idx| &self.columns[idx])
    }

    /// Get column index by name
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all columns
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Get number of columns
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Arrow schema over the listed column positions
    pub fn arrow_projection(&self, positions: &[usize]) -> SchemaRef {
        let fields: Vec<Field> = positions
            .iter()
            .map(|&p| self.columns[p].arrow_field())
            .collect();
        Arc::new(ArrowSchema::new(fields))
    }

    /// Arrow schema over every column
    pub fn to_arrow(&self) -> SchemaRef {
        let all: Vec<usize> = (0..self.columns.len()).collect();
        self.arrow_projection(&all)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

/// Partition and sort key columns of a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetKeys {
    /// Leading key columns
    pub partition: Vec<String>,
    /// Key columns ordered after the partition columns
    #[serde(default)]
    pub sort: Vec<String>,
}

impl DatasetKeys {
    /// Keys made only of partition columns
    pub fn partition<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partition: columns.into_iter().map(Into::into).collect(),
            sort: Vec::new(),
        }
    }

    /// Add sort columns
    pub fn with_sort<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Partition columns followed by sort columns
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.partition.iter().chain(self.sort.iter())
    }
}

/// A dataset definition bound to one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDef {
    /// Dataset name
    pub name: String,
    /// Generation id; also the storage namespace
    pub generation: u64,
    /// Immutable schema of this generation
    pub schema: Schema,
    /// Key definition
    pub keys: DatasetKeys,
}

impl DatasetDef {
    /// Validate and build a definition
    pub fn new(
        name: impl Into<String>,
        generation: u64,
        schema: Schema,
        keys: DatasetKeys,
    ) -> Result<Self> {
        let def = Self {
            name: name.into(),
            generation,
            schema,
            keys,
        };
        def.validate()?;
        Ok(def)
    }

    fn validate(&self) -> Result<()> {
        let mut chars = self.name.chars();
        let valid_name = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(Error::InvalidDefinition(format!(
                "invalid dataset name '{}'",
                self.name
            )));
        }
        if self.schema.column_count() == 0 {
            return Err(Error::InvalidDefinition(format!(
                "dataset '{}' has no columns",
                self.name
            )));
        }
        for (i, column) in self.schema.columns().iter().enumerate() {
            if self.schema.get_column_index(&column.name) != Some(i) {
                return Err(Error::InvalidDefinition(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        let mut seen = Vec::new();
        for key in self.keys.all() {
            if self.schema.get_column(key).is_none() {
                return Err(Error::InvalidDefinition(format!(
                    "key column '{}' is not in the schema",
                    key
                )));
            }
            if seen.contains(&key) {
                return Err(Error::InvalidDefinition(format!(
                    "key column '{}' listed twice",
                    key
                )));
            }
            seen.push(key);
        }
        Ok(())
    }

    /// Schema positions of the key columns, partition first
    pub fn key_positions(&self) -> Vec<usize> {
        self.keys
            .all()
            .filter_map(|k| self.schema.get_column_index(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_schema() -> Schema {
        Schema::from_columns(vec![
            Column::new("id", ColumnType::Int64).nullable(false),
            Column::new("ts", ColumnType::Int64),
            Column::new("payload", ColumnType::String),
        ])
    }

    #[test]
    fn test_schema_positions() {
        let schema = events_schema();
        assert_eq!(schema.get_column_index("payload"), Some(2));
        assert_eq!(schema.column_names(), vec!["id", "ts", "payload"]);
        assert_eq!(schema.to_arrow().fields().len(), 3);
        assert!(!schema.to_arrow().field(0).is_nullable());
    }

    #[test]
    fn test_schema_serde_shape() {
        let json = r#"[{"name":"id","type":"int64","nullable":false},{"name":"v","type":"string"}]"#;
        let schema: Schema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.get_column("v").unwrap().position, 1);
        assert!(schema.get_column("v").unwrap().nullable);

        let back: Schema = serde_json::from_str(&serde_json::to_string(&schema).unwrap()).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn test_definition_validation() {
        let ok = DatasetDef::new("events", 1, events_schema(), DatasetKeys::partition(["id"]));
        assert_eq!(ok.unwrap().key_positions(), vec![0]);

        assert!(DatasetDef::new("9bad", 1, events_schema(), DatasetKeys::default()).is_err());
        assert!(DatasetDef::new("e", 1, Schema::new(), DatasetKeys::default()).is_err());
        assert!(DatasetDef::new(
            "e",
            1,
            events_schema(),
            DatasetKeys::partition(["missing"])
        )
        .is_err());

        let dup = Schema::from_columns(vec![
            Column::new("a", ColumnType::Int64),
            Column::new("a", ColumnType::String),
        ]);
        assert!(DatasetDef::new("e", 1, dup, DatasetKeys::default()).is_err());
    }

    #[test]
    fn test_sort_keys_follow_partition() {
        let def = DatasetDef::new(
            "events",
            1,
            events_schema(),
            DatasetKeys::partition(["payload"]).with_sort(["ts"]),
        )
        .unwrap();
        assert_eq!(def.key_positions(), vec![2, 1]);
    }
}
