//! Row and column conversion
//!
//! Ingestion hands rows to the builder and storage hands rows to Scan; both
//! turn them into Arrow arrays here. Result pages and point lookups go the
//! other way.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::catalog::ColumnType;
use crate::error::{Error, Result};
use crate::storage::Value;

/// Accumulates values column by column
pub enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    String(StringBuilder),
}

impl ColumnBuilder {
    pub fn new(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnType::Int64 => ColumnBuilder::Int64(Int64Builder::with_capacity(capacity)),
            ColumnType::Float64 => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            ColumnType::String => {
                ColumnBuilder::String(StringBuilder::with_capacity(capacity, capacity * 8))
            }
        }
    }

    /// Append a value already coerced to this column's type
    pub fn append(&mut self, value: &Value) -> Result<()> {
        match (self, value) {
            (ColumnBuilder::Boolean(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Int64(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Float64(b), Value::Null) => b.append_null(),
            (ColumnBuilder::String(b), Value::Null) => b.append_null(),
            (ColumnBuilder::Boolean(b), Value::Boolean(v)) => b.append_value(*v),
            (ColumnBuilder::Int64(b), Value::Int64(v)) => b.append_value(*v),
            (ColumnBuilder::Float64(b), Value::Float64(v)) => b.append_value(*v),
            (ColumnBuilder::Float64(b), Value::Int64(v)) => b.append_value(*v as f64),
            (ColumnBuilder::String(b), Value::String(v)) => b.append_value(v),
            (_, other) => {
                return Err(Error::Internal(format!(
                    "value of type {} does not fit column builder",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::String(b) => Arc::new(b.finish()),
        }
    }
}

/// Build a batch with an explicit row count.
///
/// A batch without columns still carries its row count, which `count(*)`
/// over an empty projection relies on.
pub fn batch_with_rows(schema: SchemaRef, columns: Vec<ArrayRef>, rows: usize) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}

/// Convert rows (each laid out like `schema`) into one column-major batch
pub fn rows_to_batch(schema: SchemaRef, rows: &[Vec<Value>]) -> Result<RecordBatch> {
    let mut builders = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let column_type = ColumnType::from_arrow(field.data_type()).ok_or_else(|| {
            Error::Internal(format!("unsupported arrow type {}", field.data_type()))
        })?;
        builders.push(ColumnBuilder::new(column_type, rows.len()));
    }
    for row in rows {
        for (builder, value) in builders.iter_mut().zip(row) {
            builder.append(value)?;
        }
    }
    let columns = builders.iter_mut().map(ColumnBuilder::finish).collect();
    batch_with_rows(schema, columns, rows.len())
}

/// Read one cell of an array as a Value
pub fn value_at(array: &dyn Array, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match array.data_type() {
        DataType::Boolean => array
            .as_any()
            .downcast_ref::<BooleanArray>()
            .map_or(Value::Null, |a| Value::Boolean(a.value(row))),
        DataType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .map_or(Value::Null, |a| Value::Int64(a.value(row))),
        DataType::Float64 => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .map_or(Value::Null, |a| Value::Float64(a.value(row))),
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map_or(Value::Null, |a| Value::String(a.value(row).to_string())),
        _ => Value::Null,
    }
}

/// Values of one row across every column
pub fn row_values(batch: &RecordBatch, row: usize) -> Vec<Value> {
    batch
        .columns()
        .iter()
        .map(|c| value_at(c.as_ref(), row))
        .collect()
}

/// Convert a batch back into rows
pub fn batch_to_rows(batch: &RecordBatch) -> Vec<Vec<Value>> {
    (0..batch.num_rows()).map(|r| row_values(batch, r)).collect()
}

/// A single-value array of `len` copies, typed as `column_type`
pub fn constant_array(value: &Value, column_type: ColumnType, len: usize) -> Result<ArrayRef> {
    let mut builder = ColumnBuilder::new(column_type, len);
    for _ in 0..len {
        builder.append(value)?;
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("ratio", DataType::Float64, true),
            Field::new("payload", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn test_rows_to_columns_and_back() {
        let rows = vec![
            vec![Value::Int64(1), Value::Float64(0.5), Value::from("a")],
            vec![Value::Int64(2), Value::Null, Value::Null],
        ];
        let batch = rows_to_batch(schema(), &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
        assert_eq!(batch.column(1).null_count(), 1);
        assert_eq!(batch_to_rows(&batch), rows);
    }

    #[test]
    fn test_int_widens_into_float_column() {
        let rows = vec![vec![Value::Int64(1), Value::Int64(3), Value::from("x")]];
        let batch = rows_to_batch(schema(), &rows).unwrap();
        assert_eq!(value_at(batch.column(1).as_ref(), 0), Value::Float64(3.0));
    }

    #[test]
    fn test_columnless_batch_keeps_row_count() {
        let empty = Arc::new(Schema::empty());
        let batch = batch_with_rows(empty, vec![], 42).unwrap();
        assert_eq!(batch.num_rows(), 42);
    }

    #[test]
    fn test_constant_array() {
        let array = constant_array(&Value::from("k"), ColumnType::String, 3).unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(value_at(array.as_ref(), 2), Value::from("k"));
    }
}
