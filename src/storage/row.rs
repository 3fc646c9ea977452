//! Values and the stored row format
//!
//! A stored row is the value half of a key-value entry: a column count followed
//! by one tagged value per schema column. Decoding can skip columns a query does
//! not reference, so unreferenced strings are never allocated.

use std::cmp::Ordering;
use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::ColumnType;
use crate::error::{Error, Result};

/// A single typed value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Boolean(bool),
    /// 64-bit integer
    Int64(i64),
    /// 64-bit float
    Float64(f64),
    /// UTF-8 string
    String(String),
}

/// One record as it arrives from a client: column name to value
pub type Record = IndexMap<String, Value>;

// Floats compare bitwise so Value can key hash maps (GROUP BY); keys go
// through `Value::canonical` first
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
        }
    }
}

impl Value {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Single representation for float zero and NaN, so values that compare
    /// equal also hash equal
    pub fn canonical(self) -> Value {
        match self {
            Value::Float64(f) if f == 0.0 => Value::Float64(0.0),
            Value::Float64(f) if f.is_nan() => Value::Float64(f64::NAN),
            other => other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The column type this value naturally belongs to; None for NULL
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Int64(_) => Some(ColumnType::Int64),
            Value::Float64(_) => Some(ColumnType::Float64),
            Value::String(_) => Some(ColumnType::String),
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self.column_type() {
            Some(t) => t.name(),
            None => "null",
        }
    }

    /// Coerce this value into a column of the given type.
    ///
    /// NULL passes through; int64 widens to float64. Anything else must match
    /// exactly.
    pub fn coerce_to(self, target: ColumnType) -> std::result::Result<Value, Value> {
        match (self, target) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Int64(i), ColumnType::Float64) => Ok(Value::Float64(i as f64)),
            (v, t) if v.column_type() == Some(t) => Ok(v),
            (v, _) => Err(v),
        }
    }

    /// Approximate in-memory size, used for buffer thresholds
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::String(s) => 24 + s.len(),
            _ => 16,
        }
    }

    /// Compare two values (ORDER BY, MIN/MAX)
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::Int64(a), Value::Float64(b)) => (*a as f64).partial_cmp(b),
            (Value::Float64(a), Value::Int64(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

// ========== Stored Row Format ==========

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_FLOAT64: u8 = 3;
const TAG_STRING: u8 = 4;

/// Serialize a full row, one value per schema column
pub fn encode_row(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + values.len() * 9);
    let _ = buf.write_u16::<BigEndian>(values.len() as u16);
    for value in values {
        match value {
            Value::Null => buf.push(TAG_NULL),
            Value::Boolean(b) => {
                buf.push(TAG_BOOL);
                buf.push(*b as u8);
            }
            Value::Int64(i) => {
                buf.push(TAG_INT64);
                let _ = buf.write_i64::<BigEndian>(*i);
            }
            Value::Float64(f) => {
                buf.push(TAG_FLOAT64);
                let _ = buf.write_f64::<BigEndian>(*f);
            }
            Value::String(s) => {
                buf.push(TAG_STRING);
                let _ = buf.write_u32::<BigEndian>(s.len() as u32);
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
    buf
}

/// Decode every column of a stored row
pub fn decode_row(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut cursor = Cursor::new(bytes);
    let count = read_count(&mut cursor)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(read_value(&mut cursor, true)?);
    }
    Ok(values)
}

/// Decode only the listed column positions, in the order listed.
///
/// Positions past the stored column count are an error.
pub fn decode_projected(bytes: &[u8], positions: &[usize]) -> Result<Vec<Value>> {
    let mut cursor = Cursor::new(bytes);
    let count = read_count(&mut cursor)?;
    let wanted_max = positions.iter().copied().max();
    if let Some(max) = wanted_max {
        if max >= count {
            return Err(Error::Internal(format!(
                "row has {} columns, projection wants column {}",
                count, max
            )));
        }
    }

    let mut out = vec![Value::Null; positions.len()];
    let last = match wanted_max {
        Some(max) => max,
        None => return Ok(out),
    };
    for col in 0..=last {
        let wanted = positions.contains(&col);
        let value = read_value(&mut cursor, wanted)?;
        if wanted {
            for (slot, &pos) in positions.iter().enumerate() {
                if pos == col {
                    out[slot] = value.clone();
                }
            }
        }
    }
    Ok(out)
}

fn read_count(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    cursor
        .read_u16::<BigEndian>()
        .map(|n| n as usize)
        .map_err(|_| Error::Internal("row buffer too short for header".to_string()))
}

/// Read one tagged value; when `materialize` is false strings are skipped
fn read_value(cursor: &mut Cursor<&[u8]>, materialize: bool) -> Result<Value> {
    let truncated = |_| Error::Internal("row buffer truncated".to_string());
    let tag = cursor.read_u8().map_err(truncated)?;
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Boolean(cursor.read_u8().map_err(truncated)? != 0),
        TAG_INT64 => Value::Int64(cursor.read_i64::<BigEndian>().map_err(truncated)?),
        TAG_FLOAT64 => Value::Float64(cursor.read_f64::<BigEndian>().map_err(truncated)?),
        TAG_STRING => {
            let len = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
            if !materialize {
                let pos = cursor.position() + len as u64;
                if pos > cursor.get_ref().len() as u64 {
                    return Err(Error::Internal("row buffer truncated".to_string()));
                }
                cursor.set_position(pos);
                return Ok(Value::Null);
            }
            let mut raw = vec![0u8; len];
            cursor.read_exact(&mut raw).map_err(truncated)?;
            Value::String(
                String::from_utf8(raw).map_err(|e| Error::Internal(e.to_string()))?,
            )
        }
        other => return Err(Error::Internal(format!("unknown value tag: {}", other))),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_comparison() {
        assert_eq!(
            Value::Int64(5).compare(&Value::Int64(3)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::from("abc").compare(&Value::from("def")),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Int64(1)), Some(Ordering::Less));
        assert_eq!(Value::Int64(1).compare(&Value::from("x")), None);
    }

    #[test]
    fn test_canonical_floats() {
        assert_ne!(Value::Float64(-0.0), Value::Float64(0.0));
        assert_eq!(Value::Float64(-0.0).canonical(), Value::Float64(0.0));
        let nan = f64::from_bits(f64::NAN.to_bits() ^ 1);
        assert_eq!(Value::Float64(nan).canonical(), Value::Float64(f64::NAN).canonical());
        assert_eq!(Value::Float64(-1.5).canonical(), Value::Float64(-1.5));
        assert_eq!(Value::from("x").canonical(), Value::from("x"));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            Value::Int64(2).coerce_to(ColumnType::Float64),
            Ok(Value::Float64(2.0))
        );
        assert!(Value::from("a").coerce_to(ColumnType::Int64).is_err());
        assert_eq!(Value::Null.coerce_to(ColumnType::String), Ok(Value::Null));
    }

    #[test]
    fn test_untagged_json() {
        let record: Record =
            serde_json::from_str(r#"{"id": 1, "ratio": 0.5, "payload": "a", "gone": null}"#)
                .unwrap();
        assert_eq!(record["id"], Value::Int64(1));
        assert_eq!(record["ratio"], Value::Float64(0.5));
        assert_eq!(record["payload"], Value::from("a"));
        assert_eq!(record["gone"], Value::Null);
    }

    #[test]
    fn test_projected_decode_skips_columns() {
        let row = vec![
            Value::Int64(7),
            Value::from("skipped"),
            Value::Null,
            Value::Float64(1.5),
            Value::Boolean(true),
        ];
        let bytes = encode_row(&row);

        assert_eq!(decode_row(&bytes).unwrap(), row);
        assert_eq!(
            decode_projected(&bytes, &[3, 0]).unwrap(),
            vec![Value::Float64(1.5), Value::Int64(7)]
        );
        assert!(decode_projected(&bytes, &[9]).is_err());
        assert!(decode_row(&bytes[..bytes.len() - 1]).is_err());
    }
}
