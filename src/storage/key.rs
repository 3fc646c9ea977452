//! Order-preserving key encoding
//!
//! A row key is `generation | key column values... | row id`. Every component
//! is self-delimiting and compares bytewise in the same order as the logical
//! values, so a byte-range scan over a key prefix visits rows in key order and,
//! within equal keys, in row-id order.

use super::row::Value;

/// Namespace holding the catalog change log
pub const CATALOG_NAMESPACE: u64 = 0;

const NULL_MARKER: u8 = 0x00;
const VALUE_MARKER: u8 = 0x01;
const STRING_ESCAPE: u8 = 0xFF;
const STRING_TERMINATOR: u8 = 0x01;

/// Builds keys for one generation
#[derive(Debug, Clone)]
pub struct KeyEncoder {
    buf: Vec<u8>,
}

impl KeyEncoder {
    /// Start a key inside the generation's namespace
    pub fn new(generation: u64) -> Self {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&generation.to_be_bytes());
        Self { buf }
    }

    /// Append one key column value
    pub fn push(&mut self, value: &Value) -> &mut Self {
        encode_value(&mut self.buf, value);
        self
    }

    /// The encoded prefix so far
    pub fn prefix(&self) -> &[u8] {
        &self.buf
    }

    /// Finish a full row key
    pub fn finish(mut self, row_id: u64) -> Vec<u8> {
        self.buf.extend_from_slice(&row_id.to_be_bytes());
        self.buf
    }

    pub fn into_prefix(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode a value so that byte order matches value order.
///
/// Int64 values are expected in int64 columns and floats in float64 columns;
/// callers coerce before encoding.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(NULL_MARKER),
        Value::Boolean(b) => {
            buf.push(VALUE_MARKER);
            buf.push(*b as u8);
        }
        Value::Int64(i) => {
            buf.push(VALUE_MARKER);
            buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
        }
        Value::Float64(f) => {
            buf.push(VALUE_MARKER);
            // -0.0 and 0.0 are equal, so they must share an encoding
            let f = if *f == 0.0 { 0.0 } else { *f };
            let bits = f.to_bits();
            let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
            buf.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::String(s) => {
            buf.push(VALUE_MARKER);
            for &b in s.as_bytes() {
                buf.push(b);
                if b == 0x00 {
                    buf.push(STRING_ESCAPE);
                }
            }
            buf.push(0x00);
            buf.push(STRING_TERMINATOR);
        }
    }
}

/// First key of a generation's namespace (inclusive)
pub fn namespace_start(generation: u64) -> Vec<u8> {
    generation.to_be_bytes().to_vec()
}

/// End of a generation's namespace (exclusive)
pub fn namespace_end(generation: u64) -> Vec<u8> {
    match generation.checked_add(1) {
        Some(next) => next.to_be_bytes().to_vec(),
        None => vec![0xFF; 9],
    }
}

/// The smallest byte string greater than every string starting with `prefix`.
///
/// Returns None when no such string exists (the prefix is all 0xFF).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < 0xFF {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// End of a generation's row keys (exclusive).
///
/// Every encoded key column starts with 0x00 or 0x01, so a 0xFF byte right
/// after the generation prefix sorts after all rows of the generation.
pub fn rows_end(generation: u64) -> Vec<u8> {
    let mut key = namespace_start(generation);
    key.push(0xFF);
    key
}

/// Key holding the next free row id of a generation; sits past every row
pub fn row_id_mark_key(generation: u64) -> Vec<u8> {
    rows_end(generation)
}

/// Generation id a key belongs to
pub fn key_generation(key: &[u8]) -> Option<u64> {
    let head: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

/// Row id stored at the tail of a row key
pub fn key_row_id(key: &[u8]) -> Option<u64> {
    if key.len() < 16 {
        return None;
    }
    let tail: [u8; 8] = key[key.len() - 8..].try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

/// Key of the n-th catalog change log record
pub fn catalog_log_key(seq: u64) -> Vec<u8> {
    let mut key = namespace_start(CATALOG_NAMESPACE);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}
