use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Type descriptor of one tuple field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int32,
    Int64,
    Utf8,
    Bytes,
}

impl FieldType {
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::Int32 => Some(4),
            FieldType::Int64 => Some(8),
            FieldType::Utf8 | FieldType::Bytes => None,
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Utf8(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int32(_) => FieldType::Int32,
            Value::Int64(_) => FieldType::Int64,
            Value::Utf8(_) => FieldType::Utf8,
            Value::Bytes(_) => FieldType::Bytes,
        }
    }

    /// Appends the field encoding of this value.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int32(v) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_i32(&mut buf, *v);
                out.extend_from_slice(&buf);
            }
            Value::Int64(v) => {
                let mut buf = [0u8; 8];
                LittleEndian::write_i64(&mut buf, *v);
                out.extend_from_slice(&buf);
            }
            Value::Utf8(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8], field_type: FieldType) -> Result<Value> {
        if let Some(size) = field_type.fixed_size() {
            if bytes.len() != size {
                bail!(
                    "{:?} field must be {} bytes, got {}",
                    field_type,
                    size,
                    bytes.len()
                );
            }
        }

        Ok(match field_type {
            FieldType::Int32 => Value::Int32(LittleEndian::read_i32(bytes)),
            FieldType::Int64 => Value::Int64(LittleEndian::read_i64(bytes)),
            FieldType::Utf8 => Value::Utf8(String::from_utf8(bytes.to_vec())?),
            FieldType::Bytes => Value::Bytes(bytes.to_vec()),
        })
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}
