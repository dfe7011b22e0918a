use std::fmt;

use crate::{
    error::{ErrorKind, SmallError},
    schema::{DataType, Schema, Value},
    types::StorageResult,
};

/// A fixed-width row, encoded/decoded against a [`Schema`]. Column
/// order in `values` always matches `schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn key(&self) -> StorageResult<i32> {
        self.values
            .get(0)
            .ok_or_else(|| SmallError::with_kind(ErrorKind::InvalidState, "record has no columns"))?
            .as_int()
    }

    /// Serialize to the record's fixed width for `schema`. Validates
    /// each value against its column's declared type and width.
    pub fn encode(&self, schema: &Schema) -> StorageResult<Vec<u8>> {
        if self.values.len() != schema.columns.len() {
            return Err(SmallError::with_kind(
                ErrorKind::TypeMismatch,
                "record column count does not match schema",
            ));
        }

        let mut bytes = Vec::with_capacity(schema.record_size());
        for (value, column) in self.values.iter().zip(&schema.columns) {
            match (&column.data_type, value) {
                (DataType::Int, Value::Int(v)) => {
                    bytes.extend_from_slice(&v.to_ne_bytes());
                }
                (DataType::Str(width), Value::Str(v)) => {
                    if v.len() > *width {
                        return Err(SmallError::with_kind(
                            ErrorKind::TypeMismatch,
                            &format!(
                                "string value of {} bytes exceeds column width {}",
                                v.len(),
                                width
                            ),
                        ));
                    }
                    let mut padded = vec![0u8; *width];
                    padded[..v.len()].copy_from_slice(v);
                    bytes.extend_from_slice(&padded);
                }
                _ => {
                    return Err(SmallError::with_kind(
                        ErrorKind::TypeMismatch,
                        &format!("value does not match column '{}' type", column.name),
                    ));
                }
            }
        }

        Ok(bytes)
    }

    pub fn decode(bytes: &[u8], schema: &Schema) -> StorageResult<Self> {
        if bytes.len() < schema.record_size() {
            return Err(SmallError::with_kind(
                ErrorKind::CorruptPage,
                "record buffer shorter than schema's fixed width",
            ));
        }

        let mut values = Vec::with_capacity(schema.columns.len());
        let mut offset = 0;
        for column in &schema.columns {
            let width = column.data_type.width();
            let field = &bytes[offset..offset + width];
            let value = match column.data_type {
                DataType::Int => {
                    let arr: [u8; 4] = field.try_into().unwrap();
                    Value::Int(i32::from_ne_bytes(arr))
                }
                DataType::Str(_) => Value::Str(field.to_vec()),
            };
            values.push(value);
            offset += width;
        }

        Ok(Self { values })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
