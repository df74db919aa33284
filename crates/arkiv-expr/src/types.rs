//! The scalar/geometry type system shared by the expression engine and the
//! catalogue namespace schemas.

use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Geometry;
use crate::ExprError;

/// Resolved type of an expression node or a namespace property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Long,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Uuid,
    Geometry,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Text => "text",
            DataType::Long => "long",
            DataType::Integer => "integer",
            DataType::Real => "real",
            DataType::Boolean => "boolean",
            DataType::Timestamp => "timestamp",
            DataType::Uuid => "uuid",
            DataType::Geometry => "geometry",
        };
        f.write_str(name)
    }
}

/// A concrete value carried by a literal, a parameter, or a product
/// property.
///
/// `Null` exists for property documents only: setting a property to `Null`
/// clears it in the catalogue. A `Null` never types as a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    Geometry(Geometry),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Infer the type of a literal value, testing candidate types in the
    /// fixed priority order Text, Timestamp, UUID, Boolean, Integer, Long,
    /// Real, Geometry. An integer value types as `Integer` when it fits in
    /// 32 bits and as `Long` otherwise.
    pub fn literal_type(&self) -> Result<DataType, ExprError> {
        match self {
            Value::Text(_) => Ok(DataType::Text),
            Value::Timestamp(_) => Ok(DataType::Timestamp),
            Value::Uuid(_) => Ok(DataType::Uuid),
            Value::Boolean(_) => Ok(DataType::Boolean),
            Value::Integer(value) => {
                if i32::try_from(*value).is_ok() {
                    Ok(DataType::Integer)
                } else {
                    Ok(DataType::Long)
                }
            }
            Value::Real(_) => Ok(DataType::Real),
            Value::Geometry(_) => Ok(DataType::Geometry),
            Value::Null => Err(ExprError::Internal(format!(
                "unable to determine type of literal value: {self:?}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "\"{v}\""),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Geometry(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<Geometry> for Value {
    fn from(value: Geometry) -> Self {
        Value::Geometry(value)
    }
}

/// Schema of a single namespace: property identifier to declared type.
pub type NamespaceSchema = HashMap<String, DataType>;

/// All registered namespace schemas, keyed by namespace name.
pub type NamespaceSchemas = HashMap<String, NamespaceSchema>;

/// Parameter values referenced from a query through `@name`.
pub type Parameters = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_integers_type_as_integer_large_as_long() {
        assert_eq!(Value::Integer(42).literal_type().unwrap(), DataType::Integer);
        assert_eq!(
            Value::Integer(i64::from(i32::MAX) + 1).literal_type().unwrap(),
            DataType::Long
        );
    }

    #[test]
    fn null_has_no_literal_type() {
        assert!(Value::Null.literal_type().is_err());
    }
}
