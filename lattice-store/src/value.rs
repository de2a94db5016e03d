//! Value helpers
//!
//! State values are dynamically typed JSON values. This module holds the
//! small amount of type introspection the engine needs: declared value
//! types for `State::set_type`, and the flat merge used by `patch`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// A value type a State can be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Number,
    String,
    Object,
    Array,
}

impl ValueType {
    /// The type of a value, or `None` for null.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Boolean),
            Value::Number(_) => Some(ValueType::Number),
            Value::String(_) => Some(ValueType::String),
            Value::Array(_) => Some(ValueType::Array),
            Value::Object(_) => Some(ValueType::Object),
        }
    }

    /// Whether `value` is of this type.
    pub fn matches(self, value: &Value) -> bool {
        ValueType::of(value) == Some(self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Object => "object",
            ValueType::Array => "array",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = StoreError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(ValueType::Boolean),
            "number" => Ok(ValueType::Number),
            "string" => Ok(ValueType::String),
            "object" => Ok(ValueType::Object),
            "array" => Ok(ValueType::Array),
            _ => Err(StoreError::InvalidTypeTag(tag.to_owned())),
        }
    }
}

/// Name of a value's type, as used in diagnostics.
pub(crate) fn type_name(value: &Value) -> &'static str {
    ValueType::of(value).map_or("null", ValueType::as_str)
}

/// Shallow-merge `changes` into `source`.
///
/// Properties of `changes` that `source` doesn't have are only copied when
/// `add_new_properties` is set. Both sides must be objects.
pub fn flat_merge(
    source: &Value,
    changes: &Value,
    add_new_properties: bool,
) -> Result<Value, StoreError> {
    let Value::Object(source) = source else {
        return Err(StoreError::NotAnObject { target: "patched value" });
    };
    let Value::Object(changes) = changes else {
        return Err(StoreError::NotAnObject { target: "patch changes" });
    };

    let mut merged: Map<String, Value> = source.clone();
    for (property, value) in changes {
        if !add_new_properties && !merged.contains_key(property) {
            continue;
        }
        merged.insert(property.clone(), value.clone());
    }

    Ok(Value::Object(merged))
}

/// Copy of `value` with `field` set, if `value` is an object.
pub(crate) fn with_field(value: &Value, field: &str, field_value: Value) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.insert(field.to_owned(), field_value);
    }
    value
}
