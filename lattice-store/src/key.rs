//! Keys
//!
//! States, Items, Groups and Selectors are addressed by a [`Key`]. Item keys
//! come straight from the primary-key field of collected payloads, so a key
//! is either an integer or a string, mirroring what JSON data carries.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An integer-or-string identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key, e.g. a numeric primary key.
    Int(i64),
    /// String key.
    Str(String),
}

impl Key {
    /// Read a key out of a JSON value.
    ///
    /// Only integral numbers and strings are valid keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }

    /// Convert the key into the JSON value stored in payloads and Group values.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(i64::from(value))
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Key::Int(i64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}

impl From<&Key> for Key {
    fn from(value: &Key) -> Self {
        value.clone()
    }
}

/// Collect anything key-like into a list of keys.
pub(crate) fn collect_keys<I, K>(keys: I) -> Vec<Key>
where
    I: IntoIterator<Item = K>,
    K: Into<Key>,
{
    keys.into_iter().map(Into::into).collect()
}
