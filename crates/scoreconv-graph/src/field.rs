//! Tri-state view of a response field.
//!
//! The store reports "no such record" as `null` on some operations and may
//! omit a field entirely when the operation itself was rejected. The two
//! cases mean different things to callers, so they are kept apart.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use scoreconv_core::{Error, Result};

/// A field looked up in a response's `data` object.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    /// The key is not present (or there was no `data` at all).
    Absent,
    /// The key is present with value `null`.
    Null,
    Value(T),
}

impl<'a> Field<&'a JsonValue> {
    /// Look up `key` in an optional data object.
    pub fn lookup(data: Option<&'a JsonValue>, key: &str) -> Self {
        match data.and_then(|d| d.get(key)) {
            None => Field::Absent,
            Some(JsonValue::Null) => Field::Null,
            Some(value) => Field::Value(value),
        }
    }

    /// Deserialize a present value into a typed record.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Field<T>> {
        match self {
            Field::Absent => Ok(Field::Absent),
            Field::Null => Ok(Field::Null),
            Field::Value(v) => Ok(Field::Value(T::deserialize(v).map_err(Error::from)?)),
        }
    }
}

impl<T> Field<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Field::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    /// Present value, or `None` for both absent and null.
    pub fn into_option(self) -> Option<T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }
}
