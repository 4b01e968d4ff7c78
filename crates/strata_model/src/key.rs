//! Record keys.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator used when a composite key is flattened into a single map key.
pub const KEY_SEPARATOR: char = '/';

/// The identity of a record.
///
/// A key is either a single scalar field value or an ordered tuple of
/// field values (composite key). Keys are immutable once assigned to a
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    /// A single scalar key value.
    Scalar(Value),
    /// An ordered tuple of key values.
    Composite(Vec<Value>),
}

impl RecordKey {
    /// Creates a scalar key.
    pub fn scalar(value: impl Into<Value>) -> Self {
        RecordKey::Scalar(value.into())
    }

    /// Creates a composite key from ordered components.
    #[must_use]
    pub fn composite(components: Vec<Value>) -> Self {
        RecordKey::Composite(components)
    }

    /// Generates a fresh scalar key (a random UUID in text form).
    #[must_use]
    pub fn generate() -> Self {
        RecordKey::Scalar(Value::Text(Uuid::new_v4().to_string()))
    }

    /// Returns the ordered key components.
    #[must_use]
    pub fn components(&self) -> &[Value] {
        match self {
            RecordKey::Scalar(value) => std::slice::from_ref(value),
            RecordKey::Composite(values) => values,
        }
    }

    /// Returns true if every component is set (non-null).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.components().iter().all(|v| !v.is_null())
    }

    /// Flattens the key into a single string for use as a map key.
    ///
    /// Composite components are joined with [`KEY_SEPARATOR`].
    #[must_use]
    pub fn to_map_key(&self) -> String {
        let mut out = String::new();
        for (i, component) in self.components().iter().enumerate() {
            if i > 0 {
                out.push(KEY_SEPARATOR);
            }
            out.push_str(&component.to_string());
        }
        out
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_map_key())
    }
}

impl From<Value> for RecordKey {
    fn from(value: Value) -> Self {
        RecordKey::Scalar(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_map_key() {
        let key = RecordKey::scalar(42i64);
        assert_eq!(key.to_map_key(), "42");
        assert!(key.is_complete());
    }

    #[test]
    fn composite_map_key_uses_separator() {
        let key = RecordKey::composite(vec![Value::Integer(1), Value::Text("a".into())]);
        assert_eq!(key.to_map_key(), "1/a");
    }

    #[test]
    fn incomplete_composite() {
        let key = RecordKey::composite(vec![Value::Integer(1), Value::Null]);
        assert!(!key.is_complete());
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(RecordKey::generate(), RecordKey::generate());
    }
}
