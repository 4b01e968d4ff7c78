//! Error types for record primitives.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur when working with records and keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A composite key has an unset component. Such a record can never be
    /// persisted or tracked.
    #[error("incomplete composite key for model {model}: field {field} is unset")]
    IncompleteKey {
        /// Model name.
        model: String,
        /// The unset key field.
        field: String,
    },

    /// A key field is not declared on the model.
    #[error("model {model} has no key field {field}")]
    MissingKeyField {
        /// Model name.
        model: String,
        /// The missing field name.
        field: String,
    },

    /// The record has been deleted; no further mutation is allowed.
    #[error("record {key} is deleted")]
    Deleted {
        /// The record's last known key.
        key: String,
    },

    /// The field is not declared on the model.
    #[error("model {model} has no field {field}")]
    UnknownField {
        /// Model name.
        model: String,
        /// The unknown field name.
        field: String,
    },

    /// Attempted to change a key that is already assigned.
    #[error("key {key} is immutable once assigned")]
    KeyReassignment {
        /// The existing key.
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModelError::IncompleteKey {
            model: "task".into(),
            field: "list_id".into(),
        };
        assert!(err.to_string().contains("task"));
        assert!(err.to_string().contains("list_id"));

        let err = ModelError::Deleted { key: "7".into() };
        assert_eq!(err.to_string(), "record 7 is deleted");
    }
}
