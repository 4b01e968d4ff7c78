//! Error types for the sync core.
//!
//! Programmer errors (missing keys, invalid cascade or relation
//! configuration) fail fast and synchronously at the call site. Tier
//! failures are never surfaced as `Err`: they are data, folded into
//! transaction results and events.

use strata_model::ModelError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the sync core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A record-level error (invalid key, deleted record, unknown field).
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The model has not been registered.
    #[error("unknown model {model}")]
    UnknownModel {
        /// Model name.
        model: String,
    },

    /// The model is already registered.
    #[error("model {model} is already registered")]
    DuplicateModel {
        /// Model name.
        model: String,
    },

    /// The relation is not declared on the model.
    #[error("model {model} has no relation {relation}")]
    UnknownRelation {
        /// Model name.
        model: String,
        /// Relation name.
        relation: String,
    },

    /// The operation does not apply to the relation's shape (e.g. `relate`
    /// on a one-to-one relation).
    #[error("relation {relation} is not {expected}")]
    RelationKindMismatch {
        /// Relation name.
        relation: String,
        /// The shape the operation requires.
        expected: String,
    },

    /// A cascade mask contained unknown bits.
    #[error("invalid cascade bits {bits:#x}")]
    InvalidCascade {
        /// The offending bits.
        bits: u8,
    },

    /// A discriminator value has no configured model mapping.
    #[error("relation {relation} has no model for discriminator {value}")]
    UnknownDiscriminator {
        /// Relation name.
        relation: String,
        /// The unmapped discriminator value.
        value: String,
    },

    /// No record with the given key is tracked.
    #[error("no record {key} in model {model}")]
    NoSuchRecord {
        /// Model name.
        model: String,
        /// Flattened record key.
        key: String,
    },

    /// A completion was delivered for a ticket the core no longer tracks.
    #[error("stale or unknown {0}")]
    StaleTicket(crate::tier::Ticket),
}
