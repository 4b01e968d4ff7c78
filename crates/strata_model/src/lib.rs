//! # Strata Model
//!
//! Record primitives for the Strata synchronization core.
//!
//! This crate provides:
//! - Dynamic field values ([`Value`])
//! - Scalar and composite record keys ([`RecordKey`])
//! - Records with a saved snapshot and lifecycle status ([`Record`])
//!
//! A record tracks three things beside its fields: its key (immutable once
//! assigned), the last field values known to be synchronized with the local
//! tier (the saved snapshot), and a lifecycle status. The snapshot is what
//! makes three-way conflict merging possible in `strata_core`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod record;
mod value;

pub use error::{ModelError, ModelResult};
pub use key::{RecordKey, KEY_SEPARATOR};
pub use record::{FieldMap, Record, RecordStatus};
pub use value::Value;
