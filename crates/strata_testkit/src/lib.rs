//! # Strata Testkit
//!
//! Test utilities for Strata.
//!
//! This crate provides:
//! - Replica fixtures wired to in-memory tier adapters
//! - Ready-made model schemas (task/list, polymorphic attachments)
//! - Field map construction helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use strata_testkit::prelude::*;
//!
//! let rig = TestReplica::with_task_list();
//! let (key, txn) = rig.create("task", fields(&[("name", "t0".into())])).unwrap();
//! assert!(txn.result().is_some());
//! assert!(rig.remote.contains(&key));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
