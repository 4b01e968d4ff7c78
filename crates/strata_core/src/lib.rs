//! # Strata Core
//!
//! Operation, transaction, and conflict-resolution core for Strata.
//!
//! This crate provides:
//! - Cascade policies selecting which tiers a mutation touches
//! - Operations and transactions with deterministic result resolution
//! - A three-way conflict merge engine (local edits win, snapshots advance)
//! - A relation engine (one-to-one, one-to-many, polymorphic targets)
//! - Connectivity tracking with deferred-mutation flushing
//! - Tier adapter contracts with in-memory implementations for testing
//!
//! ## Architecture
//!
//! A [`Replica`] owns the canonical record table, one record instance per
//! (model, key), and three tier adapters: a durable local cache, a remote
//! authoritative service, and a live broadcast channel. Every mutation
//! returns a [`Transaction`] immediately; operations run against tiers per
//! the effective [`Cascade`], and the transaction resolves to exactly one
//! terminal result once all of them finish.
//!
//! ## Key Invariants
//!
//! - Local edits always win in live field values
//! - The saved snapshot always advances to the remote baseline
//! - Removal is terminal: a stale save acknowledgement never resurrects
//! - Offline remote work defers and flushes in order on reconnection
//! - Relation state holds keys into the record table, never copies

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cascade;
mod connectivity;
mod error;
mod events;
mod merge;
mod operation;
mod relation;
mod replica;
mod schema;
mod tier;
mod transaction;

pub use cascade::Cascade;
pub use connectivity::Connectivity;
pub use error::{CoreError, CoreResult};
pub use events::{EventFeed, RecordEvent, RecordEventKind};
pub use merge::{merge, merge_into_record, MergeOutcome, UpdateKind};
pub use operation::{Operation, OperationKind, OperationState};
pub use relation::{
    Readiness, RelatedSet, RelationDef, RelationKind, RelationState, RelationTarget,
};
pub use replica::Replica;
pub use schema::{CacheMode, ModelSchema};
pub use tier::{
    Dispatch, LiveChannel, LiveMessage, LiveOp, LocalStore, MemoryChannel, MemoryRemote,
    MemoryStore, QueryResponse, RemoteService, Tier, TierResult, Ticket,
};
pub use transaction::{Disposition, Transaction, TransactionResult};
