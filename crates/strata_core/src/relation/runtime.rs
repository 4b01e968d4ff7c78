//! Relation readiness and queued calls.

use super::RelationDef;
use crate::transaction::Transaction;
use strata_model::RecordKey;

/// Resolution state of a relation's model reference.
///
/// Relations may be declared against models that register later
/// (forward-declared by name). Until every referenced model is registered,
/// calls against the relation are queued and replayed in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Declared; resolution not yet attempted.
    Uninitialized,
    /// At least one referenced model is not registered yet.
    Initializing,
    /// All referenced models are registered; calls apply immediately.
    Ready,
}

/// A relation call that arrived before the relation was ready.
#[derive(Debug)]
pub(crate) enum QueuedCall {
    Load {
        owner: RecordKey,
    },
    Set {
        owner: RecordKey,
        target: Option<(String, RecordKey)>,
        txn: Transaction,
    },
    Relate {
        owner: RecordKey,
        child: RecordKey,
        txn: Transaction,
    },
    Unrelate {
        owner: RecordKey,
        child: RecordKey,
        txn: Transaction,
    },
}

/// Per-model runtime for one declared relation.
#[derive(Debug)]
pub(crate) struct RelationRuntime {
    pub def: RelationDef,
    pub readiness: Readiness,
    pub queued: Vec<QueuedCall>,
}

impl RelationRuntime {
    pub fn new(def: RelationDef) -> Self {
        Self {
            def,
            readiness: Readiness::Uninitialized,
            queued: Vec::new(),
        }
    }

    /// Recomputes readiness given a predicate over registered model names.
    /// Returns true when the runtime just became ready.
    pub fn refresh(&mut self, is_registered: impl Fn(&str) -> bool) -> bool {
        let was_ready = self.readiness == Readiness::Ready;
        let all_registered = self
            .def
            .target
            .model_names()
            .iter()
            .all(|name| is_registered(name));
        self.readiness = if all_registered {
            Readiness::Ready
        } else {
            Readiness::Initializing
        };
        !was_ready && self.readiness == Readiness::Ready
    }
}
