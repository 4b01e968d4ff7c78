//! Operations: one unit of work against one tier for one record.

use crate::tier::Tier;
use crate::transaction::Transaction;
use strata_model::RecordKey;
use std::fmt;

/// What an operation does and which tier it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Write the record to the local cache.
    SaveLocal,
    /// Create or update the record on the remote service.
    SaveRemote,
    /// Broadcast the save on the live channel.
    SavePublish,
    /// Remove the record from the local cache.
    RemoveLocal,
    /// Remove the record on the remote service.
    RemoveRemote,
    /// Broadcast the removal on the live channel.
    RemovePublish,
}

impl OperationKind {
    /// The tier this operation represents (its `cascading` tag).
    #[must_use]
    pub fn tier(&self) -> Tier {
        match self {
            OperationKind::SaveLocal | OperationKind::RemoveLocal => Tier::Local,
            OperationKind::SaveRemote | OperationKind::RemoveRemote => Tier::Remote,
            OperationKind::SavePublish | OperationKind::RemovePublish => Tier::Live,
        }
    }

    /// Returns true for save-side operations.
    #[must_use]
    pub fn is_save(&self) -> bool {
        matches!(
            self,
            OperationKind::SaveLocal | OperationKind::SaveRemote | OperationKind::SavePublish
        )
    }

    /// Returns true for remove-side operations.
    #[must_use]
    pub fn is_remove(&self) -> bool {
        !self.is_save()
    }

    /// Returns true if this operation supersedes pending work for the same
    /// record and tier. Removes always win over stale pending saves.
    #[must_use]
    pub fn interrupts(&self) -> bool {
        self.is_remove()
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::SaveLocal => "save-local",
            OperationKind::SaveRemote => "save-remote",
            OperationKind::SavePublish => "save-publish",
            OperationKind::RemoveLocal => "remove-local",
            OperationKind::RemoveRemote => "remove-remote",
            OperationKind::RemovePublish => "remove-publish",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Enqueued, not yet run.
    Pending,
    /// The tier call is outstanding.
    Running,
    /// The tier call succeeded (or the tier no longer applied).
    Succeeded,
    /// The tier call failed.
    Failed,
    /// Superseded by an interrupting operation; finished without side
    /// effects.
    Cancelled,
    /// Queued for the next online transition instead of running.
    Deferred,
}

impl OperationState {
    /// Returns true for the terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded
                | OperationState::Failed
                | OperationState::Cancelled
                | OperationState::Deferred
        )
    }
}

/// One unit of work against one tier for one record.
///
/// Operations belong to exactly one transaction and may chain a
/// continuation: the next operation runs only if this one succeeds, and is
/// cancelled if this one fails or is superseded.
#[derive(Debug)]
pub struct Operation {
    /// Operation id, unique within a replica.
    pub id: u64,
    /// What to do and where.
    pub kind: OperationKind,
    /// Model of the target record.
    pub model: String,
    /// Key of the target record.
    pub key: RecordKey,
    /// The transaction accounting for this operation.
    pub txn: Transaction,
    /// Current lifecycle state.
    pub state: OperationState,
    /// Chained continuation, run on success.
    pub next: Option<Box<Operation>>,
}

impl Operation {
    /// Creates a pending operation.
    pub fn new(
        id: u64,
        kind: OperationKind,
        model: impl Into<String>,
        key: RecordKey,
        txn: Transaction,
    ) -> Self {
        Self {
            id,
            kind,
            model: model.into(),
            key,
            txn,
            state: OperationState::Pending,
            next: None,
        }
    }

    /// Chains a continuation to run after this operation succeeds.
    #[must_use]
    pub fn then(mut self, next: Operation) -> Self {
        self.next = Some(Box::new(next));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tier_mapping() {
        assert_eq!(OperationKind::SaveLocal.tier(), Tier::Local);
        assert_eq!(OperationKind::SaveRemote.tier(), Tier::Remote);
        assert_eq!(OperationKind::SavePublish.tier(), Tier::Live);
        assert_eq!(OperationKind::RemoveLocal.tier(), Tier::Local);
        assert_eq!(OperationKind::RemoveRemote.tier(), Tier::Remote);
        assert_eq!(OperationKind::RemovePublish.tier(), Tier::Live);
    }

    #[test]
    fn removes_interrupt_saves_do_not() {
        assert!(OperationKind::RemoveLocal.interrupts());
        assert!(OperationKind::RemoveRemote.interrupts());
        assert!(!OperationKind::SaveLocal.interrupts());
        assert!(!OperationKind::SaveRemote.interrupts());
    }

    #[test]
    fn terminal_states() {
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::Running.is_terminal());
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Cancelled.is_terminal());
        assert!(OperationState::Deferred.is_terminal());
    }

    #[test]
    fn chaining() {
        let txn = Transaction::new(1);
        let publish = Operation::new(
            2,
            OperationKind::SavePublish,
            "task",
            RecordKey::scalar(1i64),
            txn.clone(),
        );
        let remote = Operation::new(
            1,
            OperationKind::SaveRemote,
            "task",
            RecordKey::scalar(1i64),
            txn,
        )
        .then(publish);

        assert_eq!(remote.next.as_ref().unwrap().kind, OperationKind::SavePublish);
    }
}
