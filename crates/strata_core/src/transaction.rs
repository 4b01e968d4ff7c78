//! Transactions: counted groups of operations from one top-level mutation.

use crate::tier::Tier;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Terminal result of a transaction, summarizing what actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResult {
    /// At least one remote-tier operation succeeded.
    RemoteSuccess,
    /// No remote success, but at least one local-tier operation succeeded.
    LocalSuccess,
    /// Nothing ran because of connectivity; the mutation was deferred.
    Offline,
    /// Every operation failed or was cancelled.
    Failure,
}

/// How a single member operation finished, for transaction accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The operation succeeded against its tier.
    Succeeded(Tier),
    /// The operation failed against its tier.
    Failed(Tier),
    /// The operation was superseded and finished without side effects.
    Cancelled,
    /// The operation was queued for later because the process is offline.
    Deferred,
    /// The tier no longer applied; the operation finished as a no-op
    /// without claiming a tier success.
    Noop,
}

type Callback = Box<dyn FnOnce(TransactionResult) + Send>;

#[derive(Default)]
struct Inner {
    operations: usize,
    completed: usize,
    remote_success: bool,
    local_success: bool,
    deferred: bool,
    sealed: bool,
    result: Option<TransactionResult>,
    callbacks: Vec<Callback>,
}

impl Inner {
    fn compute_result(&self) -> TransactionResult {
        if self.remote_success {
            TransactionResult::RemoteSuccess
        } else if self.local_success {
            TransactionResult::LocalSuccess
        } else if self.deferred {
            TransactionResult::Offline
        } else {
            TransactionResult::Failure
        }
    }
}

/// An observable handle for one top-level mutation.
///
/// Every mutation call returns a transaction immediately. Operations are
/// enqueued against it (cascaded relation operations roll into the same
/// transaction), each completion is counted, and once all members have
/// finished the transaction resolves to exactly one terminal result.
/// Resolution is irrevocable.
#[derive(Clone)]
pub struct Transaction {
    id: u64,
    inner: Arc<Mutex<Inner>>,
}

impl Transaction {
    /// Creates an empty, unsealed transaction.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Registers one more member operation.
    pub fn register(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.result.is_none(), "register after resolution");
        inner.operations += 1;
    }

    /// Records the completion of one member operation.
    pub fn complete(&self, disposition: Disposition) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.completed += 1;
            debug_assert!(inner.completed <= inner.operations);
            match disposition {
                Disposition::Succeeded(Tier::Remote | Tier::Live) => {
                    inner.remote_success = true;
                }
                Disposition::Succeeded(Tier::Local) => inner.local_success = true,
                Disposition::Deferred => inner.deferred = true,
                Disposition::Failed(_) | Disposition::Cancelled | Disposition::Noop => {}
            }
            Self::try_resolve(&mut inner)
        };
        self.run_callbacks(callbacks);
    }

    /// Seals the transaction: no further operations will be registered.
    ///
    /// A sealed transaction resolves as soon as its last member completes;
    /// a sealed transaction with no members resolves immediately.
    pub fn seal(&self) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.sealed = true;
            Self::try_resolve(&mut inner)
        };
        self.run_callbacks(callbacks);
    }

    /// Total operations enqueued so far.
    #[must_use]
    pub fn operations(&self) -> usize {
        self.inner.lock().operations
    }

    /// Operations finished so far (succeeded, failed, cancelled, deferred).
    #[must_use]
    pub fn completed(&self) -> usize {
        self.inner.lock().completed
    }

    /// Returns true once every member operation has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.completed == inner.operations
    }

    /// Returns the terminal result, once resolved.
    #[must_use]
    pub fn result(&self) -> Option<TransactionResult> {
        self.inner.lock().result
    }

    /// Registers a callback invoked exactly once with the terminal result.
    ///
    /// If the transaction is already resolved, the callback runs
    /// immediately, before any subsequently scheduled work.
    pub fn then(&self, callback: impl FnOnce(TransactionResult) + Send + 'static) {
        let resolved = {
            let mut inner = self.inner.lock();
            match inner.result {
                Some(result) => Some(result),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(result) = resolved {
            callback(result);
        }
    }

    fn try_resolve(inner: &mut Inner) -> Option<(TransactionResult, Vec<Callback>)> {
        if inner.result.is_some() || !inner.sealed || inner.completed != inner.operations {
            return None;
        }
        let result = inner.compute_result();
        inner.result = Some(result);
        Some((result, std::mem::take(&mut inner.callbacks)))
    }

    fn run_callbacks(&self, resolved: Option<(TransactionResult, Vec<Callback>)>) {
        if let Some((result, callbacks)) = resolved {
            tracing::debug!(txn = self.id, ?result, "transaction resolved");
            for callback in callbacks {
                callback(result);
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("operations", &inner.operations)
            .field("completed", &inner.completed)
            .field("result", &inner.result)
            .finish()
    }
}
