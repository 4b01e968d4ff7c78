//! Tier adapter contracts.
//!
//! The core drives three tiers: a durable local cache, a remote
//! authoritative service, and a live broadcast channel. Concrete transports
//! are out of scope; this module defines the contracts they implement and
//! in-memory implementations used for testing.
//!
//! Adapter calls complete either synchronously ([`Dispatch::Done`]) or
//! later ([`Dispatch::Pending`]); a pending call is finished by handing its
//! [`Ticket`] and outcome back to the replica. This is the explicit
//! rendering of success/failure continuations.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_model::{FieldMap, RecordKey};

/// One of the three storage/propagation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// In-process/local durable cache.
    Local,
    /// Remote authoritative service.
    Remote,
    /// Live broadcast channel.
    Live,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
            Tier::Live => write!(f, "live"),
        }
    }
}

/// Correlates a pending tier call with its eventual outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}

/// Classified outcome of a tier call.
///
/// Failures are data, not exceptions: the operation that issued the call
/// folds the classification into its own completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierResult {
    /// The call succeeded. `data` optionally carries the tier's view of the
    /// record (e.g. a remote service echoing server-assigned fields).
    Success {
        /// Field values returned by the tier, if any.
        data: Option<FieldMap>,
    },
    /// The record no longer exists on the tier (not-found/gone). On remove
    /// this is confirmation, not an error.
    Gone,
    /// A transient failure; the caller may retry the whole mutation.
    Transient(String),
    /// An unexpected status; the record is left unmodified on the tier.
    Unexpected(String),
    /// The tier is not usable at all (e.g. no durable local storage).
    Unavailable,
}

impl TierResult {
    /// A plain success with no returned data.
    #[must_use]
    pub fn ok() -> Self {
        TierResult::Success { data: None }
    }

    /// A success carrying returned field data.
    #[must_use]
    pub fn with_data(data: FieldMap) -> Self {
        TierResult::Success { data: Some(data) }
    }

    /// Returns true for `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, TierResult::Success { .. })
    }
}

/// How a tier call completed at the call site.
#[derive(Debug)]
pub enum Dispatch {
    /// The call finished synchronously with this outcome.
    Done(TierResult),
    /// The call is outstanding; the adapter will complete the issued
    /// ticket later.
    Pending,
}

/// Local tier adapter: a durable in-process cache.
pub trait LocalStore: Send + Sync {
    /// Reports whether durable local storage exists at all. When false,
    /// local operations fail immediately and are never retried.
    fn is_usable(&self) -> bool;

    /// Reads a cached record. Local reads are synchronous by contract.
    fn get(&self, key: &RecordKey) -> Option<FieldMap>;

    /// Writes a record to the cache.
    fn put(&self, key: &RecordKey, fields: &FieldMap, ticket: Ticket) -> Dispatch;

    /// Removes a record from the cache.
    fn remove(&self, key: &RecordKey, ticket: Ticket) -> Dispatch;
}

/// Response to a remote query.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// Classified outcome of the query call.
    pub result: TierResult,
    /// Matched records, keyed by record key.
    pub records: Vec<(RecordKey, FieldMap)>,
}

/// Remote tier adapter: the authoritative service.
pub trait RemoteService: Send + Sync {
    /// Creates a record that has never been saved remotely.
    fn create(&self, key: &RecordKey, fields: &FieldMap, ticket: Ticket) -> Dispatch;

    /// Updates an already remotely-saved record.
    fn update(&self, key: &RecordKey, fields: &FieldMap, ticket: Ticket) -> Dispatch;

    /// Removes a record.
    fn remove(&self, key: &RecordKey, ticket: Ticket) -> Dispatch;

    /// Queries records matching the criteria (empty criteria match all).
    fn query(&self, criteria: &FieldMap) -> QueryResponse;
}

/// Kind of a live channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveOp {
    /// A record was saved on another client.
    Save,
    /// A record was removed on another client.
    Remove,
}

/// A message on the live broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMessage {
    /// Save or remove.
    pub op: LiveOp,
    /// Model the record belongs to.
    pub model: String,
    /// The record's key.
    pub key: RecordKey,
    /// Field data (empty for removes).
    pub data: FieldMap,
}

impl LiveMessage {
    /// Builds a save broadcast.
    pub fn save(model: impl Into<String>, key: RecordKey, data: FieldMap) -> Self {
        Self {
            op: LiveOp::Save,
            model: model.into(),
            key,
            data,
        }
    }

    /// Builds a remove broadcast.
    pub fn remove(model: impl Into<String>, key: RecordKey) -> Self {
        Self {
            op: LiveOp::Remove,
            model: model.into(),
            key,
            data: FieldMap::new(),
        }
    }
}

/// Live tier adapter: outbound broadcasts.
///
/// Inbound messages are routed through `Replica::receive_live` by whatever
/// subscription plumbing the host application uses.
pub trait LiveChannel: Send + Sync {
    /// Publishes a broadcast. Broadcasts are fire-and-forget.
    fn publish(&self, message: LiveMessage) -> TierResult;
}

/// An in-memory local store for testing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    usable: AtomicBool,
    map: RwLock<std::collections::HashMap<String, FieldMap>>,
}

impl MemoryStore {
    /// Creates a usable in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            usable: AtomicBool::new(true),
            map: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Toggles usability (an unusable store models environments without
    /// durable local storage).
    pub fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::SeqCst);
    }

    /// Returns true if a record is cached.
    #[must_use]
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.map.read().contains_key(&key.to_map_key())
    }

    /// Returns the number of cached records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    fn get(&self, key: &RecordKey) -> Option<FieldMap> {
        if !self.is_usable() {
            return None;
        }
        self.map.read().get(&key.to_map_key()).cloned()
    }

    fn put(&self, key: &RecordKey, fields: &FieldMap, _ticket: Ticket) -> Dispatch {
        if !self.is_usable() {
            return Dispatch::Done(TierResult::Unavailable);
        }
        self.map.write().insert(key.to_map_key(), fields.clone());
        Dispatch::Done(TierResult::ok())
    }

    fn remove(&self, key: &RecordKey, _ticket: Ticket) -> Dispatch {
        if !self.is_usable() {
            return Dispatch::Done(TierResult::Unavailable);
        }
        self.map.write().remove(&key.to_map_key());
        Dispatch::Done(TierResult::ok())
    }
}

#[derive(Debug)]
enum HeldCall {
    Put { key: RecordKey, fields: FieldMap },
    Remove { key: RecordKey },
}

/// An in-memory remote service for testing.
///
/// Supports status injection (force every call to report e.g. `Gone`) and
/// deferral: with deferral on, calls return [`Dispatch::Pending`] and are
/// applied when [`MemoryRemote::flush`] is called, modeling an in-flight
/// network call.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    map: RwLock<std::collections::HashMap<String, FieldMap>>,
    forced: RwLock<Option<TierResult>>,
    defer: AtomicBool,
    held: Mutex<Vec<(Ticket, HeldCall)>>,
}

impl MemoryRemote {
    /// Creates an empty remote service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces every subsequent call to complete with the given result
    /// (without touching stored data). Pass `None` to restore normal
    /// behaviour.
    pub fn force_result(&self, result: Option<TierResult>) {
        *self.forced.write() = result;
    }

    /// Turns deferral on or off.
    pub fn set_defer(&self, defer: bool) {
        self.defer.store(defer, Ordering::SeqCst);
    }

    /// Applies and drains all held calls, returning each ticket with its
    /// outcome so the caller can deliver them to the replica.
    pub fn flush(&self) -> Vec<(Ticket, TierResult)> {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        held.into_iter()
            .map(|(ticket, call)| (ticket, self.apply(call)))
            .collect()
    }

    /// Returns true if a record exists on the remote.
    #[must_use]
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.map.read().contains_key(&key.to_map_key())
    }

    /// Returns the number of remote records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns true if the remote holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Seeds a record directly (as if another client created it).
    pub fn seed(&self, key: &RecordKey, fields: FieldMap) {
        self.map.write().insert(key.to_map_key(), fields);
    }

    fn apply(&self, call: HeldCall) -> TierResult {
        if let Some(forced) = self.forced.read().clone() {
            return forced;
        }
        match call {
            HeldCall::Put { key, fields } => {
                self.map.write().insert(key.to_map_key(), fields);
                TierResult::ok()
            }
            HeldCall::Remove { key } => {
                self.map.write().remove(&key.to_map_key());
                TierResult::ok()
            }
        }
    }

    fn dispatch(&self, ticket: Ticket, call: HeldCall) -> Dispatch {
        if self.defer.load(Ordering::SeqCst) {
            self.held.lock().push((ticket, call));
            Dispatch::Pending
        } else {
            Dispatch::Done(self.apply(call))
        }
    }
}

impl RemoteService for MemoryRemote {
    fn create(&self, key: &RecordKey, fields: &FieldMap, ticket: Ticket) -> Dispatch {
        self.dispatch(
            ticket,
            HeldCall::Put {
                key: key.clone(),
                fields: fields.clone(),
            },
        )
    }

    fn update(&self, key: &RecordKey, fields: &FieldMap, ticket: Ticket) -> Dispatch {
        self.dispatch(
            ticket,
            HeldCall::Put {
                key: key.clone(),
                fields: fields.clone(),
            },
        )
    }

    fn remove(&self, key: &RecordKey, ticket: Ticket) -> Dispatch {
        self.dispatch(ticket, HeldCall::Remove { key: key.clone() })
    }

    fn query(&self, criteria: &FieldMap) -> QueryResponse {
        if let Some(forced) = self.forced.read().clone() {
            return QueryResponse {
                result: forced,
                records: Vec::new(),
            };
        }
        let records = self
            .map
            .read()
            .iter()
            .filter(|(_, fields)| {
                criteria
                    .iter()
                    .all(|(name, value)| fields.get(name) == Some(value))
            })
            .map(|(map_key, fields)| {
                // Map keys in the memory remote are flattened scalar keys.
                (
                    RecordKey::scalar(strata_model::Value::Text(map_key.clone())),
                    fields.clone(),
                )
            })
            .collect();
        QueryResponse {
            result: TierResult::ok(),
            records,
        }
    }
}

/// An in-memory live channel that records outbound broadcasts.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    outbound: Mutex<Vec<LiveMessage>>,
}

impl MemoryChannel {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns all published messages.
    pub fn take_published(&self) -> Vec<LiveMessage> {
        self.outbound.lock().drain(..).collect()
    }

    /// Returns the number of published messages without draining.
    #[must_use]
    pub fn published_len(&self) -> usize {
        self.outbound.lock().len()
    }
}

impl LiveChannel for MemoryChannel {
    fn publish(&self, message: LiveMessage) -> TierResult {
        self.outbound.lock().push(message);
        TierResult::ok()
    }
}
