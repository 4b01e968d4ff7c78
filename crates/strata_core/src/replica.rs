//! The replica: the coordinator that owns the canonical record table and
//! drives mutations across the three tiers.
//!
//! A replica holds one record instance per (model, key); relation state and
//! collections hold keys into that table, never copies. Mutations enqueue
//! operations against a transaction, run them tier by tier, and fold tier
//! outcomes into record status, events, and the transaction result. Remote
//! work performed while offline is deferred and flushed, in order, on the
//! next online transition.

use crate::cascade::Cascade;
use crate::connectivity::Connectivity;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventFeed, RecordEvent, RecordEventKind};
use crate::merge::{merge_into_record, UpdateKind};
use crate::operation::{Operation, OperationKind, OperationState};
use crate::relation::{
    QueuedCall, Readiness, RelatedSet, RelationDef, RelationKind, RelationRuntime, RelationState,
    RelationTarget,
};
use crate::schema::{CacheMode, ModelSchema};
use crate::tier::{
    Dispatch, LiveChannel, LiveMessage, LiveOp, LocalStore, RemoteService, Ticket, Tier, TierResult,
};
use crate::transaction::{Disposition, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strata_model::{FieldMap, ModelError, Record, RecordKey, Value};

/// (model name, flattened key).
type Addr = (String, String);

/// A mutation queued while offline: the operation kinds of one chain, to be
/// rebuilt against a fresh transaction when connectivity returns.
#[derive(Debug)]
struct DeferredMutation {
    kinds: Vec<OperationKind>,
    model: String,
    key: RecordKey,
}

#[derive(Debug)]
enum InflightEntry {
    /// An operation awaiting its tier completion.
    Op(Operation),
    /// A silent write-through with no transaction accounting.
    Silent,
}

#[derive(Default)]
struct State {
    schemas: HashMap<String, ModelSchema>,
    records: HashMap<Addr, Record>,
    relations: HashMap<(String, String), RelationRuntime>,
    relation_states: HashMap<(String, String, String), RelationState>,
    inflight: HashMap<u64, InflightEntry>,
    deferred: VecDeque<DeferredMutation>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_record(&self, model: &str, key: &RecordKey) -> Option<&Record> {
        self.records
            .get(&(model.to_string(), key.to_map_key()))
            .filter(|record| !record.is_deleted())
    }

    fn runtime_ready(&self, model: &str, relation: &str) -> bool {
        self.relations
            .get(&(model.to_string(), relation.to_string()))
            .is_some_and(|runtime| runtime.readiness == Readiness::Ready)
    }
}

/// Side effects accumulated while the state lock is held, applied after it
/// is released so transaction callbacks can re-enter the replica.
#[derive(Default)]
struct Effects {
    events: Vec<RecordEvent>,
    completions: Vec<(Transaction, Disposition)>,
    seals: Vec<Transaction>,
}

impl Effects {
    fn event(&mut self, model: &str, key: &str, kind: RecordEventKind) {
        self.events.push(RecordEvent::new(model, key, kind));
    }

    fn complete(&mut self, txn: &Transaction, disposition: Disposition) {
        self.completions.push((txn.clone(), disposition));
    }
}

fn key_from_components(mut components: Vec<Value>) -> RecordKey {
    if components.len() == 1 {
        RecordKey::Scalar(components.remove(0))
    } else {
        RecordKey::composite(components)
    }
}

/// The sync coordinator.
///
/// One replica per process, owning the tier adapters it was built with.
/// All methods are callable from any thread; state is guarded by a single
/// lock and tier adapters are called while it is held, so adapters must not
/// call back into the replica synchronously (pending calls complete through
/// [`Replica::complete`]).
pub struct Replica {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    channel: Arc<dyn LiveChannel>,
    connectivity: Connectivity,
    feed: EventFeed,
    state: Mutex<State>,
}

impl Replica {
    /// Creates a replica over the given tier adapters, starting online.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        channel: Arc<dyn LiveChannel>,
    ) -> Self {
        Self {
            store,
            remote,
            channel,
            connectivity: Connectivity::new(),
            feed: EventFeed::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// The connectivity service. Prefer [`Replica::set_online`] for
    /// transitions so deferred mutations flush.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// The record event feed.
    pub fn events(&self) -> &EventFeed {
        &self.feed
    }

    /// Registers a model schema.
    ///
    /// Every key field must be a declared field. Registration resolves
    /// forward-declared relations: every relation whose referenced models
    /// are now all registered becomes ready and replays its queued calls in
    /// arrival order.
    pub fn register_model(&self, schema: ModelSchema) -> CoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            let name = schema.name().to_string();
            if state.schemas.contains_key(&name) {
                return Err(CoreError::DuplicateModel { model: name });
            }
            for field in schema.key_fields() {
                if !schema.fields().iter().any(|f| f == field) {
                    return Err(ModelError::MissingKeyField {
                        model: name,
                        field: field.clone(),
                    }
                    .into());
                }
            }
            for def in schema.relations() {
                state.relations.insert(
                    (name.clone(), def.name.clone()),
                    RelationRuntime::new(def.clone()),
                );
            }
            state.schemas.insert(name.clone(), schema);
            tracing::debug!(model = %name, "model registered");

            let registered: Vec<String> = state.schemas.keys().cloned().collect();
            let mut became_ready = Vec::new();
            for (key, runtime) in state.relations.iter_mut() {
                if runtime.refresh(|model| registered.iter().any(|r| r == model)) {
                    became_ready.push(key.clone());
                }
            }
            for (model, relation) in became_ready {
                let (def, queued) = match state.relations.get_mut(&(model.clone(), relation)) {
                    Some(runtime) => (runtime.def.clone(), std::mem::take(&mut runtime.queued)),
                    None => continue,
                };
                for call in queued {
                    self.replay_queued(&mut state, &model, &def, call, &mut effects);
                }
            }
        }
        self.apply_effects(effects);
        Ok(())
    }

    /// Creates (or updates, if the key is already tracked) a record and
    /// saves it per the model's save cascade.
    ///
    /// A missing scalar key field gets a generated key; a composite key
    /// with any unset component fails fast and nothing is tracked.
    pub fn create(&self, model: &str, mut fields: FieldMap) -> CoreResult<(RecordKey, Transaction)> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let schema = self.schema(&state, model)?;
            for field in fields.keys() {
                if !schema.has_field(field) {
                    return Err(ModelError::UnknownField {
                        model: model.to_string(),
                        field: field.clone(),
                    }
                    .into());
                }
            }
            let key = schema.key_of(&mut fields)?;
            let addr = (model.to_string(), key.to_map_key());
            match state.records.get_mut(&addr) {
                Some(existing) if !existing.is_deleted() => {
                    for (field, value) in fields {
                        existing.set(field, value)?;
                    }
                }
                _ => {
                    let mut record = Record::with_fields(model, fields);
                    record.assign_key(key.clone())?;
                    state.records.insert(addr, record);
                    self.init_relation_states(&mut state, model, &key);
                    self.sync_memberships_for_child(&mut state, model, &key, &mut effects);
                }
            }
            let txn = Transaction::new(state.next_id());
            self.save_into(&mut state, &txn, model, &key, &mut effects)?;
            effects.seals.push(txn.clone());
            Ok((key, txn))
        };
        self.apply_effects(effects);
        result
    }

    /// Returns a copy of a tracked record (deleted ones included).
    pub fn get(&self, model: &str, key: &RecordKey) -> Option<Record> {
        self.state
            .lock()
            .records
            .get(&(model.to_string(), key.to_map_key()))
            .cloned()
    }

    /// Keys of all live records of a model.
    pub fn keys_of(&self, model: &str) -> Vec<RecordKey> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|((m, _), record)| m == model && !record.is_deleted())
            .filter_map(|(_, record)| record.key().cloned())
            .collect()
    }

    /// Restores a record from the local cache into the tracked table.
    ///
    /// Returns true if the record is tracked afterwards. Already-tracked
    /// records are left untouched.
    pub fn load_cached(&self, model: &str, key: &RecordKey) -> CoreResult<bool> {
        let mut state = self.state.lock();
        self.schema(&state, model)?;
        if state.live_record(model, key).is_some() {
            return Ok(true);
        }
        let Some(fields) = self.store.get(key) else {
            return Ok(false);
        };
        let mut record = Record::with_fields(model, fields);
        record.assign_key(key.clone())?;
        record.mark_saved_locally();
        state
            .records
            .insert((model.to_string(), key.to_map_key()), record);
        self.init_relation_states(&mut state, model, key);
        Ok(true)
    }

    /// Saves a record per the model's save cascade, cascading into related
    /// records whose relations declare a save cascade.
    pub fn save(&self, model: &str, key: &RecordKey) -> CoreResult<Transaction> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            self.schema(&state, model)?;
            self.require_live(&state, model, key)?;
            let txn = Transaction::new(state.next_id());
            self.save_into(&mut state, &txn, model, key, &mut effects)?;
            effects.seals.push(txn.clone());
            Ok(txn)
        };
        self.apply_effects(effects);
        result
    }

    /// Removes a record per the model's remove cascade.
    ///
    /// Online, the in-memory record is marked deleted and tier removals
    /// follow; pending deferred saves for the record are cancelled, so a
    /// removal is never undone by a stale save. A cascade that needs the
    /// remote tier cannot be confirmed while offline: the whole removal
    /// defers, the record stays intact, and the cascade replays on the next
    /// online transition.
    pub fn remove(&self, model: &str, key: &RecordKey) -> CoreResult<Transaction> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let schema = self.schema(&state, model)?;
            self.require_live(&state, model, key)?;
            let txn = Transaction::new(state.next_id());
            if schema.remove_cascade().includes(Tier::Remote) && !self.connectivity.is_online() {
                self.defer_removal(
                    &mut state,
                    &txn,
                    model,
                    key,
                    schema.remove_cascade(),
                    &mut effects,
                );
            } else {
                self.remove_confirmed(&mut state, &txn, model, key, &schema, &mut effects);
            }
            effects.seals.push(txn.clone());
            Ok(txn)
        };
        self.apply_effects(effects);
        result
    }

    /// Enacts a removal whose tier work can start now: cascaded children
    /// first, then the record itself.
    fn remove_confirmed(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        key: &RecordKey,
        schema: &ModelSchema,
        effects: &mut Effects,
    ) {
        let mut cascades: Vec<(String, RecordKey, Cascade)> = Vec::new();
        for def in schema.relations() {
            if def.remove_cascade == Cascade::NONE {
                continue;
            }
            self.ensure_relation_loaded(state, model, key, def);
            let state_key = (model.to_string(), key.to_map_key(), def.name.clone());
            match state.relation_states.get(&state_key).map(|rs| rs.related.clone()) {
                Some(RelatedSet::One { model: rm, key: rk }) => {
                    cascades.push((rm, rk, def.remove_cascade));
                }
                Some(RelatedSet::Many(keys)) => {
                    if let Ok(child_model) = def.target.resolve(&def.name, None) {
                        for child in keys {
                            cascades.push((child_model.clone(), child, def.remove_cascade));
                        }
                    }
                }
                _ => {}
            }
        }

        for (child_model, child_key, cascade) in cascades {
            let remotely_saved = state
                .live_record(&child_model, &child_key)
                .is_some_and(Record::is_saved);
            if self.confirm_removed(state, &child_model, &child_key, effects) {
                self.enqueue_remove_ops(
                    state,
                    txn,
                    &child_model,
                    &child_key,
                    cascade,
                    remotely_saved,
                    effects,
                );
            }
        }
        let remotely_saved = state.live_record(model, key).is_some_and(Record::is_saved);
        self.confirm_removed(state, model, key, effects);
        self.enqueue_remove_ops(
            state,
            txn,
            model,
            key,
            schema.remove_cascade(),
            remotely_saved,
            effects,
        );
    }

    /// Defers a removal in full. No tier runs and the record stays live
    /// until the next online transition replays the whole cascade.
    fn defer_removal(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        key: &RecordKey,
        cascade: Cascade,
        effects: &mut Effects,
    ) {
        let kinds: Vec<OperationKind> = [
            (Tier::Local, OperationKind::RemoveLocal),
            (Tier::Remote, OperationKind::RemoveRemote),
            (Tier::Live, OperationKind::RemovePublish),
        ]
        .into_iter()
        .filter(|(tier, _)| cascade.includes(*tier))
        .map(|(_, kind)| kind)
        .collect();
        for _ in &kinds {
            txn.register();
            effects.complete(txn, Disposition::Deferred);
        }
        tracing::debug!(model = %model, key = %key.to_map_key(), "removal deferred until reconnect");
        state.deferred.push_back(DeferredMutation {
            kinds,
            model: model.to_string(),
            key: key.clone(),
        });
    }

    /// Sets a field value. Key fields are immutable through this path.
    ///
    /// Relation state tracking the field (singular key fields,
    /// discriminators, collection memberships) is kept consistent.
    pub fn set_field(&self, model: &str, key: &RecordKey, field: &str, value: Value) -> CoreResult<()> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let schema = self.schema(&state, model)?;
            if !schema.has_field(field) {
                return Err(ModelError::UnknownField {
                    model: model.to_string(),
                    field: field.to_string(),
                }
                .into());
            }
            if schema.key_fields().iter().any(|f| f == field) {
                return Err(ModelError::KeyReassignment {
                    key: key.to_map_key(),
                }
                .into());
            }
            let addr = (model.to_string(), key.to_map_key());
            let record = state
                .records
                .get_mut(&addr)
                .ok_or_else(|| self.no_such_record(model, key))?;
            let previous = record.set(field, value.clone())?;
            if previous.as_ref() != Some(&value) {
                self.after_key_fields_changed(
                    &mut state,
                    model,
                    key,
                    &[field.to_string()],
                    &mut effects,
                );
            }
            Ok(())
        };
        self.apply_effects(effects);
        result
    }

    /// Points a one-to-one relation at a target record (or clears it with
    /// `None`). Key fields (and the discriminator, for polymorphic
    /// relations) are rewritten first, then the relation state, then the
    /// owner auto-saves if it is already persisted.
    ///
    /// If the relation's referenced models are not all registered yet, the
    /// call is queued and replayed on registration; the returned
    /// transaction resolves then.
    pub fn set_related(
        &self,
        model: &str,
        key: &RecordKey,
        relation: &str,
        target: Option<(&str, &RecordKey)>,
    ) -> CoreResult<Transaction> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let def = self.relation_def(&state, model, relation)?;
            if !def.kind.is_singular() {
                return Err(CoreError::RelationKindMismatch {
                    relation: relation.to_string(),
                    expected: "one-to-one".to_string(),
                });
            }
            let txn = Transaction::new(state.next_id());
            if !state.runtime_ready(model, relation) {
                self.queue_call(
                    &mut state,
                    model,
                    relation,
                    QueuedCall::Set {
                        owner: key.clone(),
                        target: target.map(|(m, k)| (m.to_string(), k.clone())),
                        txn: txn.clone(),
                    },
                );
                Ok(txn)
            } else {
                self.set_related_inner(&mut state, &txn, model, key, &def, target, &mut effects)?;
                effects.seals.push(txn.clone());
                Ok(txn)
            }
        };
        self.apply_effects(effects);
        result
    }

    /// Adds a child to a one-to-many relation: the child's foreign key
    /// fields are rewritten to the owner's key and the child auto-saves if
    /// it is already persisted.
    pub fn relate(
        &self,
        model: &str,
        key: &RecordKey,
        relation: &str,
        child: &RecordKey,
    ) -> CoreResult<Transaction> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let def = self.collection_def(&state, model, relation)?;
            let txn = Transaction::new(state.next_id());
            if !state.runtime_ready(model, relation) {
                self.queue_call(
                    &mut state,
                    model,
                    relation,
                    QueuedCall::Relate {
                        owner: key.clone(),
                        child: child.clone(),
                        txn: txn.clone(),
                    },
                );
                Ok(txn)
            } else {
                self.relate_inner(&mut state, &txn, model, key, &def, child, &mut effects)?;
                effects.seals.push(txn.clone());
                Ok(txn)
            }
        };
        self.apply_effects(effects);
        result
    }

    /// Detaches a child from a one-to-many relation, nulling its foreign
    /// key fields. A child not currently related is left untouched.
    pub fn unrelate(
        &self,
        model: &str,
        key: &RecordKey,
        relation: &str,
        child: &RecordKey,
    ) -> CoreResult<Transaction> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let def = self.collection_def(&state, model, relation)?;
            let txn = Transaction::new(state.next_id());
            if !state.runtime_ready(model, relation) {
                self.queue_call(
                    &mut state,
                    model,
                    relation,
                    QueuedCall::Unrelate {
                        owner: key.clone(),
                        child: child.clone(),
                        txn: txn.clone(),
                    },
                );
                Ok(txn)
            } else {
                self.unrelate_inner(&mut state, &txn, model, key, &def, child, &mut effects)?;
                effects.seals.push(txn.clone());
                Ok(txn)
            }
        };
        self.apply_effects(effects);
        result
    }

    /// Membership test: is `candidate` related through `relation`?
    pub fn is_related(
        &self,
        model: &str,
        key: &RecordKey,
        relation: &str,
        candidate: &RecordKey,
    ) -> CoreResult<bool> {
        Ok(self.related_of(model, key, relation)?.contains(candidate))
    }

    /// The current related record or collection of a relation, loading it
    /// from key fields on first access.
    pub fn related_of(&self, model: &str, key: &RecordKey, relation: &str) -> CoreResult<RelatedSet> {
        let mut state = self.state.lock();
        let def = self.relation_def(&state, model, relation)?;
        self.ensure_relation_loaded(&mut state, model, key, &def);
        Ok(state
            .relation_states
            .get(&(model.to_string(), key.to_map_key(), relation.to_string()))
            .map(|rs| rs.related.clone())
            .unwrap_or_default())
    }

    /// Forces a relation's state to be (re)computed from key fields.
    pub fn load_relation(&self, model: &str, key: &RecordKey, relation: &str) -> CoreResult<()> {
        let mut state = self.state.lock();
        let def = self.relation_def(&state, model, relation)?;
        let state_key = (model.to_string(), key.to_map_key(), relation.to_string());
        if let Some(rs) = state.relation_states.get_mut(&state_key) {
            rs.loaded = false;
        }
        self.ensure_relation_loaded(&mut state, model, key, &def);
        Ok(())
    }

    /// Routes an inbound live message: saves merge through the conflict
    /// engine, removals are confirmations (cascading locally per the
    /// relation remove cascades). Messages for unknown keys create records;
    /// messages for deleted records are ignored.
    pub fn receive_live(&self, message: LiveMessage) -> CoreResult<()> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let schema = self.schema(&state, &message.model)?;
            match message.op {
                LiveOp::Save => {
                    self.apply_inbound(&mut state, &message.model, &message.key, &message.data, &mut effects)
                }
                LiveOp::Remove => {
                    let mut children: Vec<(String, RecordKey)> = Vec::new();
                    for def in schema.relations() {
                        if def.remove_cascade == Cascade::NONE {
                            continue;
                        }
                        self.ensure_relation_loaded(&mut state, &message.model, &message.key, def);
                        let state_key = (
                            message.model.clone(),
                            message.key.to_map_key(),
                            def.name.clone(),
                        );
                        match state.relation_states.get(&state_key).map(|rs| rs.related.clone()) {
                            Some(RelatedSet::One { model: rm, key: rk }) => children.push((rm, rk)),
                            Some(RelatedSet::Many(keys)) => {
                                if let Ok(child_model) = def.target.resolve(&def.name, None) {
                                    children
                                        .extend(keys.into_iter().map(|k| (child_model.clone(), k)));
                                }
                            }
                            _ => {}
                        }
                    }
                    if self.confirm_removed(&mut state, &message.model, &message.key, &mut effects) {
                        self.uncache_silently(&mut state, &message.model, &message.key);
                        for (child_model, child_key) in children {
                            if self.confirm_removed(&mut state, &child_model, &child_key, &mut effects)
                            {
                                self.uncache_silently(&mut state, &child_model, &child_key);
                            }
                        }
                    }
                    Ok(())
                }
            }
        };
        self.apply_effects(effects);
        result
    }

    /// Pulls records from the remote service and merges them in, returning
    /// the query outcome and the number of records applied.
    pub fn refresh(&self, model: &str, criteria: &FieldMap) -> CoreResult<(TierResult, usize)> {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let schema = self.schema(&state, model)?;
            let response = self.remote.query(criteria);
            if !response.result.is_success() {
                Ok((response.result, 0))
            } else {
                let mut applied = 0;
                for (_, fields) in response.records {
                    let mut map = fields.clone();
                    match schema.key_of(&mut map) {
                        Ok(key) => {
                            self.apply_inbound(&mut state, model, &key, &map, &mut effects)?;
                            applied += 1;
                        }
                        Err(error) => {
                            tracing::warn!(%error, model, "skipping unkeyed remote record");
                        }
                    }
                }
                Ok((TierResult::ok(), applied))
            }
        };
        self.apply_effects(effects);
        result
    }

    /// Delivers the outcome of a pending tier call.
    ///
    /// Completions for records removed in the meantime finish their
    /// operations as cancelled; nothing is resurrected.
    pub fn complete(&self, ticket: Ticket, result: TierResult) -> CoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            match state.inflight.remove(&ticket.0) {
                None => return Err(CoreError::StaleTicket(ticket)),
                Some(InflightEntry::Silent) => {}
                Some(InflightEntry::Op(op)) => {
                    self.finish_operation(&mut state, op, result, &mut effects);
                }
            }
        }
        self.apply_effects(effects);
        Ok(())
    }

    /// Flips connectivity. The offline-to-online transition flushes
    /// deferred mutations in their original order, each under a fresh
    /// internal transaction.
    pub fn set_online(&self, online: bool) {
        if !self.connectivity.set_online(online) || !online {
            return;
        }
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            let drained: Vec<DeferredMutation> = state.deferred.drain(..).collect();
            if !drained.is_empty() {
                tracing::info!(count = drained.len(), "flushing deferred mutations");
            }
            for mutation in drained {
                if mutation.kinds.first().is_some_and(OperationKind::is_remove)
                    && state.live_record(&mutation.model, &mutation.key).is_some()
                {
                    // A removal deferred in full: the record is still live,
                    // so the whole cascade replays now that the remote can
                    // confirm it.
                    if let Ok(schema) = self.schema(&state, &mutation.model) {
                        let txn = Transaction::new(state.next_id());
                        self.remove_confirmed(
                            &mut state,
                            &txn,
                            &mutation.model,
                            &mutation.key,
                            &schema,
                            &mut effects,
                        );
                        effects.seals.push(txn);
                    }
                    continue;
                }
                let txn = Transaction::new(state.next_id());
                let mut chain: Option<Operation> = None;
                for kind in mutation.kinds.iter().rev() {
                    txn.register();
                    let mut op = Operation::new(
                        state.next_id(),
                        *kind,
                        mutation.model.clone(),
                        mutation.key.clone(),
                        txn.clone(),
                    );
                    if let Some(next) = chain.take() {
                        op.next = Some(Box::new(next));
                    }
                    chain = Some(op);
                }
                if let Some(op) = chain {
                    self.start_operation(&mut state, op, &mut effects);
                }
                effects.seals.push(txn);
            }
        }
        self.apply_effects(effects);
    }

    /// The number of mutations waiting for the next online transition.
    pub fn deferred_len(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// The number of tier calls awaiting completion.
    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    // ---- lookups ----

    fn schema(&self, state: &State, model: &str) -> CoreResult<ModelSchema> {
        state
            .schemas
            .get(model)
            .cloned()
            .ok_or_else(|| CoreError::UnknownModel {
                model: model.to_string(),
            })
    }

    fn relation_def(&self, state: &State, model: &str, relation: &str) -> CoreResult<RelationDef> {
        let schema = self.schema(state, model)?;
        schema
            .relation(relation)
            .cloned()
            .ok_or_else(|| CoreError::UnknownRelation {
                model: model.to_string(),
                relation: relation.to_string(),
            })
    }

    fn collection_def(&self, state: &State, model: &str, relation: &str) -> CoreResult<RelationDef> {
        let def = self.relation_def(state, model, relation)?;
        if def.kind != RelationKind::HasMany {
            return Err(CoreError::RelationKindMismatch {
                relation: relation.to_string(),
                expected: "a collection".to_string(),
            });
        }
        Ok(def)
    }

    fn no_such_record(&self, model: &str, key: &RecordKey) -> CoreError {
        CoreError::NoSuchRecord {
            model: model.to_string(),
            key: key.to_map_key(),
        }
    }

    fn require_live(&self, state: &State, model: &str, key: &RecordKey) -> CoreResult<()> {
        match state.records.get(&(model.to_string(), key.to_map_key())) {
            None => Err(self.no_such_record(model, key)),
            Some(record) if record.is_deleted() => Err(ModelError::Deleted {
                key: key.to_map_key(),
            }
            .into()),
            Some(_) => Ok(()),
        }
    }

    fn queue_call(&self, state: &mut State, model: &str, relation: &str, call: QueuedCall) {
        if let Some(runtime) = state
            .relations
            .get_mut(&(model.to_string(), relation.to_string()))
        {
            tracing::debug!(model, relation, "relation not ready; call queued");
            runtime.queued.push(call);
        }
    }

    // ---- mutation plumbing ----

    fn save_into(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        key: &RecordKey,
        effects: &mut Effects,
    ) -> CoreResult<()> {
        let schema = self.schema(state, model)?;

        // Singular related records save before their owner so foreign keys
        // land on persisted rows.
        for def in schema.relations() {
            if !def.kind.is_singular() || def.save_cascade == Cascade::NONE {
                continue;
            }
            self.ensure_relation_loaded(state, model, key, def);
            let state_key = (model.to_string(), key.to_map_key(), def.name.clone());
            if let Some(RelatedSet::One { model: rm, key: rk }) = state
                .relation_states
                .get(&state_key)
                .map(|rs| rs.related.clone())
            {
                let needs_save = state
                    .live_record(&rm, &rk)
                    .is_some_and(|r| r.is_new() || r.has_local_edits());
                if needs_save {
                    self.enqueue_save_ops(state, txn, &rm, &rk, def.save_cascade, effects);
                }
            }
        }

        self.enqueue_save_ops(state, txn, model, key, schema.save_cascade(), effects);

        for def in schema.relations() {
            if def.kind != RelationKind::HasMany || def.save_cascade == Cascade::NONE {
                continue;
            }
            self.ensure_relation_loaded(state, model, key, def);
            let state_key = (model.to_string(), key.to_map_key(), def.name.clone());
            let children = match state.relation_states.get(&state_key).map(|rs| rs.related.clone()) {
                Some(RelatedSet::Many(keys)) => keys,
                _ => Vec::new(),
            };
            let Ok(child_model) = def.target.resolve(&def.name, None) else {
                continue;
            };
            for child in children {
                let needs_save = state
                    .live_record(&child_model, &child)
                    .is_some_and(|r| r.is_new() || r.has_local_edits());
                if needs_save {
                    self.enqueue_save_ops(state, txn, &child_model, &child, def.save_cascade, effects);
                }
            }
        }
        Ok(())
    }

    fn enqueue_save_ops(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        key: &RecordKey,
        cascade: Cascade,
        effects: &mut Effects,
    ) {
        let mut ops = Vec::new();
        if cascade.includes(Tier::Local) {
            txn.register();
            ops.push(Operation::new(
                state.next_id(),
                OperationKind::SaveLocal,
                model,
                key.clone(),
                txn.clone(),
            ));
        }
        if cascade.includes(Tier::Remote) {
            txn.register();
            let mut remote = Operation::new(
                state.next_id(),
                OperationKind::SaveRemote,
                model,
                key.clone(),
                txn.clone(),
            );
            if cascade.includes(Tier::Live) {
                txn.register();
                remote = remote.then(Operation::new(
                    state.next_id(),
                    OperationKind::SavePublish,
                    model,
                    key.clone(),
                    txn.clone(),
                ));
            }
            ops.push(remote);
        } else if cascade.includes(Tier::Live) {
            txn.register();
            ops.push(Operation::new(
                state.next_id(),
                OperationKind::SavePublish,
                model,
                key.clone(),
                txn.clone(),
            ));
        }
        for op in ops {
            self.start_operation(state, op, effects);
        }
    }

    fn enqueue_remove_ops(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        key: &RecordKey,
        cascade: Cascade,
        remotely_saved: bool,
        effects: &mut Effects,
    ) {
        // A record the remote holds keeps its cache entry until the remote
        // confirms the removal; a rejected removal leaves the cached copy
        // restorable.
        let chain_local =
            remotely_saved && cascade.includes(Tier::Remote) && cascade.includes(Tier::Local);
        let mut ops = Vec::new();
        if cascade.includes(Tier::Local) && !chain_local {
            txn.register();
            ops.push(Operation::new(
                state.next_id(),
                OperationKind::RemoveLocal,
                model,
                key.clone(),
                txn.clone(),
            ));
        }
        if cascade.includes(Tier::Remote) {
            txn.register();
            let mut tail: Option<Operation> = None;
            if cascade.includes(Tier::Live) {
                txn.register();
                tail = Some(Operation::new(
                    state.next_id(),
                    OperationKind::RemovePublish,
                    model,
                    key.clone(),
                    txn.clone(),
                ));
            }
            if chain_local {
                txn.register();
                let mut local = Operation::new(
                    state.next_id(),
                    OperationKind::RemoveLocal,
                    model,
                    key.clone(),
                    txn.clone(),
                );
                if let Some(publish) = tail.take() {
                    local = local.then(publish);
                }
                tail = Some(local);
            }
            let mut remote = Operation::new(
                state.next_id(),
                OperationKind::RemoveRemote,
                model,
                key.clone(),
                txn.clone(),
            );
            if let Some(tail) = tail {
                remote = remote.then(tail);
            }
            ops.push(remote);
        } else if cascade.includes(Tier::Live) {
            txn.register();
            ops.push(Operation::new(
                state.next_id(),
                OperationKind::RemovePublish,
                model,
                key.clone(),
                txn.clone(),
            ));
        }
        for op in ops {
            self.start_operation(state, op, effects);
        }
    }

    /// Runs or defers an operation. Remote and live tiers defer while
    /// offline; the local tier always runs.
    fn start_operation(&self, state: &mut State, op: Operation, effects: &mut Effects) {
        if op.kind.tier() != Tier::Local && !self.connectivity.is_online() {
            self.defer_chain(state, op, effects);
            return;
        }
        self.run_operation(state, op, effects);
    }

    fn defer_chain(&self, state: &mut State, op: Operation, effects: &mut Effects) {
        let model = op.model.clone();
        let key = op.key.clone();
        let mut kinds = Vec::new();
        let mut cursor = Some(Box::new(op));
        while let Some(mut node) = cursor {
            node.state = OperationState::Deferred;
            kinds.push(node.kind);
            effects.complete(&node.txn, Disposition::Deferred);
            cursor = node.next.take();
        }
        tracing::debug!(model = %model, key = %key.to_map_key(), ?kinds, "mutation deferred");
        state.deferred.push_back(DeferredMutation { kinds, model, key });
    }

    fn run_operation(&self, state: &mut State, mut op: Operation, effects: &mut Effects) {
        op.state = OperationState::Running;
        let addr = (op.model.clone(), op.key.to_map_key());

        if op.kind.is_save() && state.records.get(&addr).is_none_or(Record::is_deleted) {
            op.state = OperationState::Cancelled;
            effects.complete(&op.txn, Disposition::Cancelled);
            Self::cancel_chain(op.next.take(), effects);
            return;
        }

        let cache = state
            .schemas
            .get(&op.model)
            .map(ModelSchema::cache)
            .unwrap_or_default();
        if op.kind.tier() == Tier::Local && cache == CacheMode::None {
            // Uncached model: the local tier no longer applies, but the
            // rest of the chain still runs.
            op.state = OperationState::Succeeded;
            effects.complete(&op.txn, Disposition::Noop);
            if let Some(next) = op.next.take() {
                self.start_operation(state, *next, effects);
            }
            return;
        }

        let fields = state
            .records
            .get(&addr)
            .map(|record| record.fields().clone())
            .unwrap_or_default();
        let remotely_saved = state.records.get(&addr).is_some_and(Record::is_saved);
        let ticket = Ticket(state.next_id());

        let dispatch = match op.kind {
            OperationKind::SaveLocal => {
                if self.store.is_usable() {
                    self.store.put(&op.key, &fields, ticket)
                } else {
                    Dispatch::Done(TierResult::Unavailable)
                }
            }
            OperationKind::RemoveLocal => {
                if self.store.is_usable() {
                    self.store.remove(&op.key, ticket)
                } else {
                    Dispatch::Done(TierResult::Unavailable)
                }
            }
            OperationKind::SaveRemote => {
                if remotely_saved {
                    self.remote.update(&op.key, &fields, ticket)
                } else {
                    self.remote.create(&op.key, &fields, ticket)
                }
            }
            OperationKind::RemoveRemote => self.remote.remove(&op.key, ticket),
            OperationKind::SavePublish => Dispatch::Done(self.channel.publish(LiveMessage::save(
                op.model.clone(),
                op.key.clone(),
                fields,
            ))),
            OperationKind::RemovePublish => Dispatch::Done(
                self.channel
                    .publish(LiveMessage::remove(op.model.clone(), op.key.clone())),
            ),
        };

        match dispatch {
            Dispatch::Done(result) => self.finish_operation(state, op, result, effects),
            Dispatch::Pending => {
                state.inflight.insert(ticket.0, InflightEntry::Op(op));
            }
        }
    }

    fn finish_operation(
        &self,
        state: &mut State,
        mut op: Operation,
        result: TierResult,
        effects: &mut Effects,
    ) {
        let addr = (op.model.clone(), op.key.to_map_key());
        let removed_meanwhile = state.records.get(&addr).is_none_or(Record::is_deleted);
        if op.kind.is_save() && removed_meanwhile {
            // A late save acknowledgement for a removed record never
            // resurrects it.
            op.state = OperationState::Cancelled;
            effects.complete(&op.txn, Disposition::Cancelled);
            Self::cancel_chain(op.next.take(), effects);
            return;
        }

        let model = op.model.clone();
        let key = op.key.clone();
        let map_key = key.to_map_key();

        let disposition = match op.kind {
            OperationKind::SaveLocal => match result {
                TierResult::Success { .. } => {
                    if let Some(record) = state.records.get_mut(&addr) {
                        record.mark_saved_locally();
                    }
                    effects.event(&model, &map_key, RecordEventKind::SavedLocally);
                    Disposition::Succeeded(Tier::Local)
                }
                _ => Disposition::Failed(Tier::Local),
            },
            OperationKind::SaveRemote => match result {
                TierResult::Success { data } => {
                    let mut changed: Vec<String> = Vec::new();
                    if let Some(record) = state.records.get_mut(&addr) {
                        record.mark_saved_remotely();
                        if let Some(data) = &data {
                            let outcome = merge_into_record(record, data);
                            changed = outcome.updated.keys().cloned().collect();
                            let refinement = match outcome.kind {
                                UpdateKind::Full => RecordEventKind::FullUpdate,
                                UpdateKind::Partial => RecordEventKind::PartialUpdate,
                            };
                            effects.events.push(
                                RecordEvent::new(&model, &map_key, RecordEventKind::RemoteUpdate)
                                    .with_merge(outcome.clone()),
                            );
                            effects.events.push(
                                RecordEvent::new(&model, &map_key, refinement).with_merge(outcome),
                            );
                        }
                    }
                    effects.event(&model, &map_key, RecordEventKind::SavedRemotely);
                    if !changed.is_empty() {
                        self.after_key_fields_changed(state, &model, &key, &changed, effects);
                    }
                    self.cache_silently(state, &model, &key);
                    if let Some(next) = op.next.take() {
                        self.start_operation(state, *next, effects);
                    }
                    Disposition::Succeeded(Tier::Remote)
                }
                TierResult::Gone => {
                    // The remote no longer holds the record; treat as an
                    // authoritative removal.
                    self.confirm_removed(state, &model, &key, effects);
                    self.uncache_silently(state, &model, &key);
                    Self::cancel_chain(op.next.take(), effects);
                    Disposition::Failed(Tier::Remote)
                }
                _ => {
                    Self::cancel_chain(op.next.take(), effects);
                    Disposition::Failed(Tier::Remote)
                }
            },
            OperationKind::SavePublish | OperationKind::RemovePublish => {
                if result.is_success() {
                    Disposition::Succeeded(Tier::Live)
                } else {
                    Disposition::Failed(Tier::Live)
                }
            }
            OperationKind::RemoveLocal => match result {
                TierResult::Success { .. } => {
                    if let Some(next) = op.next.take() {
                        self.start_operation(state, *next, effects);
                    }
                    Disposition::Succeeded(Tier::Local)
                }
                // Nothing cached to remove: confirmation either way.
                TierResult::Gone | TierResult::Unavailable => {
                    if let Some(next) = op.next.take() {
                        self.start_operation(state, *next, effects);
                    }
                    Disposition::Noop
                }
                _ => {
                    Self::cancel_chain(op.next.take(), effects);
                    Disposition::Failed(Tier::Local)
                }
            },
            OperationKind::RemoveRemote => match result {
                TierResult::Success { .. } | TierResult::Gone => {
                    if let Some(next) = op.next.take() {
                        self.start_operation(state, *next, effects);
                    }
                    Disposition::Succeeded(Tier::Remote)
                }
                TierResult::Transient(reason) => {
                    // Retry the removal on the next online transition.
                    tracing::debug!(model = %model, key = %map_key, %reason, "remote removal will retry");
                    let mut kinds = vec![op.kind];
                    let mut cursor = op.next.take();
                    while let Some(mut node) = cursor {
                        kinds.push(node.kind);
                        node.state = OperationState::Cancelled;
                        effects.complete(&node.txn, Disposition::Cancelled);
                        cursor = node.next.take();
                    }
                    state.deferred.push_back(DeferredMutation { kinds, model, key });
                    Disposition::Failed(Tier::Remote)
                }
                _ => {
                    Self::cancel_chain(op.next.take(), effects);
                    Disposition::Failed(Tier::Remote)
                }
            },
        };

        op.state = match disposition {
            Disposition::Succeeded(_) | Disposition::Noop => OperationState::Succeeded,
            Disposition::Failed(_) => OperationState::Failed,
            Disposition::Cancelled => OperationState::Cancelled,
            Disposition::Deferred => OperationState::Deferred,
        };
        effects.complete(&op.txn, disposition);
    }

    fn cancel_chain(mut next: Option<Box<Operation>>, effects: &mut Effects) {
        while let Some(mut node) = next {
            node.state = OperationState::Cancelled;
            effects.complete(&node.txn, Disposition::Cancelled);
            next = node.next.take();
        }
    }

    /// Best-effort write-through of the current fields into the local
    /// cache, outside any transaction.
    fn cache_silently(&self, state: &mut State, model: &str, key: &RecordKey) {
        let cache = state
            .schemas
            .get(model)
            .map(ModelSchema::cache)
            .unwrap_or_default();
        if cache == CacheMode::None || !self.store.is_usable() {
            return;
        }
        let Some(fields) = state
            .live_record(model, key)
            .map(|record| record.fields().clone())
        else {
            return;
        };
        let ticket = Ticket(state.next_id());
        if let Dispatch::Pending = self.store.put(key, &fields, ticket) {
            state.inflight.insert(ticket.0, InflightEntry::Silent);
        }
    }

    fn uncache_silently(&self, state: &mut State, model: &str, key: &RecordKey) {
        let cache = state
            .schemas
            .get(model)
            .map(ModelSchema::cache)
            .unwrap_or_default();
        if cache == CacheMode::None || !self.store.is_usable() {
            return;
        }
        let ticket = Ticket(state.next_id());
        if let Dispatch::Pending = self.store.remove(key, ticket) {
            state.inflight.insert(ticket.0, InflightEntry::Silent);
        }
    }

    /// Marks a record deleted in memory and detaches it from all relation
    /// state. Returns false if the record is unknown or already deleted.
    fn confirm_removed(
        &self,
        state: &mut State,
        model: &str,
        key: &RecordKey,
        effects: &mut Effects,
    ) -> bool {
        let addr = (model.to_string(), key.to_map_key());
        match state.records.get_mut(&addr) {
            Some(record) if !record.is_deleted() => record.mark_deleted(),
            _ => return false,
        }
        let map_key = key.to_map_key();
        effects.event(model, &map_key, RecordEventKind::Removed);

        // Pending offline saves die with the record.
        state.deferred.retain(|mutation| {
            !(mutation.model == model
                && mutation.key == *key
                && mutation.kinds.first().is_some_and(OperationKind::is_save))
        });

        state
            .relation_states
            .retain(|(m, mk, _), _| !(m == model && *mk == map_key));

        self.sync_memberships_for_child(state, model, key, effects);

        // Detach one-to-one relations that pointed here, nulling the
        // owners' key fields.
        let pointing: Vec<(String, String, String)> = state
            .relation_states
            .iter()
            .filter(|(_, rs)| {
                matches!(&rs.related, RelatedSet::One { model: m, key: k } if m == model && k == key)
            })
            .map(|(state_key, _)| state_key.clone())
            .collect();
        for (owner_model, owner_mk, relation) in pointing {
            if let Some(rs) = state.relation_states.get_mut(&(
                owner_model.clone(),
                owner_mk.clone(),
                relation.clone(),
            )) {
                rs.related = RelatedSet::Empty;
                rs.last_applied = RelatedSet::Empty;
            }
            effects.event(&owner_model, &owner_mk, RecordEventKind::RelationUpdate);
            let def = state
                .relations
                .get(&(owner_model.clone(), relation))
                .map(|runtime| runtime.def.clone());
            if let Some(def) = def {
                if let Some(owner) = state
                    .records
                    .get_mut(&(owner_model.clone(), owner_mk.clone()))
                {
                    let mut changed = false;
                    for field in &def.key_fields {
                        if owner.get(field).is_some_and(|v| !v.is_null()) {
                            let _ = owner.set(field.clone(), Value::Null);
                            changed = true;
                        }
                    }
                    if let Some(field) = def.discriminator_field() {
                        if owner.get(field).is_some_and(|v| !v.is_null()) {
                            let _ = owner.set(field.to_string(), Value::Null);
                            changed = true;
                        }
                    }
                    if changed {
                        effects.event(&owner_model, &owner_mk, RecordEventKind::KeyUpdate);
                    }
                }
            }
        }
        true
    }

    // ---- inbound data ----

    fn apply_inbound(
        &self,
        state: &mut State,
        model: &str,
        key: &RecordKey,
        data: &FieldMap,
        effects: &mut Effects,
    ) -> CoreResult<()> {
        let addr = (model.to_string(), key.to_map_key());
        let map_key = key.to_map_key();

        let (outcome, fresh) = match state.records.get_mut(&addr) {
            Some(record) if record.is_deleted() => return Ok(()),
            Some(record) => {
                let outcome = merge_into_record(record, data);
                record.note_remote_sync();
                (outcome, false)
            }
            None => {
                let mut record = Record::new(model);
                record.assign_key(key.clone())?;
                let outcome = merge_into_record(&mut record, data);
                record.note_remote_sync();
                state.records.insert(addr, record);
                self.init_relation_states(state, model, key);
                (outcome, true)
            }
        };

        let refinement = match outcome.kind {
            UpdateKind::Full => RecordEventKind::FullUpdate,
            UpdateKind::Partial => RecordEventKind::PartialUpdate,
        };
        effects.events.push(
            RecordEvent::new(model, &map_key, RecordEventKind::RemoteUpdate)
                .with_merge(outcome.clone()),
        );
        effects
            .events
            .push(RecordEvent::new(model, &map_key, refinement).with_merge(outcome.clone()));

        let changed: Vec<String> = if fresh {
            data.keys().cloned().collect()
        } else {
            outcome.updated.keys().cloned().collect()
        };
        if !changed.is_empty() {
            self.after_key_fields_changed(state, model, key, &changed, effects);
        }
        self.cache_silently(state, model, key);
        Ok(())
    }

    // ---- relation engine ----

    fn init_relation_states(&self, state: &mut State, model: &str, key: &RecordKey) {
        let defs: Vec<RelationDef> = state
            .schemas
            .get(model)
            .map(|schema| schema.relations().to_vec())
            .unwrap_or_default();
        let map_key = key.to_map_key();
        for def in defs {
            state
                .relation_states
                .entry((model.to_string(), map_key.clone(), def.name.clone()))
                .or_default();
            if !def.lazy {
                self.ensure_relation_loaded(state, model, key, &def);
            }
        }
    }

    fn ensure_relation_loaded(
        &self,
        state: &mut State,
        model: &str,
        owner: &RecordKey,
        def: &RelationDef,
    ) {
        if !state.runtime_ready(model, &def.name) {
            self.queue_call(
                state,
                model,
                &def.name,
                QueuedCall::Load {
                    owner: owner.clone(),
                },
            );
            return;
        }
        let state_key = (model.to_string(), owner.to_map_key(), def.name.clone());
        if state
            .relation_states
            .get(&state_key)
            .is_some_and(|rs| rs.loaded)
        {
            return;
        }
        let related = self.compute_related(state, model, owner, def);
        let rs = state.relation_states.entry(state_key).or_default();
        rs.related = related.clone();
        rs.last_applied = related;
        rs.loaded = true;
    }

    /// Derives a relation's state purely from key fields: no side effects,
    /// no saves.
    fn compute_related(
        &self,
        state: &State,
        model: &str,
        owner: &RecordKey,
        def: &RelationDef,
    ) -> RelatedSet {
        let Some(record) = state.live_record(model, owner) else {
            return RelatedSet::Empty;
        };
        if def.kind.is_singular() {
            let components: Option<Vec<Value>> = def
                .key_fields
                .iter()
                .map(|field| record.get(field).filter(|v| !v.is_null()).cloned())
                .collect();
            let Some(components) = components else {
                return RelatedSet::Empty;
            };
            let discriminator = def.discriminator_field().and_then(|field| record.get(field));
            match def.target.resolve(&def.name, discriminator) {
                Ok(target_model) => RelatedSet::One {
                    model: target_model,
                    key: key_from_components(components),
                },
                Err(_) => RelatedSet::Empty,
            }
        } else {
            let Ok(child_model) = def.target.resolve(&def.name, None) else {
                return RelatedSet::Empty;
            };
            let owner_components = owner.components();
            let mut keys: Vec<RecordKey> = state
                .records
                .iter()
                .filter(|((m, _), child)| *m == child_model && !child.is_deleted())
                .filter(|(_, child)| {
                    def.key_fields
                        .iter()
                        .map(|field| child.get(field))
                        .eq(owner_components.iter().map(Some))
                })
                .filter_map(|(_, child)| child.key().cloned())
                .collect();
            keys.sort_by(|a, b| a.to_map_key().cmp(&b.to_map_key()));
            RelatedSet::Many(keys)
        }
    }

    /// Reconciles relation state after key fields changed on a record:
    /// singular relations on the record reload, and collections on other
    /// records gain or lose it as a member.
    fn after_key_fields_changed(
        &self,
        state: &mut State,
        model: &str,
        key: &RecordKey,
        fields: &[String],
        effects: &mut Effects,
    ) {
        let map_key = key.to_map_key();
        let singular_defs: Vec<RelationDef> = state
            .schemas
            .get(model)
            .map(|schema| {
                schema
                    .relations()
                    .iter()
                    .filter(|def| {
                        def.kind.is_singular()
                            && (def.key_fields.iter().any(|f| fields.contains(f))
                                || def
                                    .discriminator_field()
                                    .is_some_and(|f| fields.iter().any(|g| g == f)))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for def in singular_defs {
            let state_key = (model.to_string(), map_key.clone(), def.name.clone());
            if !state
                .relation_states
                .get(&state_key)
                .is_some_and(|rs| rs.loaded)
            {
                continue;
            }
            let related = self.compute_related(state, model, key, &def);
            if let Some(rs) = state.relation_states.get_mut(&state_key) {
                if rs.related != related {
                    rs.related = related.clone();
                    rs.last_applied = related;
                    effects.event(model, &map_key, RecordEventKind::RelationUpdate);
                }
            }
        }

        let membership_relevant = state.schemas.values().any(|schema| {
            schema.relations().iter().any(|def| {
                def.kind == RelationKind::HasMany
                    && def.target.model_names().contains(&model)
                    && def.key_fields.iter().any(|f| fields.contains(f))
            })
        });
        if membership_relevant {
            self.sync_memberships_for_child(state, model, key, effects);
        }
    }

    /// Re-evaluates which collections the record belongs to, from its
    /// foreign key fields.
    fn sync_memberships_for_child(
        &self,
        state: &mut State,
        child_model: &str,
        child_key: &RecordKey,
        effects: &mut Effects,
    ) {
        let child_addr = (child_model.to_string(), child_key.to_map_key());
        let (child_fields, child_deleted) = match state.records.get(&child_addr) {
            Some(record) => (record.fields().clone(), record.is_deleted()),
            None => return,
        };

        let defs: Vec<(String, RelationDef)> = state
            .schemas
            .values()
            .flat_map(|schema| {
                schema
                    .relations()
                    .iter()
                    .filter(|def| {
                        def.kind == RelationKind::HasMany
                            && def.target.model_names().contains(&child_model)
                    })
                    .map(|def| (schema.name().to_string(), def.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (parent_model, def) in defs {
            let owner_key = if child_deleted {
                None
            } else {
                def.key_fields
                    .iter()
                    .map(|field| child_fields.get(field).filter(|v| !v.is_null()).cloned())
                    .collect::<Option<Vec<_>>>()
                    .map(key_from_components)
            };
            let parents: Vec<(String, bool)> = state
                .records
                .iter()
                .filter(|((m, _), record)| *m == parent_model && !record.is_deleted())
                .map(|((_, mk), record)| (mk.clone(), record.key() == owner_key.as_ref()))
                .collect();
            for (parent_mk, is_owner) in parents {
                let state_key = (parent_model.clone(), parent_mk.clone(), def.name.clone());
                let Some(rs) = state.relation_states.get_mut(&state_key) else {
                    continue;
                };
                if !rs.loaded {
                    continue;
                }
                let mut changed = false;
                match &mut rs.related {
                    RelatedSet::Many(keys) => {
                        if is_owner && !keys.contains(child_key) {
                            keys.push(child_key.clone());
                            changed = true;
                        } else if !is_owner && keys.contains(child_key) {
                            keys.retain(|k| k != child_key);
                            changed = true;
                        }
                    }
                    other if is_owner => {
                        *other = RelatedSet::Many(vec![child_key.clone()]);
                        changed = true;
                    }
                    _ => {}
                }
                if changed {
                    rs.last_applied = rs.related.clone();
                    effects.event(&parent_model, &parent_mk, RecordEventKind::RelationUpdate);
                }
            }
        }
    }

    fn set_related_inner(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        owner: &RecordKey,
        def: &RelationDef,
        target: Option<(&str, &RecordKey)>,
        effects: &mut Effects,
    ) -> CoreResult<()> {
        self.require_live(state, model, owner)?;
        self.ensure_relation_loaded(state, model, owner, def);

        let mut pairs: Vec<(String, Value)> = Vec::new();
        match target {
            Some((target_model, target_key)) => {
                match &def.target {
                    RelationTarget::Model(name) => {
                        if name != target_model {
                            return Err(CoreError::RelationKindMismatch {
                                relation: def.name.clone(),
                                expected: format!("a relation to {name}"),
                            });
                        }
                    }
                    RelationTarget::Discriminated { field, .. } => {
                        let value = def
                            .target
                            .discriminator_for(target_model)
                            .cloned()
                            .ok_or_else(|| CoreError::UnknownDiscriminator {
                                relation: def.name.clone(),
                                value: target_model.to_string(),
                            })?;
                        pairs.push((field.clone(), value));
                    }
                }
                for (field, value) in def.key_fields.iter().zip(target_key.components()) {
                    pairs.push((field.clone(), value.clone()));
                }
            }
            None => {
                for field in &def.key_fields {
                    pairs.push((field.clone(), Value::Null));
                }
                if let Some(field) = def.discriminator_field() {
                    pairs.push((field.to_string(), Value::Null));
                }
            }
        }

        self.write_key_fields(state, txn, model, owner, def, pairs, effects)
    }

    fn relate_inner(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        owner: &RecordKey,
        def: &RelationDef,
        child: &RecordKey,
        effects: &mut Effects,
    ) -> CoreResult<()> {
        self.require_live(state, model, owner)?;
        let child_model = def.target.resolve(&def.name, None)?;
        self.require_live(state, &child_model, child)?;
        self.ensure_relation_loaded(state, model, owner, def);

        let pairs: Vec<(String, Value)> = def
            .key_fields
            .iter()
            .zip(owner.components())
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        self.write_key_fields(state, txn, &child_model, child, def, pairs, effects)
    }

    fn unrelate_inner(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        owner: &RecordKey,
        def: &RelationDef,
        child: &RecordKey,
        effects: &mut Effects,
    ) -> CoreResult<()> {
        self.require_live(state, model, owner)?;
        let child_model = def.target.resolve(&def.name, None)?;
        self.require_live(state, &child_model, child)?;
        self.ensure_relation_loaded(state, model, owner, def);

        // Only detach a child that actually points at this owner.
        let points_here = state.live_record(&child_model, child).is_some_and(|record| {
            def.key_fields
                .iter()
                .map(|field| record.get(field))
                .eq(owner.components().iter().map(Some))
        });
        if !points_here {
            return Ok(());
        }

        let pairs: Vec<(String, Value)> = def
            .key_fields
            .iter()
            .map(|field| (field.clone(), Value::Null))
            .collect();
        self.write_key_fields(state, txn, &child_model, child, def, pairs, effects)
    }

    /// Writes relation-driven key field values onto a record, emits the
    /// key-update event, reconciles relation state, and auto-saves the
    /// record if the relation asks for it and the record is persisted.
    #[allow(clippy::too_many_arguments)]
    fn write_key_fields(
        &self,
        state: &mut State,
        txn: &Transaction,
        model: &str,
        key: &RecordKey,
        def: &RelationDef,
        pairs: Vec<(String, Value)>,
        effects: &mut Effects,
    ) -> CoreResult<()> {
        let addr = (model.to_string(), key.to_map_key());
        let mut changed_fields = Vec::new();
        if let Some(record) = state.records.get_mut(&addr) {
            for (field, value) in pairs {
                if record.get(&field) != Some(&value) {
                    record.set(field.clone(), value)?;
                    changed_fields.push(field);
                }
            }
        }
        if changed_fields.is_empty() {
            return Ok(());
        }

        let map_key = key.to_map_key();
        effects.event(model, &map_key, RecordEventKind::KeyUpdate);
        self.after_key_fields_changed(state, model, key, &changed_fields, effects);

        let persisted = state
            .records
            .get(&addr)
            .is_some_and(|record| !record.is_new());
        if def.auto_save && persisted {
            let cascade = state
                .schemas
                .get(model)
                .map(ModelSchema::save_cascade)
                .unwrap_or_default();
            self.enqueue_save_ops(state, txn, model, key, cascade, effects);
        }
        Ok(())
    }

    fn replay_queued(
        &self,
        state: &mut State,
        model: &str,
        def: &RelationDef,
        call: QueuedCall,
        effects: &mut Effects,
    ) {
        match call {
            QueuedCall::Load { owner } => {
                self.ensure_relation_loaded(state, model, &owner, def);
            }
            QueuedCall::Set { owner, target, txn } => {
                let target = target.as_ref().map(|(m, k)| (m.as_str(), k));
                if let Err(error) =
                    self.set_related_inner(state, &txn, model, &owner, def, target, effects)
                {
                    tracing::warn!(%error, relation = %def.name, "queued relation call failed");
                }
                effects.seals.push(txn);
            }
            QueuedCall::Relate { owner, child, txn } => {
                if let Err(error) =
                    self.relate_inner(state, &txn, model, &owner, def, &child, effects)
                {
                    tracing::warn!(%error, relation = %def.name, "queued relation call failed");
                }
                effects.seals.push(txn);
            }
            QueuedCall::Unrelate { owner, child, txn } => {
                if let Err(error) =
                    self.unrelate_inner(state, &txn, model, &owner, def, &child, effects)
                {
                    tracing::warn!(%error, relation = %def.name, "queued relation call failed");
                }
                effects.seals.push(txn);
            }
        }
    }

    fn apply_effects(&self, effects: Effects) {
        for event in effects.events {
            self.feed.emit(event);
        }
        for (txn, disposition) in effects.completions {
            txn.complete(disposition);
        }
        for txn in effects.seals {
            txn.seal();
        }
    }
}
