//! Replica fixtures and schema helpers.
//!
//! Provides a replica wired to in-memory tier adapters, plus the model
//! schemas used across the test suites: a task/list pair for one-to-many
//! behaviour and a polymorphic attachment for discriminated relations.

use std::collections::HashMap;
use std::sync::Arc;
use strata_core::{
    Cascade, MemoryChannel, MemoryRemote, MemoryStore, ModelSchema, RelationDef, Replica,
};
use strata_model::{FieldMap, Value};

/// A replica over in-memory tiers, with the adapter handles kept for
/// seeding and inspection.
pub struct TestReplica {
    /// The replica under test.
    pub replica: Replica,
    /// The in-memory local cache.
    pub store: Arc<MemoryStore>,
    /// The in-memory remote service.
    pub remote: Arc<MemoryRemote>,
    /// The in-memory live channel.
    pub channel: Arc<MemoryChannel>,
}

impl TestReplica {
    /// Creates a replica with no registered models.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let channel = Arc::new(MemoryChannel::new());
        let replica = Replica::new(store.clone(), remote.clone(), channel.clone());
        Self {
            replica,
            store,
            remote,
            channel,
        }
    }

    /// Creates a replica with the task and list schemas registered.
    pub fn with_task_list() -> Self {
        let rig = Self::new();
        rig.replica
            .register_model(list_schema())
            .expect("register list");
        rig.replica
            .register_model(task_schema())
            .expect("register task");
        rig
    }

    /// Creates a replica with the polymorphic attachment schemas
    /// registered (attachment, note, email).
    pub fn with_attachments() -> Self {
        let rig = Self::new();
        rig.replica
            .register_model(attachment_schema())
            .expect("register attachment");
        rig.replica
            .register_model(note_schema())
            .expect("register note");
        rig.replica
            .register_model(email_schema())
            .expect("register email");
        rig
    }

    /// Delivers every held remote completion back to the replica.
    pub fn flush_remote(&self) {
        for (ticket, result) in self.remote.flush() {
            self.replica
                .complete(ticket, result)
                .expect("deliver remote completion");
        }
    }
}

impl Default for TestReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestReplica {
    type Target = Replica;

    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

/// The task schema: belongs to a list through `list_id`.
pub fn task_schema() -> ModelSchema {
    ModelSchema::new("task", &["id", "name", "done", "list_id"])
        .with_relation(RelationDef::belongs_to("list", "list", "list_id"))
}

/// The list schema: has many tasks (removed along with the list).
pub fn list_schema() -> ModelSchema {
    ModelSchema::new("list", &["id", "title"]).with_relation(
        RelationDef::has_many("tasks", "task", "list_id").with_remove_cascade(Cascade::ALL),
    )
}

/// The attachment schema: points at a note or an email, selected by the
/// `target_type` discriminator.
pub fn attachment_schema() -> ModelSchema {
    let mapping = HashMap::from([
        (Value::from("note"), "note".to_string()),
        (Value::from("email"), "email".to_string()),
    ]);
    ModelSchema::new("attachment", &["id", "label", "target_type", "target_id"]).with_relation(
        RelationDef::has_one_polymorphic("target", "target_type", mapping, "target_id"),
    )
}

/// A note, one of the attachment targets.
pub fn note_schema() -> ModelSchema {
    ModelSchema::new("note", &["id", "body"])
}

/// An email, the other attachment target.
pub fn email_schema() -> ModelSchema {
    ModelSchema::new("email", &["id", "subject"])
}

/// Builds a field map from name/value pairs.
pub fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

/// Builds a field map from a JSON object literal.
///
/// Floats are not representable as field values and are rejected.
pub fn fields_json(json: &str) -> FieldMap {
    let parsed: serde_json::Value = serde_json::from_str(json).expect("valid JSON");
    let object = parsed.as_object().expect("a JSON object");
    object
        .iter()
        .map(|(name, value)| (name.clone(), json_to_value(value)))
        .collect()
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Integer(n.as_i64().expect("an integer")),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(_) => panic!("nested objects are not field values"),
    }
}
