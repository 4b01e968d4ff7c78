//! Records and their lifecycle.

use crate::error::{ModelError, ModelResult};
use crate::key::RecordKey;
use crate::value::Value;
use std::collections::HashMap;

/// A flat mapping from field name to value.
pub type FieldMap = HashMap<String, Value>;

/// Lifecycle status of a record.
///
/// Transitions: `Transient` → `SavedLocally` (local save succeeds) →
/// `SavedRemotely` (remote save succeeds); any state → `Deleted` (remove
/// confirmed per cascade policy). `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Constructed but never saved.
    Transient,
    /// Synchronized with the local tier.
    SavedLocally,
    /// Synchronized with the remote tier (implies saved locally).
    SavedRemotely,
    /// Removed; no further operations may run against it.
    Deleted,
}

/// A single addressable entity instance.
///
/// A record owns its field map exclusively. Collections hold record keys,
/// never duplicate copies, so there is a single source of truth per record.
#[derive(Debug, Clone)]
pub struct Record {
    model: String,
    key: Option<RecordKey>,
    fields: FieldMap,
    saved: Option<FieldMap>,
    status: RecordStatus,
}

impl Record {
    /// Creates a new transient record for the given model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            key: None,
            fields: FieldMap::new(),
            saved: None,
            status: RecordStatus::Transient,
        }
    }

    /// Creates a new transient record with initial field values.
    pub fn with_fields(model: impl Into<String>, fields: FieldMap) -> Self {
        let mut record = Self::new(model);
        record.fields = fields;
        record
    }

    /// Returns the model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the key, if assigned.
    #[must_use]
    pub fn key(&self) -> Option<&RecordKey> {
        self.key.as_ref()
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// Assigns the record's key.
    ///
    /// Keys are immutable once assigned: re-assigning a different key is an
    /// error; re-assigning the same key is a no-op.
    pub fn assign_key(&mut self, key: RecordKey) -> ModelResult<()> {
        match &self.key {
            Some(existing) if *existing != key => Err(ModelError::KeyReassignment {
                key: existing.to_map_key(),
            }),
            _ => {
                self.key = Some(key);
                Ok(())
            }
        }
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a field value, returning the previous value.
    ///
    /// Rejected once the record is deleted.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> ModelResult<Option<Value>> {
        self.ensure_live()?;
        Ok(self.fields.insert(field.into(), value))
    }

    /// Returns the current field values.
    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Returns a mutable view of the current field values.
    ///
    /// Callers must not use this to bypass the deleted check; use
    /// [`Record::set`] for ordinary mutation.
    pub fn fields_mut(&mut self) -> &mut FieldMap {
        &mut self.fields
    }

    /// Returns the saved snapshot, absent until the first local save.
    #[must_use]
    pub fn saved(&self) -> Option<&FieldMap> {
        self.saved.as_ref()
    }

    /// Returns a mutable view of the saved snapshot.
    pub fn saved_mut(&mut self) -> Option<&mut FieldMap> {
        self.saved.as_mut()
    }

    /// Replaces the saved snapshot without changing the lifecycle status.
    ///
    /// The merge engine uses this to advance the snapshot to the remote
    /// baseline after folding in inbound data. No-op once deleted.
    pub fn advance_snapshot(&mut self, saved: FieldMap) {
        if self.is_deleted() {
            return;
        }
        self.saved = Some(saved);
    }

    /// Returns the fields whose current value differs from the snapshot.
    ///
    /// With no snapshot every field counts as an edit.
    #[must_use]
    pub fn local_edits(&self) -> FieldMap {
        match &self.saved {
            None => self.fields.clone(),
            Some(saved) => self
                .fields
                .iter()
                .filter(|(name, value)| saved.get(*name) != Some(value))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    /// Returns true if any field diverges from the saved snapshot.
    #[must_use]
    pub fn has_local_edits(&self) -> bool {
        match &self.saved {
            None => !self.fields.is_empty(),
            Some(saved) => self
                .fields
                .iter()
                .any(|(name, value)| saved.get(name) != Some(value)),
        }
    }

    /// Returns true if the record was never saved.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.status == RecordStatus::Transient
    }

    /// Returns true if the record is synchronized with the local tier.
    #[must_use]
    pub fn is_saved_locally(&self) -> bool {
        matches!(
            self.status,
            RecordStatus::SavedLocally | RecordStatus::SavedRemotely
        )
    }

    /// Returns true if the record is synchronized with the remote tier.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.status == RecordStatus::SavedRemotely
    }

    /// Returns true if the record has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status == RecordStatus::Deleted
    }

    /// Records a successful local save: advances the status and refreshes
    /// the saved snapshot. No-op once deleted (a stale completion).
    pub fn mark_saved_locally(&mut self) {
        if self.is_deleted() {
            return;
        }
        if self.status == RecordStatus::Transient {
            self.status = RecordStatus::SavedLocally;
        }
        self.saved = Some(self.fields.clone());
    }

    /// Records a successful remote save. No-op once deleted.
    pub fn mark_saved_remotely(&mut self) {
        if self.is_deleted() {
            return;
        }
        self.status = RecordStatus::SavedRemotely;
        self.saved = Some(self.fields.clone());
    }

    /// Advances the status to remotely-synchronized without touching the
    /// saved snapshot. The merge engine installs its own snapshot when
    /// folding in inbound data. No-op once deleted.
    pub fn note_remote_sync(&mut self) {
        if self.is_deleted() {
            return;
        }
        self.status = RecordStatus::SavedRemotely;
    }

    /// Marks the record deleted: the key and saved snapshot are cleared
    /// and the status can never change again.
    pub fn mark_deleted(&mut self) {
        self.status = RecordStatus::Deleted;
        self.key = None;
        self.saved = None;
    }

    fn ensure_live(&self) -> ModelResult<()> {
        if self.is_deleted() {
            Err(ModelError::Deleted {
                key: self
                    .key
                    .as_ref()
                    .map(RecordKey::to_map_key)
                    .unwrap_or_default(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Record {
        let mut record = Record::new("task");
        record.set("name", Value::from("t0")).unwrap();
        record.set("done", Value::from(false)).unwrap();
        record
    }

    #[test]
    fn new_record_is_transient() {
        let record = task();
        assert!(record.is_new());
        assert!(!record.is_saved_locally());
        assert!(!record.is_saved());
        assert!(record.saved().is_none());
    }

    #[test]
    fn key_is_immutable_once_assigned() {
        let mut record = task();
        record.assign_key(RecordKey::scalar(1i64)).unwrap();
        // Same key is fine.
        record.assign_key(RecordKey::scalar(1i64)).unwrap();

        let err = record.assign_key(RecordKey::scalar(2i64)).unwrap_err();
        assert!(matches!(err, ModelError::KeyReassignment { .. }));
    }

    #[test]
    fn local_save_sets_snapshot() {
        let mut record = task();
        record.mark_saved_locally();

        assert!(record.is_saved_locally());
        assert!(!record.is_saved());
        assert_eq!(record.saved().unwrap().get("name"), Some(&Value::from("t0")));
    }

    #[test]
    fn remote_save_implies_local() {
        let mut record = task();
        record.mark_saved_remotely();
        assert!(record.is_saved());
        assert!(record.is_saved_locally());
    }

    #[test]
    fn local_edits_diff_against_snapshot() {
        let mut record = task();
        record.mark_saved_locally();
        assert!(!record.has_local_edits());

        record.set("name", Value::from("t1")).unwrap();
        let edits = record.local_edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits.get("name"), Some(&Value::from("t1")));
    }

    #[test]
    fn deleted_clears_key_and_snapshot() {
        let mut record = task();
        record.assign_key(RecordKey::scalar(1i64)).unwrap();
        record.mark_saved_locally();

        record.mark_deleted();

        assert!(record.is_deleted());
        assert!(record.key().is_none());
        assert!(record.saved().is_none());
    }

    #[test]
    fn deleted_is_terminal() {
        let mut record = task();
        record.mark_deleted();

        record.mark_saved_locally();
        record.mark_saved_remotely();
        assert!(record.is_deleted());

        let err = record.set("name", Value::from("x")).unwrap_err();
        assert!(matches!(err, ModelError::Deleted { .. }));
    }
}
