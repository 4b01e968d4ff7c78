//! Relation definitions and per-record relation state.
//!
//! A relation definition describes the shape (one-to-one or one-to-many),
//! the related model (possibly selected by a discriminator value), the key
//! fields that wire the two sides together, and behavioural flags. The
//! runtime reacts to field changes and inbound data by issuing cascaded
//! operations and keeping key fields consistent with the in-memory
//! relation.

mod runtime;

pub use runtime::Readiness;
pub(crate) use runtime::{QueuedCall, RelationRuntime};

use crate::cascade::Cascade;
use crate::error::{CoreError, CoreResult};
use strata_model::{RecordKey, Value};
use std::collections::HashMap;

/// The shape of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// One related record, owned by this record (owner holds the key).
    HasOne,
    /// One related record that this record belongs to (owner holds the
    /// key; lifecycle follows the related record).
    BelongsTo,
    /// A collection of related records (children hold the owner's key).
    HasMany,
}

impl RelationKind {
    /// Returns true for the one-to-one shapes.
    #[must_use]
    pub fn is_singular(&self) -> bool {
        matches!(self, RelationKind::HasOne | RelationKind::BelongsTo)
    }
}

/// Which model the relation points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationTarget {
    /// A fixed related model, referenced by name (resolution may be
    /// deferred until the model registers).
    Model(String),
    /// A polymorphic relation: a discriminator field on the owning record
    /// selects the related model through a fixed mapping built at
    /// configuration time.
    Discriminated {
        /// Field on the owning record holding the discriminator value.
        field: String,
        /// Mapping from discriminator value to model name.
        mapping: HashMap<Value, String>,
    },
}

impl RelationTarget {
    /// Model names this target can resolve to.
    pub fn model_names(&self) -> Vec<&str> {
        match self {
            RelationTarget::Model(name) => vec![name.as_str()],
            RelationTarget::Discriminated { mapping, .. } => {
                mapping.values().map(String::as_str).collect()
            }
        }
    }

    /// Resolves the related model for a discriminator value, when
    /// discriminated. A fixed target ignores the value.
    pub fn resolve(&self, relation: &str, value: Option<&Value>) -> CoreResult<String> {
        match self {
            RelationTarget::Model(name) => Ok(name.clone()),
            RelationTarget::Discriminated { mapping, .. } => {
                let value = value.ok_or_else(|| CoreError::UnknownDiscriminator {
                    relation: relation.to_string(),
                    value: "null".to_string(),
                })?;
                mapping
                    .get(value)
                    .cloned()
                    .ok_or_else(|| CoreError::UnknownDiscriminator {
                        relation: relation.to_string(),
                        value: value.to_string(),
                    })
            }
        }
    }

    /// Looks up the discriminator value registered for a model name.
    pub fn discriminator_for(&self, model: &str) -> Option<&Value> {
        match self {
            RelationTarget::Model(_) => None,
            RelationTarget::Discriminated { mapping, .. } => mapping
                .iter()
                .find_map(|(value, name)| (name == model).then_some(value)),
        }
    }
}

/// A declared relation on a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    /// Relation name.
    pub name: String,
    /// Shape.
    pub kind: RelationKind,
    /// Related model, fixed or discriminated.
    pub target: RelationTarget,
    /// Key fields wiring the two sides together. For `HasOne`/`BelongsTo`
    /// these live on the owning record and hold the related record's key;
    /// for `HasMany` they live on the child records and hold the owner's
    /// key.
    pub key_fields: Vec<String>,
    /// Save the side whose key fields were rewritten, if it is already
    /// persisted.
    pub auto_save: bool,
    /// Defer populating the relation until first access.
    pub lazy: bool,
    /// Save propagation for cascaded operations on related records.
    pub save_cascade: Cascade,
    /// Remove propagation for cascaded operations on related records.
    pub remove_cascade: Cascade,
}

impl RelationDef {
    fn new(
        name: impl Into<String>,
        kind: RelationKind,
        target: RelationTarget,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
            key_fields: vec![key_field.into()],
            auto_save: true,
            lazy: false,
            save_cascade: Cascade::NONE,
            remove_cascade: Cascade::NONE,
        }
    }

    /// Declares a one-to-one relation whose key lives on the owner.
    pub fn has_one(
        name: impl Into<String>,
        model: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::HasOne,
            RelationTarget::Model(model.into()),
            key_field,
        )
    }

    /// Declares a belongs-to relation whose key lives on the owner.
    pub fn belongs_to(
        name: impl Into<String>,
        model: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::BelongsTo,
            RelationTarget::Model(model.into()),
            key_field,
        )
    }

    /// Declares a one-to-many relation whose foreign key lives on the
    /// child records.
    pub fn has_many(
        name: impl Into<String>,
        model: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::HasMany,
            RelationTarget::Model(model.into()),
            foreign_key,
        )
    }

    /// Declares a polymorphic one-to-one relation: `discriminator_field`
    /// on the owner selects the related model through `mapping`.
    pub fn has_one_polymorphic(
        name: impl Into<String>,
        discriminator_field: impl Into<String>,
        mapping: HashMap<Value, String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::HasOne,
            RelationTarget::Discriminated {
                field: discriminator_field.into(),
                mapping,
            },
            key_field,
        )
    }

    /// Uses composite key fields instead of a single one.
    #[must_use]
    pub fn with_key_fields(mut self, fields: Vec<String>) -> Self {
        self.key_fields = fields;
        self
    }

    /// Sets the auto-save flag.
    #[must_use]
    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    /// Sets the lazy-loading flag.
    #[must_use]
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Sets the save cascade for related records.
    #[must_use]
    pub fn with_save_cascade(mut self, cascade: Cascade) -> Self {
        self.save_cascade = cascade;
        self
    }

    /// Sets the remove cascade for related records (e.g. removing a parent
    /// removes its children).
    #[must_use]
    pub fn with_remove_cascade(mut self, cascade: Cascade) -> Self {
        self.remove_cascade = cascade;
        self
    }

    /// The discriminator field, for discriminated targets.
    #[must_use]
    pub fn discriminator_field(&self) -> Option<&str> {
        match &self.target {
            RelationTarget::Discriminated { field, .. } => Some(field),
            RelationTarget::Model(_) => None,
        }
    }
}

/// What a relation currently points at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RelatedSet {
    /// Nothing related.
    #[default]
    Empty,
    /// One related record (model name and key).
    One {
        /// The related record's model.
        model: String,
        /// The related record's key.
        key: RecordKey,
    },
    /// A collection of related records, by key. All share the relation's
    /// child model.
    Many(Vec<RecordKey>),
}

impl RelatedSet {
    /// Returns true if nothing is related.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            RelatedSet::Empty => true,
            RelatedSet::One { .. } => false,
            RelatedSet::Many(keys) => keys.is_empty(),
        }
    }

    /// Membership test by key equality.
    #[must_use]
    pub fn contains(&self, key: &RecordKey) -> bool {
        match self {
            RelatedSet::Empty => false,
            RelatedSet::One { key: related, .. } => related == key,
            RelatedSet::Many(keys) => keys.contains(key),
        }
    }
}

/// Per-record runtime state for one relation.
///
/// Relation state holds only keys into the canonical record table, never
/// duplicate record copies.
#[derive(Debug, Clone, Default)]
pub struct RelationState {
    /// The related record or collection, by key.
    pub related: RelatedSet,
    /// The last set applied, for change detection.
    pub last_applied: RelatedSet,
    /// Whether the state has been populated from key fields. Lazy
    /// relations stay unloaded until first access.
    pub loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singular_kinds() {
        assert!(RelationKind::HasOne.is_singular());
        assert!(RelationKind::BelongsTo.is_singular());
        assert!(!RelationKind::HasMany.is_singular());
    }

    #[test]
    fn discriminated_resolution_is_a_pure_lookup() {
        let mapping = HashMap::from([
            (Value::from("email"), "email_target".to_string()),
            (Value::from("phone"), "phone_target".to_string()),
        ]);
        let target = RelationTarget::Discriminated {
            field: "target_type".into(),
            mapping,
        };

        assert_eq!(
            target.resolve("target", Some(&Value::from("email"))).unwrap(),
            "email_target"
        );
        assert_eq!(
            target.discriminator_for("phone_target"),
            Some(&Value::from("phone"))
        );

        let err = target
            .resolve("target", Some(&Value::from("fax")))
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownDiscriminator { .. }));

        let err = target.resolve("target", None).unwrap_err();
        assert!(matches!(err, CoreError::UnknownDiscriminator { .. }));
    }

    #[test]
    fn fixed_target_ignores_discriminator() {
        let target = RelationTarget::Model("list".into());
        assert_eq!(target.resolve("list", None).unwrap(), "list");
        assert_eq!(target.discriminator_for("list"), None);
    }

    #[test]
    fn related_set_membership() {
        let one = RelatedSet::One {
            model: "list".into(),
            key: RecordKey::scalar(1i64),
        };
        assert!(one.contains(&RecordKey::scalar(1i64)));
        assert!(!one.contains(&RecordKey::scalar(2i64)));

        let many = RelatedSet::Many(vec![RecordKey::scalar(1i64), RecordKey::scalar(2i64)]);
        assert!(many.contains(&RecordKey::scalar(2i64)));
        assert!(!RelatedSet::Empty.contains(&RecordKey::scalar(1i64)));
    }

    #[test]
    fn builder_flags() {
        let def = RelationDef::has_many("tasks", "task", "list_id")
            .with_auto_save(false)
            .with_remove_cascade(Cascade::ALL);
        assert_eq!(def.kind, RelationKind::HasMany);
        assert!(!def.auto_save);
        assert_eq!(def.remove_cascade, Cascade::ALL);
        assert_eq!(def.save_cascade, Cascade::NONE);
    }
}
