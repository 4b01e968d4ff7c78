//! Model schemas.

use crate::cascade::Cascade;
use crate::relation::RelationDef;
use strata_model::{FieldMap, ModelError, ModelResult, RecordKey, Value};

/// Whether a model uses the local cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Cache everything locally (the default).
    #[default]
    All,
    /// Skip the local cache: local operations complete as no-ops and
    /// mutations go straight to the remote tier.
    None,
}

/// Declares a model: its fields, key, cache mode, default cascades, and
/// relations.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    name: String,
    fields: Vec<String>,
    key_fields: Vec<String>,
    cache: CacheMode,
    save_cascade: Cascade,
    remove_cascade: Cascade,
    relations: Vec<RelationDef>,
}

impl ModelSchema {
    /// Creates a schema with a single `id` key field, full caching, and
    /// all-tier cascades.
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            key_fields: vec!["id".to_string()],
            cache: CacheMode::All,
            save_cascade: Cascade::ALL,
            remove_cascade: Cascade::ALL,
            relations: Vec::new(),
        }
    }

    /// Uses a different single key field.
    #[must_use]
    pub fn with_key(mut self, field: impl Into<String>) -> Self {
        self.key_fields = vec![field.into()];
        self
    }

    /// Uses an ordered composite key.
    #[must_use]
    pub fn with_composite_key(mut self, fields: &[&str]) -> Self {
        self.key_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Sets the cache mode.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the save cascade.
    #[must_use]
    pub fn with_save_cascade(mut self, cascade: Cascade) -> Self {
        self.save_cascade = cascade;
        self
    }

    /// Sets the remove cascade.
    #[must_use]
    pub fn with_remove_cascade(mut self, cascade: Cascade) -> Self {
        self.remove_cascade = cascade;
        self
    }

    /// Declares a relation.
    #[must_use]
    pub fn with_relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    /// Returns the model name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Returns true if the field is declared (key fields included).
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field) || self.key_fields.iter().any(|f| f == field)
    }

    /// Returns the ordered key fields.
    #[must_use]
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Returns true for a composite key.
    #[must_use]
    pub fn has_composite_key(&self) -> bool {
        self.key_fields.len() > 1
    }

    /// Returns the cache mode.
    #[must_use]
    pub fn cache(&self) -> CacheMode {
        self.cache
    }

    /// Returns the save cascade.
    #[must_use]
    pub fn save_cascade(&self) -> Cascade {
        self.save_cascade
    }

    /// Returns the remove cascade.
    #[must_use]
    pub fn remove_cascade(&self) -> Cascade {
        self.remove_cascade
    }

    /// Returns the declared relations.
    #[must_use]
    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    /// Looks up a relation by name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Builds the record key from field values.
    ///
    /// A single unset key field gets a generated UUID (written back into
    /// `fields`). A composite key with any unset component is a programmer
    /// error and fails fast.
    pub fn key_of(&self, fields: &mut FieldMap) -> ModelResult<RecordKey> {
        if self.has_composite_key() {
            let mut components = Vec::with_capacity(self.key_fields.len());
            for field in &self.key_fields {
                match fields.get(field) {
                    Some(value) if !value.is_null() => components.push(value.clone()),
                    _ => {
                        return Err(ModelError::IncompleteKey {
                            model: self.name.clone(),
                            field: field.clone(),
                        })
                    }
                }
            }
            Ok(RecordKey::composite(components))
        } else {
            let field = &self.key_fields[0];
            match fields.get(field) {
                Some(value) if !value.is_null() => Ok(RecordKey::Scalar(value.clone())),
                _ => {
                    let key = RecordKey::generate();
                    fields.insert(field.clone(), key.components()[0].clone());
                    Ok(key)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn scalar_key_from_fields() {
        let schema = ModelSchema::new("task", &["id", "name"]);
        let mut map = fields(&[("id", Value::from(3i64))]);
        assert_eq!(schema.key_of(&mut map).unwrap(), RecordKey::scalar(3i64));
    }

    #[test]
    fn missing_scalar_key_is_generated_and_written_back() {
        let schema = ModelSchema::new("task", &["id", "name"]);
        let mut map = fields(&[("name", Value::from("t0"))]);
        let key = schema.key_of(&mut map).unwrap();
        assert!(key.is_complete());
        assert_eq!(map.get("id"), Some(&key.components()[0]));
    }

    #[test]
    fn incomplete_composite_key_fails_fast() {
        let schema = ModelSchema::new("member", &["group_id", "user_id", "role"])
            .with_composite_key(&["group_id", "user_id"]);

        let mut map = fields(&[("group_id", Value::from(1i64))]);
        let err = schema.key_of(&mut map).unwrap_err();
        assert!(matches!(err, ModelError::IncompleteKey { ref field, .. } if field == "user_id"));

        let mut map = fields(&[
            ("group_id", Value::from(1i64)),
            ("user_id", Value::Null),
        ]);
        assert!(schema.key_of(&mut map).is_err());
    }

    #[test]
    fn complete_composite_key() {
        let schema = ModelSchema::new("member", &["group_id", "user_id"])
            .with_composite_key(&["group_id", "user_id"]);
        let mut map = fields(&[
            ("group_id", Value::from(1i64)),
            ("user_id", Value::from(2i64)),
        ]);
        let key = schema.key_of(&mut map).unwrap();
        assert_eq!(key.to_map_key(), "1/2");
    }

    #[test]
    fn field_declarations() {
        let schema = ModelSchema::new("task", &["name", "done"]).with_key("id");
        assert!(schema.has_field("name"));
        assert!(schema.has_field("id"));
        assert!(!schema.has_field("missing"));
    }
}
