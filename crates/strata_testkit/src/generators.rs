//! Property-based test generators using proptest.
//!
//! Strategies for field values, field maps, and record keys that stay
//! within the invariants the core expects (no floats, non-empty keys).

use proptest::prelude::*;
use strata_model::{FieldMap, RecordKey, Value};

/// Strategy for generating field values (one level of array nesting).
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::Text),
    ];
    leaf.clone().prop_recursive(1, 8, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::Array)
    })
}

/// Strategy for generating valid field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("valid regex")
}

/// Strategy for generating field maps.
pub fn field_map_strategy() -> impl Strategy<Value = FieldMap> {
    prop::collection::hash_map(field_name_strategy(), value_strategy(), 0..8)
}

/// Strategy for generating non-null scalar key components.
pub fn key_component_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        (1i64..1_000_000).prop_map(Value::Integer),
        "[a-z0-9]{4,12}".prop_map(Value::Text),
    ]
}

/// Strategy for generating complete scalar or composite record keys.
pub fn record_key_strategy() -> impl Strategy<Value = RecordKey> {
    prop_oneof![
        key_component_strategy().prop_map(RecordKey::Scalar),
        prop::collection::vec(key_component_strategy(), 2..4).prop_map(RecordKey::composite),
    ]
}
