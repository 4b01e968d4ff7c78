//! Conflict merge engine.
//!
//! Whenever field data arrives from the remote service or the live channel
//! for a record that may carry unsynchronized local edits, the merge engine
//! computes, per field, whether the remote actually changed it, whether a
//! local edit exists, and whether the two collide. Local edits always win
//! in the live values; the saved snapshot always advances to the remote
//! baseline so future diffing compares against what the remote truly holds.

use serde::{Deserialize, Serialize};
use strata_model::{FieldMap, Record};

/// Which refinement of the remote-update event fired.
///
/// Exactly one of the two fires per inbound payload; the superset
/// remote-update event always fires alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    /// The incoming payload was the complete new remote state and nothing
    /// local conflicted with it.
    Full,
    /// Some fields applied but a concurrent local edit was involved, or the
    /// payload only covered a subset of the tracked fields.
    Partial,
}

/// The result of merging one inbound payload into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Full or partial.
    pub kind: UpdateKind,
    /// Fields whose live value was advanced to the incoming value.
    pub updated: FieldMap,
    /// The live values before this merge.
    pub previous: FieldMap,
    /// The saved snapshot before this merge (for audit/undo).
    pub saved: FieldMap,
    /// Fields where a local edit and the incoming value disagreed. The map
    /// holds the incoming value that lost in the live values.
    pub conflicts: FieldMap,
}

impl MergeOutcome {
    /// Returns true if nothing changed and nothing conflicted.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.conflicts.is_empty()
    }
}

/// Merges an incoming payload into `current`/`saved` field maps.
///
/// Per field present in `incoming`:
/// 1. `incoming == saved`: the remote did not change the field relative to
///    the last sync; ignored.
/// 2. no local edit (`current == saved`): the incoming value is applied to
///    both maps and recorded in `updated`.
/// 3. a local edit exists and disagrees with the incoming value: the local
///    edit wins in `current`, the snapshot still advances, and the field is
///    recorded in `conflicts`.
/// 4. a local edit exists but equals the incoming value: treated as case 2.
pub fn merge(saved: &mut FieldMap, current: &mut FieldMap, incoming: &FieldMap) -> MergeOutcome {
    let previous = current.clone();
    let saved_before = saved.clone();

    let mut updated = FieldMap::new();
    let mut conflicts = FieldMap::new();
    let mut edited_field_touched = false;

    for (field, incoming_value) in incoming {
        let saved_value = saved.get(field);
        if saved_value == Some(incoming_value) {
            // Case 1: unchanged remotely.
            continue;
        }

        let current_value = current.get(field);
        let locally_edited = current_value != saved_value;

        if locally_edited {
            edited_field_touched = true;
        }

        if locally_edited && current_value != Some(incoming_value) {
            // Case 3: conflict. Local wins in `current`, the snapshot still
            // advances to the true remote baseline.
            saved.insert(field.clone(), incoming_value.clone());
            conflicts.insert(field.clone(), incoming_value.clone());
        } else {
            // Cases 2 and 4: apply and advance.
            current.insert(field.clone(), incoming_value.clone());
            saved.insert(field.clone(), incoming_value.clone());
            updated.insert(field.clone(), incoming_value.clone());
        }
    }

    let covers_tracked = previous.keys().all(|field| incoming.contains_key(field));
    let kind = if conflicts.is_empty() && !edited_field_touched && covers_tracked {
        UpdateKind::Full
    } else {
        UpdateKind::Partial
    };

    MergeOutcome {
        kind,
        updated,
        previous,
        saved: saved_before,
        conflicts,
    }
}

/// Merges an incoming payload into a record in place.
///
/// A record that has never been saved merges against an empty snapshot; the
/// resulting snapshot is installed so the next payload diffs correctly.
pub fn merge_into_record(record: &mut Record, incoming: &FieldMap) -> MergeOutcome {
    let mut saved = record.saved().cloned().unwrap_or_default();
    let mut current = record.fields().clone();

    let outcome = merge(&mut saved, &mut current, incoming);

    *record.fields_mut() = current;
    record.advance_snapshot(saved);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_model::Value;

    fn map(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn partial_update_with_conflict() {
        // saved={done:false,name:'t2'}; local edit current.name='local change';
        // incoming={name:'remote change', done:true}
        let mut saved = map(&[("done", Value::from(false)), ("name", Value::from("t2"))]);
        let mut current = map(&[
            ("done", Value::from(false)),
            ("name", Value::from("local change")),
        ]);
        let incoming = map(&[
            ("name", Value::from("remote change")),
            ("done", Value::from(true)),
        ]);

        let outcome = merge(&mut saved, &mut current, &incoming);

        assert_eq!(outcome.kind, UpdateKind::Partial);
        assert_eq!(outcome.updated, map(&[("done", Value::from(true))]));
        assert_eq!(
            outcome.conflicts,
            map(&[("name", Value::from("remote change"))])
        );
        assert_eq!(
            outcome.saved,
            map(&[("done", Value::from(false)), ("name", Value::from("t2"))])
        );
        // Snapshot advanced to the true remote baseline.
        assert_eq!(
            saved,
            map(&[
                ("done", Value::from(true)),
                ("name", Value::from("remote change"))
            ])
        );
        // Local edit kept, remote-only change applied.
        assert_eq!(
            current,
            map(&[
                ("done", Value::from(true)),
                ("name", Value::from("local change"))
            ])
        );
    }

    #[test]
    fn full_update_without_local_edits() {
        let mut saved = map(&[("done", Value::from(false)), ("name", Value::from("t2"))]);
        let mut current = saved.clone();
        let incoming = map(&[
            ("done", Value::from(true)),
            ("name", Value::from("remote change")),
        ]);

        let outcome = merge(&mut saved, &mut current, &incoming);

        assert_eq!(outcome.kind, UpdateKind::Full);
        assert_eq!(outcome.updated, incoming);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(current, incoming);
        assert_eq!(saved, incoming);
    }

    #[test]
    fn subset_payload_is_partial() {
        let mut saved = map(&[("done", Value::from(false)), ("name", Value::from("t2"))]);
        let mut current = saved.clone();
        let incoming = map(&[("done", Value::from(true))]);

        let outcome = merge(&mut saved, &mut current, &incoming);
        assert_eq!(outcome.kind, UpdateKind::Partial);
        assert_eq!(outcome.updated, incoming);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn local_edit_matching_incoming_is_not_a_conflict() {
        let mut saved = map(&[("name", Value::from("t2"))]);
        let mut current = map(&[("name", Value::from("same change"))]);
        let incoming = map(&[("name", Value::from("same change"))]);

        let outcome = merge(&mut saved, &mut current, &incoming);

        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.updated, incoming);
        assert_eq!(saved, incoming);
        // A local edit was still touched, so this is not a full update.
        assert_eq!(outcome.kind, UpdateKind::Partial);
    }

    #[test]
    fn second_application_is_noop() {
        let mut saved = map(&[("done", Value::from(false))]);
        let mut current = saved.clone();
        let incoming = map(&[("done", Value::from(true))]);

        merge(&mut saved, &mut current, &incoming);
        let second = merge(&mut saved, &mut current, &incoming);

        assert!(second.updated.is_empty());
        assert!(second.conflicts.is_empty());
    }

    #[test]
    fn previous_and_saved_capture_pre_merge_state() {
        let mut saved = map(&[("n", Value::from(1i64))]);
        let mut current = map(&[("n", Value::from(2i64))]);
        let incoming = map(&[("n", Value::from(3i64))]);

        let outcome = merge(&mut saved, &mut current, &incoming);

        assert_eq!(outcome.previous, map(&[("n", Value::from(2i64))]));
        assert_eq!(outcome.saved, map(&[("n", Value::from(1i64))]));
        assert_eq!(current, map(&[("n", Value::from(2i64))]));
        assert_eq!(saved, map(&[("n", Value::from(3i64))]));
    }

    #[test]
    fn merge_into_record_installs_snapshot() {
        let mut record = Record::new("task");
        record.set("name", Value::from("local")).unwrap();

        let incoming = map(&[("done", Value::from(true))]);
        let outcome = merge_into_record(&mut record, &incoming);

        assert_eq!(outcome.updated, incoming);
        assert_eq!(record.saved().unwrap().get("done"), Some(&Value::from(true)));
        assert_eq!(record.get("name"), Some(&Value::from("local")));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn value_strategy() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::Integer),
                "[a-z]{0,8}".prop_map(Value::Text),
            ]
        }

        fn field_map_strategy() -> impl Strategy<Value = FieldMap> {
            proptest::collection::hash_map("[a-f]{1,4}", value_strategy(), 0..6)
        }

        proptest! {
            // Applying the same payload twice with no intervening local
            // edit yields an empty update on the second pass.
            #[test]
            fn merge_is_idempotent(
                mut saved in field_map_strategy(),
                mut current in field_map_strategy(),
                incoming in field_map_strategy(),
            ) {
                merge(&mut saved, &mut current, &incoming);
                let second = merge(&mut saved, &mut current, &incoming);
                prop_assert!(second.updated.is_empty());
                prop_assert!(second.conflicts.is_empty());
            }

            // The snapshot always advances to the incoming baseline for
            // every field the remote actually changed.
            #[test]
            fn snapshot_tracks_remote_baseline(
                mut saved in field_map_strategy(),
                mut current in field_map_strategy(),
                incoming in field_map_strategy(),
            ) {
                merge(&mut saved, &mut current, &incoming);
                for (field, value) in &incoming {
                    prop_assert_eq!(saved.get(field), Some(value));
                }
            }
        }
    }
}
