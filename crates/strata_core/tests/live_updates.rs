//! Inbound data paths: live channel messages, conflict merging, the event
//! feed, and remote refresh.

use strata_core::{LiveMessage, RecordEventKind, TierResult, UpdateKind};
use strata_model::{RecordKey, Value};
use strata_testkit::prelude::*;

#[test]
fn inbound_save_creates_and_caches_the_record() {
    let rig = TestReplica::with_task_list();
    let key = RecordKey::scalar("T9");

    rig.receive_live(LiveMessage::save(
        "task",
        key.clone(),
        fields(&[("id", Value::from("T9")), ("name", Value::from("remote"))]),
    ))
    .unwrap();

    let record = rig.get("task", &key).unwrap();
    assert!(record.is_saved());
    assert_eq!(record.get("name"), Some(&Value::from("remote")));
    assert!(rig.store.contains(&key));
    // Silent write-through: nothing rebroadcast.
    assert_eq!(rig.channel.published_len(), 0);

    let kinds: Vec<_> = rig
        .events()
        .poll(0, 100)
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert!(kinds.contains(&RecordEventKind::RemoteUpdate));
    assert!(kinds.contains(&RecordEventKind::FullUpdate));
}

#[test]
fn inbound_merge_keeps_local_edits_and_reports_conflicts() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create(
            "task",
            fields(&[("name", Value::from("t2")), ("done", Value::from(false))]),
        )
        .unwrap();
    rig.set_field("task", &key, "name", Value::from("local change"))
        .unwrap();

    let receiver = rig.events().subscribe();
    rig.receive_live(LiveMessage::save(
        "task",
        key.clone(),
        fields(&[
            ("name", Value::from("remote change")),
            ("done", Value::from(true)),
        ]),
    ))
    .unwrap();

    let record = rig.get("task", &key).unwrap();
    // The local edit wins in the live values; the remote-only change lands.
    assert_eq!(record.get("name"), Some(&Value::from("local change")));
    assert_eq!(record.get("done"), Some(&Value::from(true)));
    // The snapshot advances to the remote baseline.
    let saved = record.saved().unwrap();
    assert_eq!(saved.get("name"), Some(&Value::from("remote change")));
    assert_eq!(saved.get("done"), Some(&Value::from(true)));

    let partial = receiver
        .try_iter()
        .find(|event| event.kind == RecordEventKind::PartialUpdate)
        .unwrap();
    let merge = partial.merge.unwrap();
    assert_eq!(merge.kind, UpdateKind::Partial);
    assert_eq!(
        merge.conflicts.get("name"),
        Some(&Value::from("remote change"))
    );
    assert_eq!(merge.updated.get("done"), Some(&Value::from(true)));
}

#[test]
fn repeated_inbound_payload_is_a_noop() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create(
            "task",
            fields(&[("name", Value::from("t2")), ("done", Value::from(false))]),
        )
        .unwrap();
    rig.set_field("task", &key, "name", Value::from("local change"))
        .unwrap();

    let payload = fields(&[
        ("name", Value::from("remote change")),
        ("done", Value::from(true)),
    ]);
    rig.receive_live(LiveMessage::save("task", key.clone(), payload.clone()))
        .unwrap();

    let receiver = rig.events().subscribe();
    rig.receive_live(LiveMessage::save("task", key.clone(), payload))
        .unwrap();

    let second = receiver
        .try_iter()
        .find(|event| event.kind == RecordEventKind::PartialUpdate)
        .unwrap();
    assert!(second.merge.unwrap().is_noop());

    let record = rig.get("task", &key).unwrap();
    assert_eq!(record.get("name"), Some(&Value::from("local change")));
    assert_eq!(record.get("done"), Some(&Value::from(true)));
}

#[test]
fn complete_inbound_state_is_a_full_update() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create(
            "task",
            fields(&[("name", Value::from("t2")), ("done", Value::from(false))]),
        )
        .unwrap();
    let id = rig.get("task", &key).unwrap().get("id").cloned().unwrap();

    let receiver = rig.events().subscribe();
    rig.receive_live(LiveMessage::save(
        "task",
        key.clone(),
        fields(&[
            ("id", id),
            ("name", Value::from("renamed")),
            ("done", Value::from(true)),
        ]),
    ))
    .unwrap();

    assert!(receiver
        .try_iter()
        .any(|event| event.kind == RecordEventKind::FullUpdate));
    let record = rig.get("task", &key).unwrap();
    assert_eq!(record.get("name"), Some(&Value::from("renamed")));
    assert!(!record.has_local_edits());
}

#[test]
fn inbound_remove_cascades_locally_without_touching_the_remote() {
    let rig = TestReplica::with_task_list();
    let (list_key, _) = rig
        .create("list", fields(&[("title", Value::from("inbox"))]))
        .unwrap();
    let list_id = list_key.components()[0].clone();
    let (task_key, _) = rig
        .create(
            "task",
            fields(&[("name", Value::from("a")), ("list_id", list_id)]),
        )
        .unwrap();

    rig.receive_live(LiveMessage::remove("list", list_key.clone()))
        .unwrap();

    assert!(rig.get("list", &list_key).unwrap().is_deleted());
    assert!(rig.get("task", &task_key).unwrap().is_deleted());
    assert!(!rig.store.contains(&list_key));
    assert!(!rig.store.contains(&task_key));
    // The removal originated remotely; the remote is not called back.
    assert!(rig.remote.contains(&list_key));
    assert!(rig.remote.contains(&task_key));
}

#[test]
fn inbound_save_for_a_removed_record_is_ignored() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    rig.remove("task", &key).unwrap();

    rig.receive_live(LiveMessage::save(
        "task",
        key.clone(),
        fields(&[("name", Value::from("resurrected"))]),
    ))
    .unwrap();

    assert!(rig.get("task", &key).unwrap().is_deleted());
    assert!(!rig.store.contains(&key));
}

#[test]
fn refresh_merges_remote_records() {
    let rig = TestReplica::with_task_list();
    rig.remote.seed(
        &RecordKey::scalar("A"),
        fields(&[("id", Value::from("A")), ("name", Value::from("one"))]),
    );
    rig.remote.seed(
        &RecordKey::scalar("B"),
        fields(&[("id", Value::from("B")), ("name", Value::from("two"))]),
    );

    let (result, applied) = rig.refresh("task", &fields(&[])).unwrap();
    assert!(result.is_success());
    assert_eq!(applied, 2);

    let record = rig.get("task", &RecordKey::scalar("A")).unwrap();
    assert_eq!(record.get("name"), Some(&Value::from("one")));
    assert!(record.is_saved());
    assert!(rig.store.contains(&RecordKey::scalar("A")));
}

#[test]
fn refresh_propagates_query_failures() {
    let rig = TestReplica::with_task_list();
    rig.remote
        .force_result(Some(TierResult::Transient("offline".to_string())));

    let (result, applied) = rig.refresh("task", &fields(&[])).unwrap();
    assert_eq!(result, TierResult::Transient("offline".to_string()));
    assert_eq!(applied, 0);
}

#[test]
fn events_follow_application_order() {
    let rig = TestReplica::with_task_list();
    let receiver = rig.events().subscribe();

    rig.create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();

    let kinds: Vec<_> = receiver.try_iter().map(|event| event.kind).collect();
    let local = kinds
        .iter()
        .position(|kind| *kind == RecordEventKind::SavedLocally)
        .unwrap();
    let remote = kinds
        .iter()
        .position(|kind| *kind == RecordEventKind::SavedRemotely)
        .unwrap();
    assert!(local < remote);
}
