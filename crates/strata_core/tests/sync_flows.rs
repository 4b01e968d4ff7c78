//! End-to-end tier flows: cascades, offline deferral, pending tier calls,
//! and removal status handling.

use strata_core::{CacheMode, Cascade, Replica, TierResult, TransactionResult};
use strata_model::Value;
use strata_testkit::prelude::*;

#[test]
fn full_cascade_reaches_every_tier() {
    let rig = TestReplica::with_task_list();

    let (key, txn) = rig
        .create("task", fields(&[("name", Value::from("t0"))]))
        .unwrap();

    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(rig.store.contains(&key));
    assert!(rig.remote.contains(&key));
    assert_eq!(rig.channel.take_published().len(), 1);

    let record = rig.get("task", &key).unwrap();
    assert!(record.is_saved());
    assert!(!record.has_local_edits());
}

#[test]
fn offline_mutations_flush_in_original_order() {
    let rig = TestReplica::with_task_list();
    rig.set_online(false);

    let (first, first_txn) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    let (second, _) = rig
        .create("task", fields(&[("name", Value::from("b"))]))
        .unwrap();

    // Local tier succeeded; remote work is waiting.
    assert_eq!(first_txn.result(), Some(TransactionResult::LocalSuccess));
    assert_eq!(rig.deferred_len(), 2);
    assert!(rig.store.contains(&first));
    assert!(rig.remote.is_empty());

    rig.set_online(true);
    assert_eq!(rig.deferred_len(), 0);
    assert!(rig.remote.contains(&first));
    assert!(rig.remote.contains(&second));

    let published = rig.channel.take_published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].key, first);
    assert_eq!(published[1].key, second);
}

#[test]
fn offline_remove_keeps_the_record_until_reconnect() {
    let rig = TestReplica::new();
    rig.register_model(task_schema().with_remove_cascade(Cascade::REMOTE))
        .unwrap();
    rig.register_model(list_schema()).unwrap();

    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    rig.set_online(false);

    let txn = rig.remove("task", &key).unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::Offline));
    // The remote must confirm a removal under this policy, so nothing
    // happened yet.
    assert!(!rig.get("task", &key).unwrap().is_deleted());
    assert!(rig.store.contains(&key));
    assert!(rig.remote.contains(&key));
    assert_eq!(rig.deferred_len(), 1);

    rig.set_online(true);
    assert_eq!(rig.deferred_len(), 0);
    assert!(rig.get("task", &key).unwrap().is_deleted());
    assert!(!rig.remote.contains(&key));
}

#[test]
fn offline_remove_replays_after_the_pending_save() {
    let rig = TestReplica::with_task_list();
    rig.set_online(false);

    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    assert_eq!(rig.deferred_len(), 1);

    let txn = rig.remove("task", &key).unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::Offline));
    // The save and the removal both wait, in order.
    assert_eq!(rig.deferred_len(), 2);
    assert!(!rig.get("task", &key).unwrap().is_deleted());
    assert!(rig.store.contains(&key));

    rig.set_online(true);
    assert!(rig.get("task", &key).unwrap().is_deleted());
    assert!(!rig.store.contains(&key));
    assert!(rig.remote.is_empty());
}

#[test]
fn pending_tier_calls_complete_through_tickets() {
    let rig = TestReplica::with_task_list();
    rig.remote.set_defer(true);

    let (key, txn) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    assert!(txn.result().is_none());
    // Nothing published until the remote acknowledges.
    assert_eq!(rig.channel.take_published().len(), 0);

    rig.flush_remote();

    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(rig.remote.contains(&key));
    assert_eq!(rig.channel.take_published().len(), 1);
}

#[test]
fn removal_during_in_flight_save_is_final() {
    let rig = TestReplica::with_task_list();
    rig.remote.set_defer(true);

    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    rig.remove("task", &key).unwrap();

    rig.flush_remote();

    assert!(rig.get("task", &key).unwrap().is_deleted());
    assert!(!rig.store.contains(&key));
}

#[test]
fn uncached_model_goes_straight_to_the_remote() {
    let rig = TestReplica::new();
    rig.register_model(task_schema().with_cache(CacheMode::None))
        .unwrap();
    rig.register_model(list_schema()).unwrap();

    let (key, txn) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(!rig.store.contains(&key));
    assert!(rig.remote.contains(&key));

    let txn = rig.remove("task", &key).unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(rig.remote.is_empty());
}

#[test]
fn unusable_store_never_blocks_remote_sync() {
    let rig = TestReplica::with_task_list();
    rig.store.set_usable(false);

    let (key, txn) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(!rig.store.contains(&key));
    assert!(rig.remote.contains(&key));

    let txn = rig.remove("task", &key).unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(rig.get("task", &key).unwrap().is_deleted());
}

#[test]
fn gone_on_remove_counts_as_confirmation() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();

    rig.remote.force_result(Some(TierResult::Gone));
    let txn = rig.remove("task", &key).unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::RemoteSuccess));
    assert!(rig.get("task", &key).unwrap().is_deleted());
}

#[test]
fn unexpected_remove_status_keeps_the_cache_entry() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();

    rig.remote
        .force_result(Some(TierResult::Unexpected("500".to_string())));
    let txn = rig.remove("task", &key).unwrap();
    assert_eq!(txn.result(), Some(TransactionResult::Failure));
    assert!(rig.get("task", &key).unwrap().is_deleted());
    // The local tier only removes after the remote confirms; the cached
    // copy survives the rejection.
    assert!(rig.store.contains(&key));
    assert!(rig.remote.contains(&key));
}

#[test]
fn transient_remove_failure_retries_on_reconnect() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();

    rig.remote
        .force_result(Some(TierResult::Transient("timeout".to_string())));
    rig.remove("task", &key).unwrap();
    assert_eq!(rig.deferred_len(), 1);
    assert!(rig.remote.contains(&key));
    assert!(rig.store.contains(&key));

    rig.remote.force_result(None);
    rig.set_online(false);
    rig.set_online(true);

    assert_eq!(rig.deferred_len(), 0);
    assert!(!rig.remote.contains(&key));
    assert!(!rig.store.contains(&key));
}

#[test]
fn gone_on_save_removes_the_record() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();

    rig.set_field("task", &key, "name", Value::from("edited"))
        .unwrap();
    rig.remote.force_result(Some(TierResult::Gone));
    let txn = rig.save("task", &key).unwrap();

    assert_eq!(txn.result(), Some(TransactionResult::LocalSuccess));
    assert!(rig.get("task", &key).unwrap().is_deleted());
}

#[test]
fn load_cached_restores_from_the_local_tier() {
    let rig = TestReplica::with_task_list();
    let (key, _) = rig
        .create("task", fields(&[("name", Value::from("a"))]))
        .unwrap();

    // A second replica over the same store models a restart.
    let restarted = Replica::new(rig.store.clone(), rig.remote.clone(), rig.channel.clone());
    restarted.register_model(list_schema()).unwrap();
    restarted.register_model(task_schema()).unwrap();

    assert!(restarted.load_cached("task", &key).unwrap());
    let record = restarted.get("task", &key).unwrap();
    assert!(record.is_saved_locally());
    assert_eq!(record.get("name"), Some(&Value::from("a")));
}
