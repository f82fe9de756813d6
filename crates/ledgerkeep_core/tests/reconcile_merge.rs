mod common;

use common::{
    clock, count, history, open, CollectionMember, Lookup, MemberNote, Node, OwnedChild,
    TestAggregate,
};
use ledgerkeep_core::engine::dirty::is_changed_recursive;
use ledgerkeep_core::engine::reconcile;
use ledgerkeep_core::{
    AggregateService, ChangeTracker, ChangeType, EngineError, ErrorKind, LoadPlan, OwnedMany,
    OwnedRef, Related, RequestContext, Session,
};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn seed(conn: &rusqlite::Connection, aggregate: TestAggregate) -> TestAggregate {
    AggregateService::new(conn)
        .with_clock(clock())
        .create(&RequestContext::anonymous(), aggregate)
        .unwrap()
}

/// A rejected merge must leave nothing for the next commit to write.
fn assert_nothing_pending(
    conn: &rusqlite::Connection,
    session: &mut Session<'_>,
    audit_rows: i64,
) {
    assert!(!session.has_changes().unwrap());
    assert!(session.save_changes().unwrap().is_empty());
    assert_eq!(count(conn, "entity_changes"), audit_rows);
}

#[test]
fn identical_payload_is_a_no_op() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root")
            .with_child(OwnedChild::new("A"))
            .with_item(CollectionMember::new("one").with_note(MemberNote::new("n"))),
    );
    let audit_rows = count(&conn, "entity_changes");

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let report = session.merge(&handle, &stored).unwrap();

    assert!(!report.changed);
    assert!(report.inserted.is_empty());
    assert!(report.removed.is_empty());
    assert!(!session.has_changes().unwrap());

    let summary = session.save_changes().unwrap();
    assert!(summary.is_empty());
    assert_eq!(count(&conn, "entity_changes"), audit_rows);
    assert_eq!(session.aggregate(&handle).unwrap().meta.version, 1);
}

#[test]
fn collection_add_inserts_one_member() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));

    let mut incoming = stored.clone();
    incoming.items.push(CollectionMember::new("added"));

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let report = session.merge(&handle, &incoming).unwrap();
    assert!(report.changed);
    assert_eq!(report.inserted.len(), 1);
    assert_eq!(report.inserted[0].entity_type, "CollectionMember");

    let summary = session.save_changes().unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.updated, 1);

    let root = session.aggregate(&handle).unwrap();
    assert_eq!(root.meta.version, 2);
    assert_eq!(root.items.len(), 1);
    let member = root.item("added");
    assert!(!member.meta.id.is_nil());
    assert_eq!(member.meta.version, 1);

    let member_history = history(&conn, "CollectionMember", member.meta.id);
    assert_eq!(member_history.len(), 1);
    assert_eq!(member_history[0].change.change_type, ChangeType::Created);
    let prop = member_history[0].property("TestProp").unwrap();
    assert_eq!(prop.old_value, None);
    assert_eq!(prop.new_value, common::text("added"));
}

#[test]
fn collection_remove_deletes_member() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root").with_item(CollectionMember::new("added")),
    );
    let member_id = stored.item("added").meta.id;

    let mut incoming = stored.clone();
    incoming.items = OwnedMany::empty();

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let report = session.merge(&handle, &incoming).unwrap();
    assert!(report.changed);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].id, member_id);
    assert!(session.has_changes().unwrap());

    let summary = session.save_changes().unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(session.aggregate(&handle).unwrap().meta.version, 2);
    assert_eq!(common::stored_version(&conn, member_id), None);

    let member_history = history(&conn, "CollectionMember", member_id);
    assert_eq!(member_history.len(), 1);
    let deleted = &member_history[0];
    assert_eq!(deleted.change.change_type, ChangeType::Deleted);
    assert_eq!(deleted.change.entity_version, 1);
    let prop = deleted.property("TestProp").unwrap();
    assert_eq!(prop.old_value, common::text("added"));
    assert_eq!(prop.new_value, None);
}

#[test]
fn two_new_members_bump_root_once() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));

    let mut incoming = stored.clone();
    incoming.items.push(CollectionMember::new("first"));
    incoming.items.push(CollectionMember::new("second"));

    let outcome = AggregateService::new(&conn)
        .with_clock(clock())
        .update(&RequestContext::anonymous(), &incoming)
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.aggregate.meta.version, 2);
    assert_eq!(outcome.aggregate.items.len(), 2);
    assert_eq!(outcome.summary.inserted, 2);
    assert_eq!(common::stored_version(&conn, stored.meta.id), Some(2));
}

#[test]
fn matched_member_is_merged_in_place() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root")
            .with_item(CollectionMember::new("keep"))
            .with_item(CollectionMember::new("edit")),
    );
    let edit_id = stored.item("edit").meta.id;
    let keep_id = stored.item("keep").meta.id;

    let mut incoming = stored.clone();
    for item in incoming.items.items_mut() {
        if item.meta.id == edit_id {
            item.test_prop = "edited".to_string();
        }
    }

    let outcome = AggregateService::new(&conn)
        .with_clock(clock())
        .update(&RequestContext::anonymous(), &incoming)
        .unwrap();

    let edited = outcome.aggregate.item("edited");
    assert_eq!(edited.meta.id, edit_id);
    assert_eq!(edited.meta.version, 2);
    assert_eq!(outcome.aggregate.item("keep").meta.version, 1);
    assert_eq!(common::stored_version(&conn, keep_id), Some(1));
    assert_eq!(outcome.summary.inserted, 0);
    assert_eq!(outcome.summary.deleted, 0);
}

#[test]
fn unmatched_member_with_client_key_is_inserted_under_that_key() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));
    let client_id = Uuid::new_v4();

    let mut incoming = stored.clone();
    incoming
        .items
        .push(CollectionMember::new("client").with_id(client_id));

    let outcome = AggregateService::new(&conn)
        .with_clock(clock())
        .update(&RequestContext::anonymous(), &incoming)
        .unwrap();

    assert_eq!(outcome.aggregate.item("client").meta.id, client_id);
    assert_eq!(common::stored_version(&conn, client_id), Some(1));
}

#[test]
fn duplicate_member_keys_are_an_invariant_violation() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));
    let id = Uuid::new_v4();

    let mut incoming = stored.clone();
    incoming.items.push(CollectionMember::new("a").with_id(id));
    incoming.items.push(CollectionMember::new("b").with_id(id));

    let audit_rows = count(&conn, "entity_changes");
    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);

    assert!(session.aggregate(&handle).unwrap().items.is_empty());
    assert_nothing_pending(&conn, &mut session, audit_rows);
    assert_eq!(count(&conn, "entities"), 1);
}

#[test]
fn root_key_mismatch_is_an_invariant_violation() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));

    let mut incoming = stored.clone();
    incoming.meta.id = Uuid::new_v4();

    incoming.test_prop = "renamed".to_string();

    let audit_rows = count(&conn, "entity_changes");
    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert!(matches!(err, EngineError::Invariant(_)));

    assert_eq!(session.aggregate(&handle).unwrap().test_prop, "root");
    assert_nothing_pending(&conn, &mut session, audit_rows);
}

#[test]
fn reference_with_same_or_unset_key_is_merged_in_place() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root").with_child(OwnedChild::new("A")));
    let child_id = stored.child().meta.id;

    let mut incoming = stored.clone();
    incoming.child = OwnedRef::new(OwnedChild::new("B"));

    let outcome = AggregateService::new(&conn)
        .with_clock(clock())
        .update(&RequestContext::anonymous(), &incoming)
        .unwrap();

    assert_eq!(outcome.aggregate.child().meta.id, child_id);
    assert_eq!(outcome.aggregate.child().owned_test_prop, "B");
    assert_eq!(outcome.summary.deleted, 0);
    assert_eq!(outcome.summary.inserted, 0);
}

#[test]
fn reference_with_different_key_is_replaced_wholesale() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root").with_child(OwnedChild::new("A")));
    let old_child_id = stored.child().meta.id;
    let new_child_id = Uuid::new_v4();

    let mut incoming = stored.clone();
    incoming.child = OwnedRef::new(OwnedChild::new("Z").with_id(new_child_id));

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let report = session.merge(&handle, &incoming).unwrap();
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].id, old_child_id);
    assert_eq!(report.inserted.len(), 1);
    assert_eq!(report.inserted[0].id, new_child_id);

    let summary = session.save_changes().unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(common::stored_version(&conn, old_child_id), None);
    assert_eq!(common::stored_version(&conn, new_child_id), Some(1));
    assert_eq!(session.aggregate(&handle).unwrap().meta.version, 2);
}

#[test]
fn omitted_navigation_leaves_tracked_edge_untouched() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root")
            .with_child(OwnedChild::new("A"))
            .with_item(CollectionMember::new("one")),
    );

    let mut incoming = stored.clone();
    incoming.test_prop = "renamed".to_string();
    incoming.child = OwnedRef::not_loaded();
    incoming.items = OwnedMany::not_loaded();

    let outcome = AggregateService::new(&conn)
        .with_clock(clock())
        .update(&RequestContext::anonymous(), &incoming)
        .unwrap();

    assert_eq!(outcome.aggregate.test_prop, "renamed");
    assert_eq!(outcome.aggregate.child().owned_test_prop, "A");
    assert_eq!(outcome.aggregate.items.len(), 1);
    assert_eq!(outcome.summary.deleted, 0);
}

#[test]
fn unloaded_tracked_navigation_is_a_configuration_error() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root").with_child(OwnedChild::new("A")));

    let audit_rows = count(&conn, "entity_changes");
    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session
        .load_with::<TestAggregate>(stored.meta.id, &LoadPlan::root_only())
        .unwrap();
    let err = session.merge(&handle, &stored).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    match err {
        EngineError::NavigationNotLoaded {
            entity_type,
            navigation,
            ..
        } => {
            assert_eq!(entity_type, "TestAggregate");
            assert_eq!(navigation, "Child");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_nothing_pending(&conn, &mut session, audit_rows);
}

#[test]
fn failed_merge_keeps_scalar_changes_out_of_the_session() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root")
            .with_child(OwnedChild::new("A"))
            .with_item(CollectionMember::new("one")),
    );

    let mut incoming = stored.clone();
    incoming.test_prop = "partial".to_string();
    incoming.items = OwnedMany::empty();

    let audit_rows = count(&conn, "entity_changes");
    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session
        .load_with::<TestAggregate>(stored.meta.id, &LoadPlan::paths(["Child"]))
        .unwrap();
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    assert_eq!(session.aggregate(&handle).unwrap().test_prop, "root");
    assert_nothing_pending(&conn, &mut session, audit_rows);
    assert_eq!(common::stored_version(&conn, stored.meta.id), Some(1));
}

#[test]
fn failed_merge_keeps_removed_members_tracked() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root")
            .with_item(CollectionMember::new("one").with_note(MemberNote::new("n1"))),
    );
    let member_id = stored.item("one").meta.id;
    let note_id = stored.item("one").notes.items()[0].meta.id;

    // A fresh member whose note reuses the tracked note's key.
    let mut reused = MemberNote::new("copy");
    reused.meta.id = note_id;
    let mut incoming = stored.clone();
    incoming.items = OwnedMany::empty();
    incoming
        .items
        .push(CollectionMember::new("fresh").with_note(reused));

    let audit_rows = count(&conn, "entity_changes");
    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);

    let root = session.aggregate(&handle).unwrap();
    assert_eq!(root.items.len(), 1);
    assert_eq!(root.item("one").meta.id, member_id);
    assert_nothing_pending(&conn, &mut session, audit_rows);
    assert_eq!(common::stored_version(&conn, member_id), Some(1));
    assert_eq!(history(&conn, "CollectionMember", member_id).len(), 1);
}

#[test]
fn new_member_reusing_an_id_of_another_type_is_an_invariant_violation() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root").with_child(OwnedChild::new("A")));
    let child_id = stored.child().meta.id;

    let mut incoming = stored.clone();
    incoming
        .items
        .push(CollectionMember::new("clash").with_id(child_id));

    let audit_rows = count(&conn, "entity_changes");
    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);
    assert!(err.to_string().contains("reuses the id"), "{err}");

    assert!(session.aggregate(&handle).unwrap().items.is_empty());
    assert_nothing_pending(&conn, &mut session, audit_rows);
}

#[test]
fn two_new_members_sharing_an_id_across_navigations_are_rejected() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));
    let shared = Uuid::new_v4();

    let mut incoming = stored.clone();
    incoming.child = OwnedRef::new(OwnedChild::new("A").with_id(shared));
    incoming
        .items
        .push(CollectionMember::new("clash").with_id(shared));

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);
    assert!(session.aggregate(&handle).unwrap().child.get().is_none());
    assert!(!session.has_changes().unwrap());
}

#[test]
fn merge_rejects_ids_live_in_another_aggregate() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));
    let shared = Uuid::new_v4();

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    session
        .add(TestAggregate::new("other").with_child(OwnedChild::new("A").with_id(shared)))
        .unwrap();
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();

    let mut incoming = stored.clone();
    incoming
        .items
        .push(CollectionMember::new("clash").with_id(shared));
    let err = session.merge(&handle, &incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invariant);
    assert!(session.aggregate(&handle).unwrap().items.is_empty());

    let summary = session.save_changes().unwrap();
    assert_eq!(summary.inserted, 2);
}

#[test]
fn partial_plan_loads_only_named_paths() {
    let conn = open();
    let stored = seed(
        &conn,
        TestAggregate::new("root")
            .with_child(OwnedChild::new("A"))
            .with_item(CollectionMember::new("one").with_note(MemberNote::new("n"))),
    );

    let mut session = Session::new(&conn, RequestContext::anonymous());
    let handle = session
        .load_with::<TestAggregate>(stored.meta.id, &LoadPlan::paths(["Items"]))
        .unwrap();
    let root = session.aggregate(&handle).unwrap();

    assert!(!root.child.is_loaded());
    assert!(root.items.is_loaded());
    assert!(!root.items.items()[0].notes.is_loaded());
}

#[test]
fn non_owned_navigation_is_ignored() {
    let conn = open();
    let stored = seed(&conn, TestAggregate::new("root"));
    let audit_rows = count(&conn, "entity_changes");

    let mut incoming = stored.clone();
    incoming.lookup = Related::new(Lookup {
        id: Uuid::new_v4(),
        name: "display only".to_string(),
    });

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(clock());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    let report = session.merge(&handle, &incoming).unwrap();

    assert!(!report.changed);
    assert!(session.aggregate(&handle).unwrap().lookup.get().is_none());
    assert!(session.save_changes().unwrap().is_empty());
    assert_eq!(count(&conn, "entity_changes"), audit_rows);
}

#[test]
fn cyclic_key_graph_terminates() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let mut tracked = Node::new(a, "a").then(Node::new(b, "b").then(Node::new(a, "a-inner")));

    let mut tracker = ChangeTracker::new();
    tracker.track_loaded(&tracked).unwrap();

    let unchanged = tracked.clone();
    let mut visited = HashSet::new();
    let report = reconcile::merge(&mut tracker, &mut tracked, &unchanged, &mut visited).unwrap();
    assert!(!report.changed);
    assert!(!is_changed_recursive(&tracker, &tracked, &mut HashSet::new()).unwrap());

    let incoming =
        Node::new(a, "a").then(Node::new(b, "b2").then(Node::new(a, "inner-changed")));
    let mut visited = HashSet::new();
    let report = reconcile::merge(&mut tracker, &mut tracked, &incoming, &mut visited).unwrap();
    assert!(report.changed);
    assert_eq!(visited.len(), 2);

    let second = tracked.next.get().unwrap();
    assert_eq!(second.label, "b2");
    // The repeated key is skipped, so the inner copy keeps its value.
    assert_eq!(second.next.get().unwrap().label, "a-inner");

    assert!(is_changed_recursive(&tracker, &tracked, &mut HashSet::new()).unwrap());
}

#[test]
fn session_merge_accepts_shared_clock() {
    let conn = open();
    let shared = Arc::new(ledgerkeep_core::FixedClock::at(common::T0 + 5));
    let stored = seed(&conn, TestAggregate::new("root"));

    let mut incoming = stored.clone();
    incoming.test_prop = "clocked".to_string();

    let mut session = Session::new(&conn, RequestContext::anonymous()).with_clock(shared.clone());
    let handle = session.load::<TestAggregate>(stored.meta.id).unwrap();
    session.merge(&handle, &incoming).unwrap();
    let summary = session.save_changes().unwrap();

    assert_eq!(summary.timestamp_ms, Some(common::T0 + 5));
    let entries = history(&conn, "TestAggregate", stored.meta.id);
    assert_eq!(entries.last().unwrap().change.timestamp_ms, common::T0 + 5);
}
