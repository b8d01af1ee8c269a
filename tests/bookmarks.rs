//! Integration tests for bookmark creation, resumption and scoping

mod common;

use common::*;
use corewf::runtime::{
    Activity, ActivityExecutor, Bookmark, BookmarkResumptionResult, BookmarkScope, RunOutcome,
    Value, WorkItemPriority, WorkflowDefinition, WorkflowInstanceId, WorkflowState,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn executor(root: Activity, journal: &Arc<Journal>) -> ActivityExecutor {
    let definition = WorkflowDefinition::prepare(root);
    ActivityExecutor::new(WorkflowInstanceId::new(), definition, BTreeMap::new())
        .unwrap()
        .with_extensions(extensions(journal))
}

#[test]
fn test_workflow_idles_on_bookmark_and_resumes() {
    let journal = Journal::new();
    let root = sequence("main", vec![record("before"), wait("approve"), record("after")]);
    let mut executor = executor(root, &journal);

    assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));
    assert_eq!(executor.state(), WorkflowState::Idle);
    assert_eq!(journal.entries(), vec!["before"]);

    let pending = executor.bookmarks();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].bookmark, Bookmark::new("approve"));
    assert_eq!(pending[0].owner_name, "approve");

    let result = executor.resume_bookmark(&Bookmark::new("approve"), Value::symbol("ok"));
    assert_eq!(result, BookmarkResumptionResult::Success);
    assert_eq!(executor.state(), WorkflowState::Runnable);

    assert!(matches!(executor.run().unwrap(), RunOutcome::Completed { .. }));
    assert_eq!(journal.entries(), vec!["before", "resumed:approve", "after"]);
}

#[test]
fn test_resuming_unknown_bookmark_reports_not_found() {
    let journal = Journal::new();
    let mut executor = executor(wait("approve"), &journal);
    executor.run().unwrap();

    let result = executor.resume_bookmark(&Bookmark::new("reject"), Value::symbol("no"));
    assert_eq!(result, BookmarkResumptionResult::NotFound);
    assert_eq!(executor.state(), WorkflowState::Idle);
}

#[test]
fn test_completed_workflow_reports_not_found() {
    let journal = Journal::new();
    let mut executor = executor(wait("approve"), &journal);
    executor.run().unwrap();
    executor.resume_bookmark(&Bookmark::new("approve"), Value::symbol("yes"));
    assert!(matches!(executor.run().unwrap(), RunOutcome::Completed { .. }));

    for name in ["approve", "never-created"] {
        assert_eq!(
            executor.resume_bookmark(&Bookmark::new(name), Value::symbol("late")),
            BookmarkResumptionResult::NotFound
        );
    }
    assert_eq!(executor.state(), WorkflowState::Closed);
}

#[test]
fn test_one_shot_bookmark_resumes_once() {
    let journal = Journal::new();
    let mut executor = executor(wait("approve"), &journal);
    executor.run().unwrap();

    let bookmark = Bookmark::new("approve");
    assert_eq!(
        executor.resume_bookmark(&bookmark, Value::symbol("first")),
        BookmarkResumptionResult::Success
    );
    assert_eq!(
        executor.resume_bookmark(&bookmark, Value::symbol("second")),
        BookmarkResumptionResult::NotFound
    );

    match executor.run().unwrap() {
        RunOutcome::Completed { result, .. } => assert_eq!(result, Some(Value::symbol("first"))),
        other => panic!("expected completion, got {:?}", other),
    }
}

#[test]
fn test_duplicate_bookmark_name_faults_second_owner() {
    let journal = Journal::new();
    let root = parallel("both", vec![wait("dup"), wait("dup")]);
    let mut executor = executor(root, &journal);

    match executor.run().unwrap() {
        RunOutcome::Faulted(fault) => {
            assert!(fault.message().contains("already exists"));
            assert_eq!(fault.source_name(), "dup");
        }
        other => panic!("expected fault, got {:?}", other),
    }
    assert!(executor.bookmarks().is_empty());
}

#[test]
fn test_multiple_resume_bookmark_stays_registered() {
    let journal = Journal::new();
    let mut executor = executor(listen("events", 3), &journal);
    executor.run().unwrap();

    let bookmark = Bookmark::new("events");
    for n in 1..=2i64 {
        assert_eq!(
            executor.resume_bookmark(&bookmark, Value::new(n)),
            BookmarkResumptionResult::Success
        );
        assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));
        assert_eq!(executor.bookmarks().len(), 1);
    }

    executor.resume_bookmark(&bookmark, Value::new(3i64));
    match executor.run().unwrap() {
        RunOutcome::Completed { result, .. } => assert_eq!(result, Some(Value::new(3i64))),
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(journal.entries(), vec!["heard:1", "heard:2", "heard:3"]);
    assert_eq!(
        executor.resume_bookmark(&bookmark, Value::new(4i64)),
        BookmarkResumptionResult::NotFound
    );
}

#[test]
fn test_multiple_resume_values_queue_in_order() {
    let journal = Journal::new();
    let mut executor = executor(listen("events", 5), &journal);
    executor.run().unwrap();

    let bookmark = Bookmark::new("events");
    for n in 1..=3i64 {
        executor.resume_bookmark(&bookmark, Value::new(n));
    }
    assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));
    assert_eq!(journal.entries(), vec!["heard:1", "heard:2", "heard:3"]);
}

#[test]
fn test_non_blocking_bookmark_does_not_hold_owner() {
    let journal = Journal::new();
    let mut executor = executor(Activity::native("approval", Approval), &journal);
    executor.run().unwrap();
    assert_eq!(executor.bookmarks().len(), 2);

    // Status pings do not complete the owner
    executor.resume_bookmark(&Bookmark::new("status"), Value::symbol("ping"));
    assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));
    assert_eq!(executor.bookmarks().len(), 2);

    executor.resume_bookmark(&Bookmark::new("approve"), Value::symbol("yes"));
    match executor.run().unwrap() {
        RunOutcome::Completed { result, .. } => assert_eq!(result, Some(Value::symbol("yes"))),
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(journal.entries(), vec!["status", "approve"]);
    assert!(executor.bookmarks().is_empty());
}

#[test]
fn test_scoped_bookmarks_do_not_collide() {
    let journal = Journal::new();
    let root = parallel(
        "reviews",
        vec![
            Activity::native("first", Scoped).with_child(wait("approve")),
            Activity::native("second", Scoped).with_child(wait("approve")),
        ],
    );
    let mut executor = executor(root, &journal);

    assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));
    let pending = executor.bookmarks();
    assert_eq!(pending.len(), 2);
    assert!(pending
        .iter()
        .all(|info| matches!(info.bookmark.scope, BookmarkScope::Named(_))));
    assert_ne!(pending[0].bookmark.scope, pending[1].bookmark.scope);

    // The default scope has no bookmark of that name
    assert_eq!(
        executor.resume_bookmark(&Bookmark::new("approve"), Value::symbol("x")),
        BookmarkResumptionResult::NotFound
    );

    for info in pending {
        assert_eq!(
            executor.resume_bookmark(&info.bookmark, Value::symbol("ok")),
            BookmarkResumptionResult::Success
        );
    }
    assert!(matches!(executor.run().unwrap(), RunOutcome::Completed { .. }));
    assert_eq!(journal.entries(), vec!["resumed:approve", "resumed:approve"]);
}

#[test]
fn test_low_priority_resumption_runs_after_normal_work() {
    let journal = Journal::new();
    let root = parallel("pair", vec![wait("slow"), wait("fast")]);
    let mut executor = executor(root, &journal);
    executor.run().unwrap();

    executor.resume_bookmark_with_priority(
        &Bookmark::new("slow"),
        Value::symbol("s"),
        WorkItemPriority::Low,
    );
    executor.resume_bookmark(&Bookmark::new("fast"), Value::symbol("f"));

    assert!(matches!(executor.run().unwrap(), RunOutcome::Completed { .. }));
    assert_eq!(journal.entries(), vec!["resumed:fast", "resumed:slow"]);
}

#[test]
fn test_bookmarks_listed_in_scope_and_name_order() {
    let journal = Journal::new();
    let root = parallel("many", vec![wait("zeta"), wait("alpha"), wait("mid")]);
    let mut executor = executor(root, &journal);
    executor.run().unwrap();

    let names: Vec<String> = executor
        .bookmarks()
        .into_iter()
        .map(|info| info.bookmark.name)
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}
