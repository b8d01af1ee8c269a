//! Integration tests for the workflow host

mod common;

use common::*;
use corewf::runtime::store::create_owner;
use corewf::runtime::{
    Activity, Bookmark, CallbackTag, CodeActivity, CodeActivityContext, EngineConfig, Extensions,
    HostError, InstanceStore, MemoryInstanceStore, NativeActivity, NativeActivityContext,
    PersistableIdleAction, RecordingParticipant, RunOutcome, TrackingEvent, TrackingProvider,
    Value, WorkflowApplication, WorkflowDefinition, WorkflowState, WorkflowTrackingState,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(1);

fn app(root: Activity, journal: &Arc<Journal>) -> WorkflowApplication {
    WorkflowApplication::new(WorkflowDefinition::prepare(root), BTreeMap::new())
        .unwrap()
        .with_extensions(extensions(journal))
}

#[test]
fn test_completion_callback_fires_once() {
    let journal = Journal::new();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let app = app(record("only"), &journal).on_completed(move |_, _| *counter.lock() += 1);

    assert!(app.run().unwrap().is_completed());
    assert!(app.run().unwrap().is_completed());
    assert_eq!(*calls.lock(), 1);
    assert_eq!(app.state(), Some(WorkflowState::Closed));
}

#[test]
fn test_unhandled_exception_reported_before_completion() {
    let journal = Journal::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let on_fault = Arc::clone(&order);
    let on_done = Arc::clone(&order);
    let app = app(sequence("main", vec![throw("unhandled")]), &journal)
        .on_unhandled_exception(move |_, fault| {
            on_fault.lock().push(format!("fault:{}", fault.message()))
        })
        .on_completed(move |_, _| on_done.lock().push("completed".to_string()));

    assert!(matches!(app.run().unwrap(), RunOutcome::Faulted(_)));
    assert_eq!(*order.lock(), vec!["fault:unhandled", "completed"]);
}

#[test]
fn test_idle_callback_lists_pending_bookmarks() {
    let journal = Journal::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let root = parallel("pair", vec![wait("left"), wait("right")]);
    let app = app(root, &journal).on_idle(move |args| {
        sink.lock().extend(args.bookmarks.iter().map(|info| info.bookmark.name.clone()));
    });

    assert!(matches!(app.run().unwrap(), RunOutcome::Idle));
    assert_eq!(*seen.lock(), vec!["left", "right"]);
}

#[test]
fn test_cancel_and_terminate_through_host() {
    let journal = Journal::new();
    let canceled = app(wait("approve"), &journal);
    canceled.run().unwrap();
    assert!(matches!(canceled.cancel().unwrap(), RunOutcome::Canceled));
    assert!(canceled.cancel().is_err());

    let terminated = app(wait("approve"), &journal);
    terminated.run().unwrap();
    match terminated.terminate("shutdown").unwrap() {
        RunOutcome::Faulted(fault) => assert!(fault.is_termination()),
        other => panic!("expected fault, got {:?}", other),
    }
}

#[test]
fn test_abort_invokes_callback() {
    let journal = Journal::new();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    let app = app(wait("host-abort"), &journal)
        .on_aborted(move |_, reason| sink.lock().push(reason.to_string()));
    app.run().unwrap();

    app.abort("maintenance").unwrap();
    assert_eq!(*reasons.lock(), vec!["maintenance"]);
    assert_eq!(app.state(), Some(WorkflowState::Aborted));
    assert!(app.run().is_err());
}

#[test]
fn test_persist_without_store_is_rejected() {
    let journal = Journal::new();
    let app = app(wait("approve"), &journal);
    app.run().unwrap();

    assert!(matches!(app.persist(), Err(HostError::NoInstanceStore)));
    assert!(matches!(app.unload(), Err(HostError::NoInstanceStore)));
}

/// Asks to be persisted, then waits
struct Checkpoint;

impl NativeActivity for Checkpoint {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
        ctx.request_persist();
        ctx.create_bookmark("continue", Some(CallbackTag::from("continue")))?;
        Ok(())
    }
}

#[test]
fn test_activity_persist_request_saves_at_idle() {
    let store = Arc::new(MemoryInstanceStore::new());
    let owner = create_owner(store.as_ref(), "host", TIMEOUT).unwrap();
    let app = WorkflowApplication::new(
        WorkflowDefinition::prepare(Activity::native("checkpoint", Checkpoint)),
        BTreeMap::new(),
    )
    .unwrap()
    .with_store(store.clone(), owner);

    assert!(matches!(app.run().unwrap(), RunOutcome::Idle));
    assert!(app.is_loaded());
    let entry = store.entries().remove(&app.id()).unwrap();
    assert_eq!(entry.metadata.bookmarks, vec!["continue".to_string()]);
    assert!(!entry.complete);
}

#[test]
fn test_completed_workflow_is_saved_as_complete() {
    let store = Arc::new(MemoryInstanceStore::new());
    let owner = create_owner(store.as_ref(), "host", TIMEOUT).unwrap();
    let journal = Journal::new();
    let app = app(wait("approve"), &journal).with_store(store.clone(), owner);

    app.run().unwrap();
    app.resume_and_run(&Bookmark::new("approve"), Value::symbol("go")).unwrap();

    let entry = store.entries().remove(&app.id()).unwrap();
    assert!(entry.complete);
    assert_eq!(entry.locked_by, None);
    assert_eq!(entry.metadata.state, WorkflowState::Closed);

    let reload = WorkflowApplication::load(
        WorkflowDefinition::prepare(wait("approve")),
        store.clone() as Arc<dyn InstanceStore>,
        owner,
        app.id(),
        EngineConfig::default(),
    );
    assert!(reload.is_err());
}

#[test]
fn test_persistable_idle_callback_overrides_config() {
    let store = Arc::new(MemoryInstanceStore::new());
    let owner = create_owner(store.as_ref(), "host", TIMEOUT).unwrap();
    let journal = Journal::new();
    let config = EngineConfig {
        persistable_idle: PersistableIdleAction::Unload,
        ..EngineConfig::default()
    };
    let app = app(wait("approve"), &journal)
        .with_config(config)
        .with_store(store.clone(), owner)
        .on_persistable_idle(|args| {
            assert_eq!(args.outstanding_async_operations, 0);
            PersistableIdleAction::Persist
        });

    app.run().unwrap();
    assert!(app.is_loaded());
    assert_eq!(store.entries().get(&app.id()).unwrap().locked_by, Some(owner));
}

#[test]
fn test_host_tracking_sees_persist_and_unload() {
    let store = Arc::new(MemoryInstanceStore::new());
    let owner = create_owner(store.as_ref(), "host", TIMEOUT).unwrap();
    let recorder = RecordingParticipant::new();
    let mut tracking = TrackingProvider::new();
    tracking.add_participant(recorder.clone());

    let journal = Journal::new();
    let app = app(wait("approve"), &journal)
        .with_tracking(tracking)
        .with_store(store, owner);
    app.run().unwrap();
    app.unload().unwrap();

    let states: Vec<WorkflowTrackingState> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TrackingEvent::WorkflowInstanceStateChanged { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            WorkflowTrackingState::Started,
            WorkflowTrackingState::Idle,
            WorkflowTrackingState::Persisted,
            WorkflowTrackingState::Unloaded,
        ]
    );
}

/// Blocks inside the executor until the test releases it
struct Gate;

impl CodeActivity for Gate {
    fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
        let barrier = ctx
            .get_extension::<Barrier>()
            .ok_or_else(|| anyhow::anyhow!("no barrier"))?;
        barrier.wait();
        barrier.wait();
        Ok(None)
    }
}

#[test]
fn test_concurrent_run_reports_busy() {
    let barrier = Arc::new(Barrier::new(2));
    let mut extensions = Extensions::new();
    extensions.add_shared(Arc::clone(&barrier));
    let app = WorkflowApplication::new(
        WorkflowDefinition::prepare(Activity::code("gate", Gate)),
        BTreeMap::new(),
    )
    .unwrap()
    .with_extensions(extensions);

    std::thread::scope(|scope| {
        let running = scope.spawn(|| app.run());

        // The first run is now inside the gate
        barrier.wait();
        assert!(matches!(app.run(), Err(HostError::InstanceBusy(_))));
        barrier.wait();

        let outcome = running.join().unwrap().unwrap();
        assert!(outcome.is_completed());
    });
}
