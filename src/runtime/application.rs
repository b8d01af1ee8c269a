//! Workflow host: one executor behind a lock, plus persistence and callbacks
//!
//! [`WorkflowApplication`] is the surface a host program drives. It owns a
//! single workflow instance, serializes access to its executor and turns run
//! outcomes into host callbacks. Callbacks fire after the executor lock is
//! released, so they may call back into the application.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::EngineConfig;
use super::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult};
use super::definition::WorkflowDefinition;
use super::error::{HostError, HostResult};
use super::executor::{ActivityExecutor, RunOutcome, WorkflowState};
use super::extensions::Extensions;
use super::fault::FaultInfo;
use super::instance::WorkflowInstanceId;
use super::store::{InstanceStore, OwnerId};
use super::tracking::TrackingProvider;
use super::value::Value;

/// What to do when a workflow goes idle with a store configured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistableIdleAction {
    /// Keep the workflow in memory
    #[default]
    None,
    /// Save and keep running
    Persist,
    /// Save, release the lock and drop the in-memory executor
    Unload,
}

/// Passed to idle callbacks
#[derive(Debug, Clone)]
pub struct WorkflowIdleEventArgs {
    /// Workflow that went idle
    pub workflow_id: WorkflowInstanceId,
    /// Bookmarks it is waiting on
    pub bookmarks: Vec<BookmarkInfo>,
    /// Asynchronous operations still outstanding
    pub outstanding_async_operations: usize,
}

type CompletedHandler = Box<dyn Fn(WorkflowInstanceId, &RunOutcome) + Send + Sync>;
type IdleHandler = Box<dyn Fn(&WorkflowIdleEventArgs) + Send + Sync>;
type PersistableIdleHandler =
    Box<dyn Fn(&WorkflowIdleEventArgs) -> PersistableIdleAction + Send + Sync>;
type ExceptionHandler = Box<dyn Fn(WorkflowInstanceId, &FaultInfo) + Send + Sync>;
type AbortedHandler = Box<dyn Fn(WorkflowInstanceId, &str) + Send + Sync>;
type UnloadedHandler = Box<dyn Fn(WorkflowInstanceId) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    completed: Option<CompletedHandler>,
    idle: Option<IdleHandler>,
    persistable_idle: Option<PersistableIdleHandler>,
    unhandled_exception: Option<ExceptionHandler>,
    aborted: Option<AbortedHandler>,
    unloaded: Option<UnloadedHandler>,
}

/// Host for one workflow instance
pub struct WorkflowApplication {
    id: WorkflowInstanceId,
    definition: Arc<WorkflowDefinition>,
    executor: Mutex<Option<ActivityExecutor>>,
    store: Option<(Arc<dyn InstanceStore>, OwnerId)>,
    config: EngineConfig,
    extensions: Extensions,
    tracking: TrackingProvider,
    callbacks: Callbacks,
    completion_reported: AtomicBool,
}

impl WorkflowApplication {
    /// Create a host for a new workflow instance
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        inputs: BTreeMap<String, Value>,
    ) -> HostResult<Self> {
        let id = WorkflowInstanceId::new();
        let executor = ActivityExecutor::new(id, Arc::clone(&definition), inputs)?;
        Ok(Self::with_executor(id, definition, Some(executor)))
    }

    /// Load a persisted workflow instance from a store
    pub fn load(
        definition: Arc<WorkflowDefinition>,
        store: Arc<dyn InstanceStore>,
        owner: OwnerId,
        id: WorkflowInstanceId,
        config: EngineConfig,
    ) -> HostResult<Self> {
        let app = Self::with_executor(id, definition, None)
            .with_config(config)
            .with_store(store, owner);
        app.reload()?;
        Ok(app)
    }

    fn with_executor(
        id: WorkflowInstanceId,
        definition: Arc<WorkflowDefinition>,
        executor: Option<ActivityExecutor>,
    ) -> Self {
        Self {
            id,
            definition,
            executor: Mutex::new(executor),
            store: None,
            config: EngineConfig::default(),
            extensions: Extensions::new(),
            tracking: TrackingProvider::new(),
            callbacks: Callbacks::default(),
            completion_reported: AtomicBool::new(false),
        }
    }

    /// Apply engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.tracking.set_enabled(config.tracking);
        self.config = config;
        self.reconfigure();
        self
    }

    /// Attach an instance store, acting as `owner`
    pub fn with_store(mut self, store: Arc<dyn InstanceStore>, owner: OwnerId) -> Self {
        self.store = Some((store, owner));
        self
    }

    /// Install host extensions
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self.reconfigure();
        self
    }

    /// Install a tracking provider
    pub fn with_tracking(mut self, mut tracking: TrackingProvider) -> Self {
        tracking.set_enabled(self.config.tracking);
        self.tracking = tracking;
        self.reconfigure();
        self
    }

    /// Called once when the workflow completes, faults or is canceled
    pub fn on_completed(
        mut self,
        handler: impl Fn(WorkflowInstanceId, &RunOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.completed = Some(Box::new(handler));
        self
    }

    /// Called every time a run ends idle
    pub fn on_idle(
        mut self,
        handler: impl Fn(&WorkflowIdleEventArgs) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.idle = Some(Box::new(handler));
        self
    }

    /// Decides what happens when the workflow goes idle with a store configured
    pub fn on_persistable_idle(
        mut self,
        handler: impl Fn(&WorkflowIdleEventArgs) -> PersistableIdleAction + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.persistable_idle = Some(Box::new(handler));
        self
    }

    /// Called before `on_completed` when the root faulted
    pub fn on_unhandled_exception(
        mut self,
        handler: impl Fn(WorkflowInstanceId, &FaultInfo) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.unhandled_exception = Some(Box::new(handler));
        self
    }

    /// Called when the workflow is aborted
    pub fn on_aborted(
        mut self,
        handler: impl Fn(WorkflowInstanceId, &str) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.aborted = Some(Box::new(handler));
        self
    }

    /// Called after the workflow is unloaded
    pub fn on_unloaded(
        mut self,
        handler: impl Fn(WorkflowInstanceId) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.unloaded = Some(Box::new(handler));
        self
    }

    fn reconfigure(&mut self) {
        if let Some(executor) = self.executor.get_mut().take() {
            let executor = executor
                .with_extensions(self.extensions.clone())
                .with_tracking(self.tracking.clone());
            *self.executor.get_mut() = Some(executor);
        }
    }

    /// Workflow instance id
    pub fn id(&self) -> WorkflowInstanceId {
        self.id
    }

    /// Workflow state, none while unloaded
    pub fn state(&self) -> Option<WorkflowState> {
        self.executor.lock().as_ref().map(|e| e.state())
    }

    /// Whether the executor is in memory
    pub fn is_loaded(&self) -> bool {
        self.executor.lock().is_some()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.store_timeout_ms)
    }

    fn store(&self) -> HostResult<(&dyn InstanceStore, OwnerId)> {
        self.store
            .as_ref()
            .map(|(store, owner)| (store.as_ref(), *owner))
            .ok_or(HostError::NoInstanceStore)
    }

    /// Drain the work queue and report the outcome to callbacks
    ///
    /// Fails with `InstanceBusy` when another caller is running this instance.
    pub fn run(&self) -> HostResult<RunOutcome> {
        let mut guard = self
            .executor
            .try_lock()
            .ok_or(HostError::InstanceBusy(self.id))?;
        let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;

        let outcome = executor.run()?;
        let persist_requested = executor.take_persist_request();
        let idle = WorkflowIdleEventArgs {
            workflow_id: self.id,
            bookmarks: executor.bookmarks(),
            outstanding_async_operations: executor.outstanding_async_operations(),
        };
        drop(guard);

        if outcome.is_completed() {
            self.report_completion(&outcome)?;
        } else {
            self.handle_idle(&idle, persist_requested)?;
        }
        Ok(outcome)
    }

    /// Run, waiting for asynchronous operations, until the workflow completes
    /// or goes idle with nothing but bookmarks pending
    pub async fn run_until_idle(&self) -> HostResult<RunOutcome> {
        loop {
            let outcome = self.run()?;
            if outcome.is_completed() || !self.has_outstanding_async()? {
                return Ok(outcome);
            }
            self.wait_for_async().await?;
        }
    }

    fn has_outstanding_async(&self) -> HostResult<bool> {
        let guard = self.executor.lock();
        let executor = guard.as_ref().ok_or(HostError::NotLoaded(self.id))?;
        Ok(executor.outstanding_async_operations() > 0)
    }

    /// Wait until an asynchronous operation completes
    ///
    /// Returns immediately when work is already runnable or nothing is
    /// outstanding.
    pub async fn wait_for_async(&self) -> HostResult<()> {
        loop {
            let notifier = {
                let mut guard = self.executor.lock();
                let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;
                if executor.drain_async_completions() > 0
                    || executor.has_runnable_work()
                    || executor.outstanding_async_operations() == 0
                {
                    return Ok(());
                }
                executor.async_notifier()
            };
            notifier.notified().await;
        }
    }

    fn handle_idle(&self, idle: &WorkflowIdleEventArgs, persist_requested: bool) -> HostResult<()> {
        tracing::debug!(workflow = %self.id, bookmarks = idle.bookmarks.len(), "workflow idle");
        if let Some(handler) = &self.callbacks.idle {
            handler(idle);
        }
        if self.store.is_none() || idle.outstanding_async_operations > 0 {
            return Ok(());
        }

        let mut action = match &self.callbacks.persistable_idle {
            Some(handler) => handler(idle),
            None => self.config.persistable_idle,
        };
        if persist_requested && action == PersistableIdleAction::None {
            action = PersistableIdleAction::Persist;
        }
        match action {
            PersistableIdleAction::None => Ok(()),
            PersistableIdleAction::Persist => self.persist(),
            PersistableIdleAction::Unload => self.unload(),
        }
    }

    fn report_completion(&self, outcome: &RunOutcome) -> HostResult<()> {
        if self.completion_reported.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.store.is_some() {
            if let Err(err) = self.persist() {
                // Report again on the next run, once the save goes through
                self.completion_reported.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }
        tracing::info!(workflow = %self.id, "workflow finished");
        if let (RunOutcome::Faulted(fault), Some(handler)) =
            (outcome, &self.callbacks.unhandled_exception)
        {
            handler(self.id, fault);
        }
        if let Some(handler) = &self.callbacks.completed {
            handler(self.id, outcome);
        }
        Ok(())
    }

    /// Resume a bookmark; the value is delivered on the next [`run`](Self::run)
    ///
    /// Blocks while another caller holds the executor. Reports `NotReady`
    /// while the workflow is unloaded.
    pub fn resume_bookmark(
        &self,
        bookmark: &Bookmark,
        value: Value,
    ) -> HostResult<BookmarkResumptionResult> {
        let mut guard = self.executor.lock();
        Ok(match guard.as_mut() {
            Some(executor) => executor.resume_bookmark(bookmark, value),
            None => BookmarkResumptionResult::NotReady,
        })
    }

    /// Resume a bookmark and run
    pub fn resume_and_run(
        &self,
        bookmark: &Bookmark,
        value: Value,
    ) -> HostResult<(BookmarkResumptionResult, Option<RunOutcome>)> {
        let result = self.resume_bookmark(bookmark, value)?;
        if result != BookmarkResumptionResult::Success {
            return Ok((result, None));
        }
        Ok((result, Some(self.run()?)))
    }

    /// Pending bookmarks
    pub fn bookmarks(&self) -> HostResult<Vec<BookmarkInfo>> {
        let guard = self.executor.lock();
        let executor = guard.as_ref().ok_or(HostError::NotLoaded(self.id))?;
        Ok(executor.bookmarks())
    }

    /// Cancel the workflow and run the cancellation to completion
    pub fn cancel(&self) -> HostResult<RunOutcome> {
        {
            let mut guard = self.executor.lock();
            let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;
            executor.cancel_workflow()?;
        }
        self.run()
    }

    /// Terminate the workflow with a reason
    pub fn terminate(&self, reason: impl Into<String>) -> HostResult<RunOutcome> {
        {
            let mut guard = self.executor.lock();
            let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;
            executor.terminate(reason)?;
        }
        self.run()
    }

    /// Tear the workflow down without saving
    pub fn abort(&self, reason: impl Into<String>) -> HostResult<()> {
        let reason = reason.into();
        {
            let mut guard = self.executor.lock();
            let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;
            executor.abort(reason.clone());
        }
        if let Some(handler) = &self.callbacks.aborted {
            handler(self.id, &reason);
        }
        Ok(())
    }

    /// Save the workflow, keeping it locked to this host
    pub fn persist(&self) -> HostResult<()> {
        let (store, owner) = self.store()?;
        let mut guard = self.executor.lock();
        let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;
        executor.request_persist(store, owner, self.timeout())?;
        Ok(())
    }

    /// Save the workflow, release its lock and drop it from memory
    pub fn unload(&self) -> HostResult<()> {
        let (store, owner) = self.store()?;
        {
            let mut guard = self.executor.lock();
            let executor = guard.as_mut().ok_or(HostError::NotLoaded(self.id))?;
            executor.save(store, owner, self.timeout(), true)?;
            *guard = None;
        }
        tracing::info!(workflow = %self.id, "workflow unloaded");
        if let Some(handler) = &self.callbacks.unloaded {
            handler(self.id);
        }
        Ok(())
    }

    /// Bring an unloaded workflow back into memory
    pub fn reload(&self) -> HostResult<()> {
        let (store, owner) = self.store()?;
        let mut guard = self.executor.lock();
        if guard.is_some() {
            return Ok(());
        }
        let executor = ActivityExecutor::load(
            Arc::clone(&self.definition),
            store,
            owner,
            self.id,
            self.timeout(),
        )?
        .with_extensions(self.extensions.clone())
        .with_tracking(self.tracking.clone());
        if executor.state().is_completed() {
            self.completion_reported.store(true, Ordering::SeqCst);
        }
        *guard = Some(executor);
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowApplication")
            .field("id", &self.id)
            .field("loaded", &self.is_loaded())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{Activity, CallbackTag, NativeActivity};
    use crate::runtime::context::NativeActivityContext;
    use crate::runtime::store::{MemoryInstanceStore, create_owner};

    struct Approval;

    impl NativeActivity for Approval {
        fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
            ctx.create_bookmark("approve", Some(CallbackTag::from("approved")))?;
            Ok(())
        }

        fn on_bookmark_resumed(
            &self,
            ctx: &mut NativeActivityContext<'_>,
            _callback: &CallbackTag,
            _bookmark: &Bookmark,
            value: Value,
        ) -> anyhow::Result<()> {
            ctx.set_result(value);
            Ok(())
        }
    }

    fn definition() -> Arc<WorkflowDefinition> {
        WorkflowDefinition::prepare(Activity::native("approval", Approval))
    }

    #[test]
    fn test_completion_reported_once() {
        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        let app = WorkflowApplication::new(definition(), BTreeMap::new())
            .unwrap()
            .on_completed(move |_, _| *seen.lock() += 1);

        assert!(matches!(app.run().unwrap(), RunOutcome::Idle));
        let (result, outcome) = app
            .resume_and_run(&Bookmark::new("approve"), Value::symbol("ok"))
            .unwrap();
        assert_eq!(result, BookmarkResumptionResult::Success);
        assert!(matches!(outcome, Some(RunOutcome::Completed { .. })));
        app.run().unwrap();

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_unload_and_reload() {
        let store: Arc<dyn InstanceStore> = Arc::new(MemoryInstanceStore::new());
        let owner = create_owner(store.as_ref(), "host", Duration::from_secs(1)).unwrap();
        let app = WorkflowApplication::new(definition(), BTreeMap::new())
            .unwrap()
            .with_store(Arc::clone(&store), owner)
            .on_persistable_idle(|_| PersistableIdleAction::Unload);

        app.run().unwrap();
        assert!(!app.is_loaded());
        assert_eq!(
            app.resume_bookmark(&Bookmark::new("approve"), Value::symbol("late")).unwrap(),
            BookmarkResumptionResult::NotReady
        );

        app.reload().unwrap();
        assert_eq!(app.bookmarks().unwrap().len(), 1);
    }

    #[test]
    fn test_persist_requires_store() {
        let app = WorkflowApplication::new(definition(), BTreeMap::new()).unwrap();
        app.run().unwrap();
        assert!(matches!(app.persist(), Err(HostError::NoInstanceStore)));
    }
}
