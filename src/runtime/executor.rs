//! The activity executor
//!
//! The executor is the single authority over a workflow's live instance tree.
//! It owns the work queue, the bookmark table and the outstanding asynchronous
//! operations, and it is the only component that mutates instance state.
//!
//! Every mutation takes `&mut self`; activity code reaches the executor only
//! through a context that borrows it for one callback. Errors and panics that
//! escape activity code are caught at the dispatch boundary and turned into
//! fault propagation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::activity::{ActivityKind, ArgumentBinding};
use super::async_op::{
    AsyncOperation, AsyncOperationId, CompletionReceiver, CompletionSink, completion_channel,
};
use super::bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkOptions, BookmarkResumptionResult,
    BookmarkScope, RegisterOutcome,
};
use super::context::{
    AsyncCodeActivityContext, CodeActivityContext, NativeActivityContext, ScheduleOptions,
};
use super::definition::{ActivityId, WorkflowDefinition};
use super::error::{
    BookmarkError, BookmarkResult, ContractResult, ContractViolation, EngineResult,
    PersistenceError,
};
use super::extensions::Extensions;
use super::fault::{FaultContext, FaultHandling, FaultInfo, panic_message};
use super::instance::{
    ActivityInstance, ActivityInstanceState, CompletedChild, InstanceId, WorkflowInstanceId,
};
use super::instance_map::{self, WorkflowSnapshot};
use super::store::{InstanceCommand, InstanceData, InstanceMetadata, InstanceStore, OwnerId};
use super::tracking::{ActivityInfo, TrackingEvent, TrackingProvider, WorkflowTrackingState};
use super::value::{Value, null};
use super::work_item::{WorkItem, WorkItemPriority, WorkQueue};

/// Workflow-level execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Work is queued or being processed
    Runnable,
    /// Nothing runnable; waiting on bookmarks or asynchronous operations
    Idle,
    /// Root closed
    Closed,
    /// Root canceled
    Canceled,
    /// Root faulted
    Faulted,
    /// Torn down without completing
    Aborted,
}

impl WorkflowState {
    /// True for Closed, Canceled and Faulted
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            WorkflowState::Closed | WorkflowState::Canceled | WorkflowState::Faulted
        )
    }

    /// True when the workflow no longer accepts stimulus
    pub fn is_final(self) -> bool {
        self.is_completed() || self == WorkflowState::Aborted
    }
}

/// Result of draining the work queue
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Root closed normally
    Completed {
        /// Result value set by the root activity
        result: Option<Value>,
        /// Values of the root's Out and InOut arguments
        outputs: BTreeMap<String, Value>,
    },
    /// Root faulted
    Faulted(FaultInfo),
    /// Root canceled
    Canceled,
    /// Waiting on bookmarks or asynchronous operations
    Idle,
}

impl RunOutcome {
    /// True for every outcome except Idle
    pub fn is_completed(&self) -> bool {
        !matches!(self, RunOutcome::Idle)
    }
}

/// Scheduler for one workflow instance
pub struct ActivityExecutor {
    pub(crate) workflow_id: WorkflowInstanceId,
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) instances: BTreeMap<InstanceId, ActivityInstance>,
    pub(crate) next_instance_id: u64,
    pub(crate) root: InstanceId,
    pub(crate) queue: WorkQueue,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) async_ops: BTreeMap<AsyncOperationId, InstanceId>,
    pub(crate) next_async_id: u64,
    pub(crate) state: WorkflowState,
    sink: CompletionSink,
    receiver: CompletionReceiver,
    notify: Arc<Notify>,
    extensions: Extensions,
    tracking: TrackingProvider,
    outcome: Option<RunOutcome>,
    persist_requested: bool,
    announce: Option<WorkflowTrackingState>,
}

impl ActivityExecutor {
    /// Create an executor for a new workflow instance
    ///
    /// Fails when the definition has validation errors or the inputs do not
    /// match the root's arguments.
    pub fn new(
        workflow_id: WorkflowInstanceId,
        definition: Arc<WorkflowDefinition>,
        inputs: BTreeMap<String, Value>,
    ) -> EngineResult<Self> {
        definition.ensure_valid()?;
        definition.check_inputs(&inputs)?;

        let mut executor = Self::empty(workflow_id, Arc::clone(&definition));
        let root_id = executor.allocate_instance_id();
        let node = definition.root();

        let mut root =
            ActivityInstance::new(root_id, ActivityId::ROOT, None, BookmarkScope::Default);
        for variable in &node.variables {
            root.environment
                .declare(&variable.name, variable.default.clone().unwrap_or_else(null));
        }
        for argument in &node.arguments {
            let value = match (inputs.get(&argument.name), &argument.binding) {
                (Some(value), _) => value.clone(),
                (None, ArgumentBinding::Literal(value)) if argument.direction.is_input() => {
                    value.clone()
                }
                _ => null(),
            };
            root.environment.declare(&argument.name, value);
        }

        executor.instances.insert(root_id, root);
        executor.root = root_id;
        executor.queue.push(WorkItem::ExecuteActivity { instance: root_id });
        executor.announce = Some(WorkflowTrackingState::Started);

        tracing::debug!(workflow = %workflow_id, root = %node.display_name, "workflow created");
        Ok(executor)
    }

    pub(crate) fn empty(
        workflow_id: WorkflowInstanceId,
        definition: Arc<WorkflowDefinition>,
    ) -> Self {
        let (sender, receiver) = completion_channel();
        let notify = Arc::new(Notify::new());
        Self {
            workflow_id,
            definition,
            instances: BTreeMap::new(),
            next_instance_id: 1,
            root: InstanceId(1),
            queue: WorkQueue::new(),
            bookmarks: BookmarkManager::new(),
            async_ops: BTreeMap::new(),
            next_async_id: 1,
            state: WorkflowState::Runnable,
            sink: CompletionSink::new(sender, Arc::clone(&notify)),
            receiver,
            notify,
            extensions: Extensions::new(),
            tracking: TrackingProvider::new(),
            outcome: None,
            persist_requested: false,
            announce: None,
        }
    }

    /// Reconstruct an executor from a snapshot
    ///
    /// The supplied definition must be structurally identical to the one the
    /// snapshot was taken from.
    pub fn from_snapshot(
        definition: Arc<WorkflowDefinition>,
        snapshot: WorkflowSnapshot,
    ) -> EngineResult<Self> {
        definition.ensure_valid()?;
        let restored = instance_map::restore(&definition, snapshot)?;

        let mut executor = Self::empty(restored.workflow_id, definition);
        executor.instances = restored.instances;
        executor.root = restored.root;
        executor.next_instance_id = restored.next_instance_id;
        executor.next_async_id = restored.next_async_id;
        executor.bookmarks = restored.bookmarks;
        executor.state = restored.state;
        if executor.state.is_completed() {
            executor.finish_workflow();
        }
        executor.announce = Some(WorkflowTrackingState::Loaded);

        tracing::info!(
            workflow = %executor.workflow_id,
            instances = executor.instances.len(),
            bookmarks = executor.bookmarks.len(),
            "workflow reconstructed"
        );
        Ok(executor)
    }

    /// Load a workflow from an instance store
    pub fn load(
        definition: Arc<WorkflowDefinition>,
        store: &dyn InstanceStore,
        owner: OwnerId,
        workflow_id: WorkflowInstanceId,
        timeout: Duration,
    ) -> EngineResult<Self> {
        let data = store
            .try_command(
                InstanceCommand::LoadWorkflow {
                    owner,
                    instance: workflow_id,
                },
                timeout,
            )?
            .into_loaded()
            .ok_or_else(|| {
                PersistenceError::InvalidSnapshot("store returned no instance data".to_string())
            })?;
        let snapshot = instance_map::decode_snapshot(&data.bytes)?;
        if snapshot.workflow_id != workflow_id {
            return Err(PersistenceError::InvalidSnapshot(format!(
                "store returned instance {} for {}",
                snapshot.workflow_id, workflow_id
            ))
            .into());
        }
        Self::from_snapshot(definition, snapshot)
    }

    /// Install host extensions
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Install a tracking provider
    pub fn with_tracking(mut self, tracking: TrackingProvider) -> Self {
        self.tracking = tracking;
        self
    }

    /// Workflow instance id
    pub fn workflow_id(&self) -> WorkflowInstanceId {
        self.workflow_id
    }

    /// The definition being executed
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Shared handle to the definition
    pub fn definition_arc(&self) -> Arc<WorkflowDefinition> {
        Arc::clone(&self.definition)
    }

    /// Workflow-level state
    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Terminal outcome, once the root has completed
    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Root instance id
    pub fn root_id(&self) -> InstanceId {
        self.root
    }

    /// A live instance
    pub fn instance(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn instance_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.instances.get_mut(&id)
    }

    /// Live instances in id order
    pub fn instances(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.instances.values()
    }

    /// Host extensions
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Tracking provider
    pub fn tracking_mut(&mut self) -> &mut TrackingProvider {
        &mut self.tracking
    }

    /// Number of asynchronous operations that have not completed
    pub fn outstanding_async_operations(&self) -> usize {
        self.async_ops.len()
    }

    /// True when work items are queued
    pub fn has_runnable_work(&self) -> bool {
        self.queue.has_work()
    }

    /// Wakeup signalled whenever an asynchronous operation completes
    pub fn async_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Whether activity code asked for persistence
    pub fn persist_requested(&self) -> bool {
        self.persist_requested
    }

    /// Read and clear the persistence request flag
    pub fn take_persist_request(&mut self) -> bool {
        std::mem::take(&mut self.persist_requested)
    }

    pub(crate) fn set_persist_requested(&mut self) {
        self.persist_requested = true;
    }

    fn allocate_instance_id(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        id
    }

    fn kind_of(&self, id: InstanceId) -> Option<ActivityKind> {
        self.instances
            .get(&id)
            .map(|instance| self.definition.node(instance.activity).kind.clone())
    }

    /// Nearest instance on the ancestor-or-self chain declaring `name`
    pub(crate) fn resolve_location(&self, from: InstanceId, name: &str) -> Option<InstanceId> {
        let mut current = Some(from);
        while let Some(id) = current {
            let instance = self.instances.get(&id)?;
            if instance.environment.contains(name) {
                return Some(id);
            }
            current = instance.parent;
        }
        None
    }

    pub(crate) fn is_ancestor_or_self(&self, ancestor: InstanceId, id: InstanceId) -> bool {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            current = self.instances.get(&candidate).and_then(|i| i.parent);
        }
        false
    }

    pub(crate) fn is_cancel_requested(&self, id: InstanceId) -> bool {
        self.instances
            .get(&id)
            .map(|i| i.cancel_requested)
            .unwrap_or(false)
    }

    // Tracking helpers

    fn activity_info(&self, id: InstanceId) -> Option<ActivityInfo> {
        self.instances.get(&id).map(|instance| {
            let node = self.definition.node(instance.activity);
            ActivityInfo {
                instance: id,
                activity_path: node.path.clone(),
                name: node.display_name.clone(),
            }
        })
    }

    fn track(&mut self, event: TrackingEvent) {
        let workflow = self.workflow_id;
        self.tracking.emit(workflow, event);
    }

    fn track_state(&mut self, id: InstanceId, state: ActivityInstanceState) {
        if !self.tracking.is_active() {
            return;
        }
        if let Some(activity) = self.activity_info(id) {
            self.track(TrackingEvent::ActivityStateChanged { activity, state });
        }
    }

    fn track_workflow(&mut self, state: WorkflowTrackingState) {
        self.track(TrackingEvent::WorkflowInstanceStateChanged { state });
    }

    fn announce_lifecycle(&mut self) {
        if let Some(state) = self.announce.take() {
            self.track_workflow(state);
            if state == WorkflowTrackingState::Started && self.tracking.is_active() {
                if let Some(child) = self.activity_info(self.root) {
                    self.track(TrackingEvent::ActivityScheduled {
                        parent: None,
                        child,
                    });
                }
            }
        }
    }

    // Scheduling

    /// Create a child instance and queue its execution
    pub(crate) fn schedule_child(
        &mut self,
        parent: InstanceId,
        activity: ActivityId,
        options: ScheduleOptions,
    ) -> ContractResult<InstanceId> {
        let parent_instance = self
            .instances
            .get(&parent)
            .ok_or(ContractViolation::UnknownInstance(parent))?;
        if parent_instance.state != ActivityInstanceState::Executing {
            return Err(ContractViolation::InstanceNotExecuting {
                instance: parent,
                state: parent_instance.state,
            });
        }
        let parent_activity = parent_instance.activity;
        let parent_scope = parent_instance.bookmark_scope;

        let definition = Arc::clone(&self.definition);
        if !definition.is_declared_child(parent_activity, activity) {
            let child = definition
                .get(activity)
                .map(|node| node.path.clone())
                .unwrap_or_else(|| activity.to_string());
            return Err(ContractViolation::NotADeclaredChild {
                parent: definition.node(parent_activity).path.clone(),
                child,
            });
        }
        let node = definition.node(activity);
        if !node.is_valid() {
            return Err(ContractViolation::InvalidDefinition(node.path.clone()));
        }

        let scope = match options.scope {
            None => parent_scope,
            Some(BookmarkScope::Default) => BookmarkScope::Default,
            Some(scope) => {
                let owned = self.bookmarks.scope_owner(&scope) == Some(parent);
                if !owned && scope != parent_scope {
                    return Err(ContractViolation::ScopeNotOwned(scope));
                }
                scope
            }
        };

        for name in options.arguments.keys() {
            match node.argument(name) {
                Some(argument) if argument.direction.is_input() => {}
                _ => return Err(ContractViolation::UnknownArgument(name.clone())),
            }
        }

        let id = self.allocate_instance_id();
        let mut child = ActivityInstance::new(id, activity, Some(parent), scope);
        child.completion_callback = options.on_completed;
        child.fault_callback = options.on_faulted;

        for variable in &node.variables {
            child
                .environment
                .declare(&variable.name, variable.default.clone().unwrap_or_else(null));
        }
        for argument in &node.arguments {
            let value = if !argument.direction.is_input() {
                null()
            } else if let Some(value) = options.arguments.get(&argument.name) {
                value.clone()
            } else {
                match &argument.binding {
                    ArgumentBinding::Literal(value) => value.clone(),
                    ArgumentBinding::Variable(name) => self
                        .resolve_location(parent, name)
                        .and_then(|owner| self.instances.get(&owner))
                        .and_then(|owner| owner.environment.get(name))
                        .cloned()
                        .unwrap_or_else(null),
                    ArgumentBinding::Unbound => null(),
                }
            };
            child.environment.declare(&argument.name, value);
        }

        self.instances.insert(id, child);
        if let Some(parent_instance) = self.instances.get_mut(&parent) {
            parent_instance.children.push(id);
            parent_instance.increment_busy();
        }
        self.queue.push(WorkItem::ExecuteActivity { instance: id });

        tracing::debug!(
            workflow = %self.workflow_id,
            parent = %parent,
            child = %id,
            activity = %node.display_name,
            "activity scheduled"
        );
        if self.tracking.is_active() {
            let parent_info = self.activity_info(parent);
            if let Some(child_info) = self.activity_info(id) {
                self.track(TrackingEvent::ActivityScheduled {
                    parent: parent_info,
                    child: child_info,
                });
            }
        }
        Ok(id)
    }

    pub(crate) fn cancel_child(
        &mut self,
        parent: InstanceId,
        child: InstanceId,
    ) -> ContractResult<()> {
        let parent_instance = self
            .instances
            .get(&parent)
            .ok_or(ContractViolation::UnknownInstance(parent))?;
        if !parent_instance.children.contains(&child) {
            return Err(ContractViolation::NotAChildInstance { parent, child });
        }
        self.queue.push(WorkItem::Cancel { instance: child });
        Ok(())
    }

    pub(crate) fn cancel_children(&mut self, parent: InstanceId) {
        let children = self
            .instances
            .get(&parent)
            .map(|instance| instance.children.clone())
            .unwrap_or_default();
        for child in children {
            self.queue.push(WorkItem::Cancel { instance: child });
        }
    }

    pub(crate) fn mark_canceled(&mut self, id: InstanceId) -> ContractResult<()> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(ContractViolation::UnknownInstance(id))?;
        if !instance.cancel_requested {
            return Err(ContractViolation::CancelNotRequested(id));
        }
        instance.marked_canceled = true;
        Ok(())
    }

    // Bookmarks

    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        bookmark: Bookmark,
        callback: Option<super::activity::CallbackTag>,
        options: BookmarkOptions,
    ) -> BookmarkResult<Bookmark> {
        let live = self
            .instances
            .get(&owner)
            .map(|i| i.state.is_live())
            .unwrap_or(false);
        if !live {
            return Err(BookmarkError::OwnerNotLive(owner));
        }

        let outcome = self
            .bookmarks
            .register(bookmark.clone(), owner, callback, options)?;
        if outcome == RegisterOutcome::Registered && options.is_blocking() {
            if let Some(instance) = self.instances.get_mut(&owner) {
                instance.increment_busy();
            }
        }
        Ok(bookmark)
    }

    pub(crate) fn remove_bookmark(&mut self, owner: InstanceId, bookmark: &Bookmark) -> bool {
        let owned = self
            .bookmarks
            .resolve(bookmark)
            .map(|r| r.owner == owner)
            .unwrap_or(false);
        if !owned {
            return false;
        }
        if let Some(registration) = self.bookmarks.unregister(bookmark) {
            if registration.options.is_blocking() {
                if let Some(instance) = self.instances.get_mut(&owner) {
                    instance.decrement_busy();
                }
            }
        }
        true
    }

    pub(crate) fn remove_all_bookmarks(&mut self, owner: InstanceId) {
        let removed = self.bookmarks.remove_all_owned_by(owner);
        if let Some(instance) = self.instances.get_mut(&owner) {
            for registration in removed {
                if registration.options.is_blocking() {
                    instance.decrement_busy();
                }
            }
        }
    }

    pub(crate) fn create_bookmark_scope(
        &mut self,
        owner: InstanceId,
    ) -> ContractResult<BookmarkScope> {
        let instance = self
            .instances
            .get(&owner)
            .ok_or(ContractViolation::UnknownInstance(owner))?;
        if !instance.state.is_live() {
            return Err(ContractViolation::InstanceNotExecuting {
                instance: owner,
                state: instance.state,
            });
        }
        Ok(self.bookmarks.create_scope(owner))
    }

    /// Resume a bookmark at normal priority
    pub fn resume_bookmark(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
    ) -> BookmarkResumptionResult {
        self.resume_bookmark_with_priority(bookmark, value, WorkItemPriority::Normal)
    }

    /// Resume a bookmark
    ///
    /// Queues a resumption work item for the owner; the value is delivered on
    /// the next [`run`](Self::run). A one-shot bookmark is unregistered
    /// immediately, so a second resumption reports `NotFound`. A finished
    /// workflow holds no bookmarks and reports `NotFound` for every name;
    /// only an aborted workflow reports `NotReady`.
    pub fn resume_bookmark_with_priority(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
        priority: WorkItemPriority,
    ) -> BookmarkResumptionResult {
        if self.state == WorkflowState::Aborted {
            return BookmarkResumptionResult::NotReady;
        }
        let Some(registration) = self.bookmarks.resolve(bookmark).cloned() else {
            tracing::debug!(
                workflow = %self.workflow_id,
                bookmark = %bookmark,
                "bookmark not found"
            );
            return BookmarkResumptionResult::NotFound;
        };

        let releases_owner = if registration.options.multiple_resume {
            false
        } else {
            self.bookmarks.unregister(bookmark);
            registration.options.is_blocking()
        };

        self.queue.push_with_priority(
            WorkItem::BookmarkResumption {
                owner: registration.owner,
                bookmark: bookmark.clone(),
                callback: registration.callback,
                value,
                releases_owner,
            },
            priority,
        );
        if self.state == WorkflowState::Idle {
            self.state = WorkflowState::Runnable;
        }
        tracing::debug!(
            workflow = %self.workflow_id,
            bookmark = %bookmark,
            owner = %registration.owner,
            "bookmark resumed"
        );
        BookmarkResumptionResult::Success
    }

    /// Pending bookmarks in (scope, name) order
    pub fn bookmarks(&self) -> Vec<BookmarkInfo> {
        self.bookmarks
            .iter()
            .map(|registration| BookmarkInfo {
                bookmark: registration.bookmark.clone(),
                owner: registration.owner,
                owner_name: self
                    .instances
                    .get(&registration.owner)
                    .map(|i| self.definition.node(i.activity).display_name.clone())
                    .unwrap_or_default(),
                options: registration.options,
            })
            .collect()
    }

    // Asynchronous operations

    fn begin_async(&mut self, owner: InstanceId) -> AsyncOperation {
        let id = AsyncOperationId(self.next_async_id);
        self.next_async_id += 1;
        self.async_ops.insert(id, owner);
        if let Some(instance) = self.instances.get_mut(&owner) {
            instance.increment_busy();
        }
        AsyncOperation::new(id, self.workflow_id, self.sink.clone())
    }

    fn abandon_async(&mut self, owner: InstanceId) {
        let abandoned: Vec<AsyncOperationId> = self
            .async_ops
            .iter()
            .filter(|(_, op_owner)| **op_owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            self.async_ops.remove(&id);
            if let Some(instance) = self.instances.get_mut(&owner) {
                instance.decrement_busy();
            }
            tracing::debug!(
                workflow = %self.workflow_id,
                operation = %id,
                "async operation abandoned"
            );
        }
    }

    /// Move completed asynchronous operations into the work queue
    pub fn drain_async_completions(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(message) = self.receiver.try_recv() {
            self.queue.push(WorkItem::AsyncCompletion {
                operation: message.operation,
                result: message.result,
            });
            drained += 1;
        }
        if drained > 0 && self.state == WorkflowState::Idle {
            self.state = WorkflowState::Runnable;
        }
        drained
    }

    // Running

    /// Drain the work queue
    ///
    /// Returns when the root completes or nothing is runnable. Calling `run`
    /// on a completed workflow returns the stored outcome.
    pub fn run(&mut self) -> EngineResult<RunOutcome> {
        self.ensure_not_aborted()?;
        self.announce_lifecycle();
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }

        self.state = WorkflowState::Runnable;
        while self.outcome.is_none() && self.step() {}
        Ok(self.settle())
    }

    /// Dispatch a single work item; returns false when nothing was runnable
    ///
    /// The workflow settles as Idle as soon as the queue drains.
    pub fn run_one_step(&mut self) -> EngineResult<bool> {
        self.ensure_not_aborted()?;
        self.announce_lifecycle();
        if self.outcome.is_some() {
            return Ok(false);
        }
        if !self.step() {
            self.settle();
            return Ok(false);
        }
        if self.queue.is_empty() {
            self.settle();
        } else if self.outcome.is_none() {
            self.state = WorkflowState::Runnable;
        }
        Ok(true)
    }

    fn ensure_not_aborted(&self) -> ContractResult<()> {
        if self.state == WorkflowState::Aborted {
            return Err(ContractViolation::WorkflowAborted(self.workflow_id));
        }
        Ok(())
    }

    fn step(&mut self) -> bool {
        self.drain_async_completions();
        match self.queue.pop() {
            Some(item) => {
                self.dispatch(item);
                true
            }
            None => false,
        }
    }

    fn settle(&mut self) -> RunOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        if self.state != WorkflowState::Idle {
            self.state = WorkflowState::Idle;
            tracing::debug!(
                workflow = %self.workflow_id,
                bookmarks = self.bookmarks.len(),
                async_ops = self.async_ops.len(),
                "workflow idle"
            );
            if self.bookmarks.is_empty() && self.async_ops.is_empty() {
                tracing::warn!(workflow = %self.workflow_id, "workflow idle with nothing pending");
            }
            self.track_workflow(WorkflowTrackingState::Idle);
        }
        RunOutcome::Idle
    }

    fn dispatch(&mut self, item: WorkItem) {
        tracing::trace!(
            workflow = %self.workflow_id,
            kind = item.kind(),
            target = ?item.target(),
            "dispatch"
        );
        match item {
            WorkItem::ExecuteActivity { instance } => self.execute_activity(instance),
            WorkItem::CompletionCallback { parent, child } => {
                self.deliver_completion(parent, child)
            }
            WorkItem::FaultCallback {
                handler,
                child,
                callback,
                fault,
            } => self.deliver_fault(handler, child, callback, fault),
            WorkItem::Cancel { instance } => self.cancel_instance(instance),
            WorkItem::BookmarkResumption {
                owner,
                bookmark,
                callback,
                value,
                releases_owner,
            } => self.deliver_resumption(owner, bookmark, callback, value, releases_owner),
            WorkItem::AsyncCompletion { operation, result } => {
                self.complete_async(operation, result)
            }
        }
    }

    /// Run activity code, converting errors and panics into a fault of `instance`
    fn invoke<R>(
        &mut self,
        instance: InstanceId,
        call: impl FnOnce(&mut Self) -> anyhow::Result<R>,
    ) -> Option<R> {
        let error = match panic::catch_unwind(AssertUnwindSafe(|| call(self))) {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => err,
            Err(payload) => {
                anyhow::anyhow!("activity panicked: {}", panic_message(payload.as_ref()))
            }
        };
        self.raise_fault(instance, error);
        None
    }

    fn raise_fault(&mut self, id: InstanceId, error: anyhow::Error) {
        let Some(instance) = self.instances.get(&id) else {
            tracing::warn!(
                workflow = %self.workflow_id,
                instance = %id,
                "fault raised by a removed instance: {:#}",
                error
            );
            return;
        };
        if instance.state.is_terminal() {
            tracing::warn!(
                workflow = %self.workflow_id,
                instance = %id,
                "fault raised by a completed instance: {:#}",
                error
            );
            return;
        }
        let node = self.definition.node(instance.activity);
        let fault = FaultInfo::new(error, id, instance.activity, node.display_name.clone());
        tracing::debug!(
            workflow = %self.workflow_id,
            instance = %id,
            "activity faulted: {:#}",
            fault.error()
        );
        self.fault_instance(id, fault);
    }

    fn execute_activity(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        if instance.executed || instance.state != ActivityInstanceState::Executing {
            tracing::trace!(workflow = %self.workflow_id, instance = %id, "execute skipped");
            return;
        }
        let Some(kind) = self.kind_of(id) else {
            return;
        };
        self.track_state(id, ActivityInstanceState::Executing);

        let completed = match kind {
            ActivityKind::Code(body) => self
                .invoke(id, |executor| {
                    body.execute(&mut CodeActivityContext::new(executor, id))
                })
                .map(|result| {
                    if let (Some(value), Some(instance)) = (result, self.instances.get_mut(&id)) {
                        instance.result = Some(value);
                    }
                }),
            ActivityKind::Native(body) => self.invoke(id, |executor| {
                body.execute(&mut NativeActivityContext::new(executor, id))
            }),
            ActivityKind::Async(body) => {
                let operation = self.begin_async(id);
                self.invoke(id, |executor| {
                    body.begin_execute(&mut AsyncCodeActivityContext::new(executor, id), operation)
                })
            }
        };

        if completed.is_some() {
            if let Some(instance) = self.instances.get_mut(&id) {
                instance.executed = true;
            }
            self.try_complete(id);
        }
    }

    fn try_complete(&mut self, id: InstanceId) {
        let ready = self
            .instances
            .get(&id)
            .map(|i| i.can_complete())
            .unwrap_or(false);
        if ready {
            self.complete_instance(id);
        }
    }

    fn complete_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        let state = if instance.marked_canceled {
            ActivityInstanceState::Canceled
        } else {
            ActivityInstanceState::Closed
        };
        instance.state = state;
        let parent = instance.parent;

        // Only non-blocking bookmarks can remain at this point
        self.bookmarks.remove_all_owned_by(id);
        self.bookmarks.remove_scopes_owned_by(id);

        tracing::debug!(workflow = %self.workflow_id, instance = %id, ?state, "activity completed");
        self.track_state(id, state);

        match parent {
            Some(parent) => self.queue.push(WorkItem::CompletionCallback { parent, child: id }),
            None => self.finish_workflow(),
        }
    }

    fn deliver_completion(&mut self, parent: InstanceId, child: InstanceId) {
        let Some(child_instance) = self.instances.remove(&child) else {
            return;
        };
        let parent_live = self
            .instances
            .get(&parent)
            .map(|p| p.state.is_live())
            .unwrap_or(false);
        if !parent_live {
            tracing::trace!(
                workflow = %self.workflow_id,
                parent = %parent,
                child = %child,
                "completion for inactive parent dropped"
            );
            return;
        }
        if let Some(parent_instance) = self.instances.get_mut(&parent) {
            parent_instance.children.retain(|c| *c != child);
            parent_instance.decrement_busy();
        }

        if child_instance.state == ActivityInstanceState::Closed {
            self.copy_out_arguments(parent, &child_instance);
        }

        if let Some(callback) = &child_instance.completion_callback {
            if let Some(ActivityKind::Native(body)) = self.kind_of(parent) {
                let completed = CompletedChild {
                    instance: child,
                    activity: child_instance.activity,
                    state: child_instance.state,
                    result: child_instance.result.clone(),
                    fault: child_instance.fault.clone(),
                };
                let delivered = self.invoke(parent, |executor| {
                    body.on_child_completed(
                        &mut NativeActivityContext::new(executor, parent),
                        callback,
                        &completed,
                    )
                });
                if delivered.is_none() {
                    return;
                }
            }
        }
        self.try_complete(parent);
    }

    fn copy_out_arguments(&mut self, parent: InstanceId, child: &ActivityInstance) {
        let definition = Arc::clone(&self.definition);
        for argument in &definition.node(child.activity).arguments {
            if !argument.direction.is_output() {
                continue;
            }
            let ArgumentBinding::Variable(target) = &argument.binding else {
                continue;
            };
            let Some(value) = child.environment.get(&argument.name).cloned() else {
                continue;
            };
            let written = self
                .resolve_location(parent, target)
                .and_then(|owner| self.instances.get_mut(&owner))
                .map(|owner| owner.environment.set(target, value))
                .unwrap_or(false);
            if !written {
                tracing::warn!(
                    workflow = %self.workflow_id,
                    argument = %argument.name,
                    target = %target,
                    "out argument target is not visible"
                );
            }
        }
    }

    fn fault_instance(&mut self, id: InstanceId, fault: FaultInfo) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        if instance.state.is_terminal() {
            return;
        }
        instance.state = ActivityInstanceState::Faulting;
        let children = std::mem::take(&mut instance.children);
        for child in children {
            self.abort_subtree(child, &fault);
        }
        self.release_resources(id);

        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        instance.state = ActivityInstanceState::Faulted;
        instance.busy_count = 0;
        instance.fault = Some(fault.clone());
        let parent = instance.parent;
        let fault_callback = instance.fault_callback.clone();
        self.track_state(id, ActivityInstanceState::Faulted);

        match (parent, fault_callback) {
            (None, _) => {
                self.track_fault(&fault, None);
                self.finish_workflow();
            }
            (Some(parent), Some(callback)) => {
                self.track_fault(&fault, Some(parent));
                self.queue.push(WorkItem::FaultCallback {
                    handler: parent,
                    child: id,
                    callback,
                    fault,
                });
            }
            (Some(parent), None) => self.fault_instance(parent, fault),
        }
    }

    fn track_fault(&mut self, fault: &FaultInfo, handler: Option<InstanceId>) {
        if !self.tracking.is_active() {
            return;
        }
        let node = self.definition.node(fault.source_activity());
        let source = ActivityInfo {
            instance: fault.source(),
            activity_path: node.path.clone(),
            name: fault.source_name().to_string(),
        };
        let handler = handler.and_then(|h| self.activity_info(h));
        self.track(TrackingEvent::FaultPropagated {
            source,
            handler,
            message: format!("{:#}", fault.error()),
        });
    }

    /// Tear down a subtree because an ancestor faulted, children first
    fn abort_subtree(&mut self, id: InstanceId, fault: &FaultInfo) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        let children = instance.children.clone();
        let terminal = instance.state.is_terminal();
        for child in children {
            self.abort_subtree(child, fault);
        }
        if !terminal {
            self.release_resources(id);
            if let Some(kind) = self.kind_of(id) {
                self.call_abort_hook(id, kind, fault);
            }
            self.track_state(id, ActivityInstanceState::Faulted);
            tracing::debug!(workflow = %self.workflow_id, instance = %id, "activity aborted");
        }
        self.instances.remove(&id);
    }

    fn call_abort_hook(&self, id: InstanceId, kind: ActivityKind, reason: &FaultInfo) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            ActivityKind::Native(body) => body.abort(reason),
            ActivityKind::Async(body) => body.abort(reason),
            ActivityKind::Code(_) => {}
        }));
        if let Err(payload) = outcome {
            tracing::warn!(
                workflow = %self.workflow_id,
                instance = %id,
                "abort hook panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    fn release_resources(&mut self, id: InstanceId) {
        self.bookmarks.remove_all_owned_by(id);
        self.bookmarks.remove_scopes_owned_by(id);
        self.async_ops.retain(|_, owner| *owner != id);
    }

    fn deliver_fault(
        &mut self,
        handler: InstanceId,
        child: InstanceId,
        callback: super::activity::CallbackTag,
        fault: FaultInfo,
    ) {
        let handler_live = self
            .instances
            .get(&handler)
            .map(|h| h.state.is_live())
            .unwrap_or(false);
        if !handler_live {
            tracing::trace!(
                workflow = %self.workflow_id,
                handler = %handler,
                "fault for inactive handler dropped"
            );
            return;
        }
        let Some(ActivityKind::Native(body)) = self.kind_of(handler) else {
            self.fault_instance(handler, fault);
            return;
        };

        let context = FaultContext {
            fault: fault.clone(),
            faulted_child: child,
            faulted_child_activity: self
                .instances
                .get(&child)
                .map(|c| c.activity)
                .unwrap_or_else(|| fault.source_activity()),
        };
        let handling = self.invoke(handler, |executor| {
            body.on_child_faulted(
                &mut NativeActivityContext::new(executor, handler),
                &callback,
                &context,
            )
        });
        match handling {
            None => {}
            Some(FaultHandling::Handled) => {
                tracing::debug!(
                    workflow = %self.workflow_id,
                    handler = %handler,
                    child = %child,
                    "fault handled"
                );
                self.queue
                    .push(WorkItem::CompletionCallback { parent: handler, child });
            }
            Some(FaultHandling::Propagate) => self.fault_instance(handler, fault),
        }
    }

    fn cancel_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        if !instance.state.is_live() || instance.cancel_requested {
            return;
        }
        instance.cancel_requested = true;

        if !instance.executed {
            // Never ran: nothing can be outstanding
            instance.executed = true;
            instance.marked_canceled = true;
            tracing::debug!(
                workflow = %self.workflow_id,
                instance = %id,
                "canceled before execution"
            );
            self.complete_instance(id);
            return;
        }

        instance.state = ActivityInstanceState::Canceling;
        tracing::debug!(workflow = %self.workflow_id, instance = %id, "activity canceling");
        self.track_state(id, ActivityInstanceState::Canceling);

        let Some(kind) = self.kind_of(id) else {
            return;
        };
        match kind {
            ActivityKind::Code(_) => {}
            ActivityKind::Native(body) => {
                let canceled = self.invoke(id, |executor| {
                    body.cancel(&mut NativeActivityContext::new(executor, id))
                });
                if canceled.is_none() {
                    return;
                }
            }
            ActivityKind::Async(body) => {
                let canceled = self.invoke(id, |executor| {
                    body.cancel(&mut AsyncCodeActivityContext::new(executor, id))
                });
                if canceled.is_none() {
                    return;
                }
                let marked = self
                    .instances
                    .get(&id)
                    .map(|i| i.marked_canceled)
                    .unwrap_or(false);
                if marked {
                    self.abandon_async(id);
                }
            }
        }
        self.try_complete(id);
    }

    fn deliver_resumption(
        &mut self,
        owner: InstanceId,
        bookmark: Bookmark,
        callback: Option<super::activity::CallbackTag>,
        value: Value,
        releases_owner: bool,
    ) {
        let live = self
            .instances
            .get(&owner)
            .map(|i| i.state.is_live())
            .unwrap_or(false);
        if !live {
            tracing::warn!(
                workflow = %self.workflow_id,
                bookmark = %bookmark,
                owner = %owner,
                "resumption for inactive owner dropped"
            );
            return;
        }
        if releases_owner {
            if let Some(instance) = self.instances.get_mut(&owner) {
                instance.decrement_busy();
            }
        }
        if self.tracking.is_active() {
            if let Some(info) = self.activity_info(owner) {
                self.track(TrackingEvent::BookmarkResumed {
                    bookmark: bookmark.clone(),
                    owner: info,
                });
            }
        }

        if let Some(callback) = callback {
            if let Some(ActivityKind::Native(body)) = self.kind_of(owner) {
                let delivered = self.invoke(owner, |executor| {
                    body.on_bookmark_resumed(
                        &mut NativeActivityContext::new(executor, owner),
                        &callback,
                        &bookmark,
                        value,
                    )
                });
                if delivered.is_none() {
                    return;
                }
            }
        }
        self.try_complete(owner);
    }

    fn complete_async(&mut self, operation: AsyncOperationId, result: anyhow::Result<Value>) {
        let Some(owner) = self.async_ops.remove(&operation) else {
            tracing::debug!(
                workflow = %self.workflow_id,
                operation = %operation,
                "late async completion ignored"
            );
            return;
        };
        let live = self
            .instances
            .get(&owner)
            .map(|i| i.state.is_live())
            .unwrap_or(false);
        if !live {
            return;
        }
        if let Some(instance) = self.instances.get_mut(&owner) {
            instance.decrement_busy();
        }

        match result {
            Ok(value) => {
                let Some(ActivityKind::Async(body)) = self.kind_of(owner) else {
                    return;
                };
                let ended = self.invoke(owner, |executor| {
                    body.end_execute(&mut CodeActivityContext::new(executor, owner), value)
                });
                match ended {
                    Some(result) => {
                        if let (Some(value), Some(instance)) =
                            (result, self.instances.get_mut(&owner))
                        {
                            instance.result = Some(value);
                        }
                    }
                    None => return,
                }
            }
            Err(error) => {
                self.raise_fault(owner, error);
                return;
            }
        }
        self.try_complete(owner);
    }

    fn finish_workflow(&mut self) {
        let Some(root) = self.instances.get(&self.root) else {
            return;
        };
        let (state, outcome, tracked) = match root.state {
            ActivityInstanceState::Closed => (
                WorkflowState::Closed,
                RunOutcome::Completed {
                    result: root.result.clone(),
                    outputs: self.collect_outputs(),
                },
                WorkflowTrackingState::Completed,
            ),
            ActivityInstanceState::Canceled => (
                WorkflowState::Canceled,
                RunOutcome::Canceled,
                WorkflowTrackingState::Canceled,
            ),
            ActivityInstanceState::Faulted => {
                let Some(fault) = root.fault.clone() else {
                    return;
                };
                let tracked = if fault.is_termination() {
                    WorkflowTrackingState::Terminated
                } else {
                    WorkflowTrackingState::Faulted
                };
                (WorkflowState::Faulted, RunOutcome::Faulted(fault), tracked)
            }
            _ => return,
        };

        self.queue.clear();
        self.async_ops.clear();
        self.state = state;
        self.outcome = Some(outcome);
        tracing::info!(workflow = %self.workflow_id, ?state, "workflow completed");
        self.track_workflow(tracked);
    }

    fn collect_outputs(&self) -> BTreeMap<String, Value> {
        let Some(root) = self.instances.get(&self.root) else {
            return BTreeMap::new();
        };
        self.definition
            .root()
            .arguments
            .iter()
            .filter(|argument| argument.direction.is_output())
            .filter_map(|argument| {
                root.environment
                    .get(&argument.name)
                    .map(|value| (argument.name.clone(), value.clone()))
            })
            .collect()
    }

    // Host control

    /// Request cancellation of the whole workflow; takes effect on the next run
    ///
    /// A workflow whose root never executed closes as Canceled right away.
    pub fn cancel_workflow(&mut self) -> ContractResult<()> {
        self.ensure_accepting()?;
        let root_executed = self
            .instances
            .get(&self.root)
            .map(|root| root.executed)
            .unwrap_or(true);
        if !root_executed {
            // Nothing ran yet: the root closes as Canceled without executing
            self.announce_lifecycle();
            self.cancel_instance(self.root);
            tracing::info!(workflow = %self.workflow_id, "workflow canceled before running");
            return Ok(());
        }
        self.queue.push(WorkItem::Cancel {
            instance: self.root,
        });
        self.state = WorkflowState::Runnable;
        tracing::info!(workflow = %self.workflow_id, "workflow cancel requested");
        Ok(())
    }

    /// Fault the workflow immediately with a termination reason
    pub fn terminate(&mut self, reason: impl Into<String>) -> ContractResult<()> {
        self.ensure_accepting()?;
        let reason = reason.into();
        let name = self.definition.root().display_name.clone();
        let fault = FaultInfo::terminated(reason.clone(), self.root, ActivityId::ROOT, name);
        tracing::info!(workflow = %self.workflow_id, reason = %reason, "workflow terminated");
        self.fault_instance(self.root, fault);
        Ok(())
    }

    /// Tear the workflow down without completing it
    ///
    /// Abort hooks run for every live instance; the executor refuses to run
    /// afterwards.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.state == WorkflowState::Aborted {
            return;
        }
        let reason = reason.into();
        let name = self.definition.root().display_name.clone();
        let fault = FaultInfo::new(
            anyhow::anyhow!("workflow aborted: {}", reason),
            self.root,
            ActivityId::ROOT,
            name,
        );

        let live: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.id)
            .collect();
        for id in live.into_iter().rev() {
            if let Some(kind) = self.kind_of(id) {
                self.call_abort_hook(id, kind, &fault);
            }
        }

        self.queue.clear();
        self.bookmarks = BookmarkManager::new();
        self.async_ops.clear();
        self.instances.clear();
        self.state = WorkflowState::Aborted;
        tracing::warn!(workflow = %self.workflow_id, reason = %reason, "workflow aborted");
        self.track_workflow(WorkflowTrackingState::Aborted);
    }

    fn ensure_accepting(&self) -> ContractResult<()> {
        self.ensure_not_aborted()?;
        if self.state.is_completed() {
            return Err(ContractViolation::WorkflowCompleted(self.workflow_id));
        }
        Ok(())
    }

    // Persistence

    /// Capture the live instance graph
    ///
    /// Only valid when nothing is runnable and no asynchronous operation is
    /// outstanding.
    pub fn snapshot(&self) -> EngineResult<WorkflowSnapshot> {
        Ok(instance_map::capture(self)?)
    }

    /// Persist to an instance store, keeping the instance locked to `owner`
    ///
    /// On failure the in-memory state is untouched.
    pub fn request_persist(
        &mut self,
        store: &dyn InstanceStore,
        owner: OwnerId,
        timeout: Duration,
    ) -> EngineResult<()> {
        self.save(store, owner, timeout, false)
    }

    pub(crate) fn save(
        &mut self,
        store: &dyn InstanceStore,
        owner: OwnerId,
        timeout: Duration,
        unlock: bool,
    ) -> EngineResult<()> {
        let snapshot = self.snapshot()?;
        let bytes = instance_map::encode_snapshot(&snapshot)?;
        let metadata = InstanceMetadata::from_snapshot(&snapshot);
        let complete = self.state.is_completed();

        store.try_command(
            InstanceCommand::SaveWorkflow {
                owner,
                instance: self.workflow_id,
                data: InstanceData { bytes, metadata },
                complete,
                unlock,
            },
            timeout,
        )?;

        self.persist_requested = false;
        tracing::info!(workflow = %self.workflow_id, complete, unlock, "workflow persisted");
        self.track_workflow(WorkflowTrackingState::Persisted);
        if unlock {
            self.track_workflow(WorkflowTrackingState::Unloaded);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("workflow_id", &self.workflow_id)
            .field("state", &self.state)
            .field("instances", &self.instances.len())
            .field("queued", &self.queue.len())
            .field("bookmarks", &self.bookmarks.len())
            .field("async_ops", &self.async_ops.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{
        Activity, Argument, CallbackTag, CodeActivity, NativeActivity, Variable,
    };
    use crate::runtime::context::CodeActivityContext;
    use crate::runtime::error::EngineError;
    use crate::runtime::tracking::RecordingParticipant;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Emit {
        label: &'static str,
        log: Log,
    }

    impl CodeActivity for Emit {
        fn execute(&self, _ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
            self.log.lock().push(self.label.to_string());
            Ok(Some(Value::symbol(self.label)))
        }
    }

    struct Fail;

    impl CodeActivity for Fail {
        fn execute(&self, _ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("boom")
        }
    }

    /// Schedules every child at once and records completions
    struct All {
        log: Log,
    }

    impl NativeActivity for All {
        fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
            for child in ctx.children() {
                ctx.schedule_activity(child, Some(CallbackTag::from("done")))?;
            }
            Ok(())
        }

        fn on_child_completed(
            &self,
            _ctx: &mut NativeActivityContext<'_>,
            _callback: &CallbackTag,
            child: &CompletedChild,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("done:{}", child.instance));
            Ok(())
        }
    }

    struct Wait;

    impl NativeActivity for Wait {
        fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> anyhow::Result<()> {
            ctx.create_bookmark("go", Some(CallbackTag::from("resumed")))?;
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

    struct SetOut;

    impl CodeActivity for SetOut {
        fn execute(&self, ctx: &mut CodeActivityContext<'_>) -> anyhow::Result<Option<Value>> {
            let input = ctx.argument("input")?;
            ctx.set_argument("output", input)?;
            Ok(None)
        }
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn executor(root: Activity) -> ActivityExecutor {
        let definition = WorkflowDefinition::prepare(root);
        ActivityExecutor::new(WorkflowInstanceId::new(), definition, BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_children_complete_in_schedule_order() {
        let log = log();
        let root = Activity::native("all", All { log: log.clone() })
            .with_child(Activity::code("a", Emit { label: "a", log: log.clone() }))
            .with_child(Activity::code("b", Emit { label: "b", log: log.clone() }));

        let mut executor = executor(root);
        let outcome = executor.run().unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(*log.lock(), vec!["a", "b", "done:2", "done:3"]);
        assert_eq!(executor.state(), WorkflowState::Closed);
    }

    #[test]
    fn test_unhandled_fault_faults_workflow() {
        let log = log();
        let root = Activity::native("all", All { log: log.clone() })
            .with_child(Activity::code("bad", Fail));

        let mut executor = executor(root);
        match executor.run().unwrap() {
            RunOutcome::Faulted(fault) => {
                assert_eq!(fault.message(), "boom");
                assert_eq!(fault.source_name(), "bad");
            }
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_bookmark_idle_and_resume() {
        let mut executor = executor(Activity::native("wait", Wait));
        assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));
        assert_eq!(executor.bookmarks().len(), 1);

        let bookmark = Bookmark::new("go");
        assert_eq!(
            executor.resume_bookmark(&bookmark, Value::symbol("yes")),
            BookmarkResumptionResult::Success
        );
        assert_eq!(
            executor.resume_bookmark(&bookmark, Value::symbol("again")),
            BookmarkResumptionResult::NotFound
        );

        match executor.run().unwrap() {
            RunOutcome::Completed { result, .. } => assert_eq!(result, Some(Value::symbol("yes"))),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(
            executor.resume_bookmark(&bookmark, Value::symbol("late")),
            BookmarkResumptionResult::NotFound
        );
    }

    #[test]
    fn test_out_arguments_flow_to_parent_variable() {
        let root = Activity::native("all", All { log: log() })
            .with_variable(Variable::new("target"))
            .with_child(
                Activity::code("copy", SetOut)
                    .with_argument(Argument::input("input").bind_literal(Value::symbol("v")))
                    .with_argument(Argument::output("output").bind_variable("target")),
            );
        let mut executor = executor(root);
        executor.run().unwrap();

        let root = executor.instance(executor.root_id()).unwrap();
        assert_eq!(root.environment().get("target"), Some(&Value::symbol("v")));
    }

    #[test]
    fn test_cancel_idle_workflow() {
        let mut executor = executor(
            Activity::native("all", All { log: log() }).with_child(Activity::native("wait", Wait)),
        );
        assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));

        executor.cancel_workflow().unwrap();
        assert!(matches!(executor.run().unwrap(), RunOutcome::Canceled));
        assert!(executor.bookmarks().is_empty());
        assert!(executor.cancel_workflow().is_err());
    }

    #[test]
    fn test_terminate_reports_termination() {
        let mut executor = executor(Activity::native("wait", Wait));
        executor.run().unwrap();
        executor.terminate("operator").unwrap();

        match executor.run().unwrap() {
            RunOutcome::Faulted(fault) => assert!(fault.is_termination()),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_refuses_further_runs() {
        let mut executor = executor(Activity::native("wait", Wait));
        executor.run().unwrap();
        executor.abort("host shutdown");

        assert_eq!(executor.state(), WorkflowState::Aborted);
        assert!(executor.run().is_err());
        assert_eq!(
            executor.resume_bookmark(&Bookmark::new("go"), Value::symbol("x")),
            BookmarkResumptionResult::NotReady
        );
    }

    #[test]
    fn test_invalid_definition_refuses_to_start() {
        let child = Activity::code("child", Fail).with_argument(Argument::input("x").required());
        let root = Activity::code("root", Fail).with_child(child);
        let definition = WorkflowDefinition::prepare(root);
        let result = ActivityExecutor::new(WorkflowInstanceId::new(), definition, BTreeMap::new());
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_tracking_records_lifecycle() {
        let recorder = RecordingParticipant::new();
        let mut tracking = TrackingProvider::new();
        tracking.add_participant(recorder.clone());

        let mut executor = executor(Activity::code("emit", Emit { label: "x", log: log() }))
            .with_tracking(tracking);
        executor.run().unwrap();

        let events = recorder.events();
        assert_eq!(
            events.first(),
            Some(&TrackingEvent::WorkflowInstanceStateChanged {
                state: WorkflowTrackingState::Started
            })
        );
        assert_eq!(
            events.last(),
            Some(&TrackingEvent::WorkflowInstanceStateChanged {
                state: WorkflowTrackingState::Completed
            })
        );
    }
}
