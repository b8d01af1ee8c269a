//! Capability-scoped handles handed to activity code
//!
//! A context borrows the executor mutably for the duration of one callback,
//! so it cannot outlive the work item that created it. The three flavors
//! expose different capabilities:
//! - [`CodeActivityContext`]: locations, arguments, extensions and properties
//! - [`AsyncCodeActivityContext`]: the above plus cancellation
//! - [`NativeActivityContext`]: the above plus scheduling and bookmarks
//!
//! The shared surface lives on [`ActivityContext`], which the three flavors
//! dereference to.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::activity::CallbackTag;
use super::bookmark::{Bookmark, BookmarkOptions, BookmarkResumptionResult, BookmarkScope};
use super::definition::ActivityId;
use super::error::{BookmarkResult, ContractResult, ContractViolation};
use super::executor::ActivityExecutor;
use super::instance::{InstanceId, LocationReference, WorkflowInstanceId};
use super::value::Value;
use super::work_item::WorkItemPriority;

pub use super::async_op::AsyncOperation;

/// Options for scheduling a child
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Callback invoked when the child reaches a terminal state
    pub on_completed: Option<CallbackTag>,
    /// Callback invoked when the child faults
    pub on_faulted: Option<CallbackTag>,
    /// Values for the child's In arguments, overriding their bindings
    pub arguments: BTreeMap<String, Value>,
    /// Ambient bookmark scope for the child (defaults to the parent's)
    pub scope: Option<BookmarkScope>,
}

impl ScheduleOptions {
    /// No callbacks, no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the completion callback
    pub fn on_completed(mut self, callback: impl Into<CallbackTag>) -> Self {
        self.on_completed = Some(callback.into());
        self
    }

    /// Set the fault callback
    pub fn on_faulted(mut self, callback: impl Into<CallbackTag>) -> Self {
        self.on_faulted = Some(callback.into());
        self
    }

    /// Supply an In argument
    pub fn argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    /// Run the child in a bookmark scope
    pub fn in_scope(mut self, scope: BookmarkScope) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// Operations available to every kind of activity
pub struct ActivityContext<'a> {
    pub(crate) executor: &'a mut ActivityExecutor,
    pub(crate) instance: InstanceId,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self { executor, instance }
    }

    /// Id of the running instance
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Id of the workflow instance
    pub fn workflow_id(&self) -> WorkflowInstanceId {
        self.executor.workflow_id()
    }

    /// Definition node of the running instance
    pub fn activity_id(&self) -> ActivityId {
        self.executor
            .instance(self.instance)
            .map(|i| i.activity())
            .unwrap_or(ActivityId::ROOT)
    }

    /// Display name of the running activity
    pub fn display_name(&self) -> &str {
        &self.executor.definition().node(self.activity_id()).display_name
    }

    /// Dotted path of the running activity
    pub fn activity_path(&self) -> &str {
        &self.executor.definition().node(self.activity_id()).path
    }

    /// Resolve a variable or argument by name through the environment chain
    pub fn location(&self, name: &str) -> ContractResult<LocationReference> {
        self.executor
            .resolve_location(self.instance, name)
            .map(|owner| LocationReference {
                owner,
                name: name.to_string(),
            })
            .ok_or_else(|| ContractViolation::UnknownLocation(name.to_string()))
    }

    /// Read a visible location by name
    pub fn get_value(&self, name: &str) -> ContractResult<Value> {
        let location = self.location(name)?;
        self.get(&location)
    }

    /// Write a visible location by name
    pub fn set_value(&mut self, name: &str, value: Value) -> ContractResult<()> {
        let location = self.location(name)?;
        self.set(&location, value)
    }

    /// Read through a location reference
    pub fn get(&self, location: &LocationReference) -> ContractResult<Value> {
        self.check_visible(location)?;
        self.executor
            .instance(location.owner)
            .and_then(|owner| owner.environment().get(&location.name))
            .cloned()
            .ok_or_else(|| ContractViolation::UnknownLocation(location.name.clone()))
    }

    /// Write through a location reference
    pub fn set(&mut self, location: &LocationReference, value: Value) -> ContractResult<()> {
        self.check_visible(location)?;
        let written = self
            .executor
            .instance_mut(location.owner)
            .map(|owner| owner.environment.set(&location.name, value))
            .unwrap_or(false);
        if written {
            Ok(())
        } else {
            Err(ContractViolation::UnknownLocation(location.name.clone()))
        }
    }

    fn check_visible(&self, location: &LocationReference) -> ContractResult<()> {
        if self.executor.is_ancestor_or_self(location.owner, self.instance) {
            Ok(())
        } else {
            Err(ContractViolation::UnknownLocation(location.name.clone()))
        }
    }

    /// Read an argument declared on this activity
    pub fn argument(&self, name: &str) -> ContractResult<Value> {
        let node = self.executor.definition().node(self.activity_id());
        if node.argument(name).is_none() {
            return Err(ContractViolation::UnknownArgument(name.to_string()));
        }
        self.executor
            .instance(self.instance)
            .and_then(|i| i.environment().get(name))
            .cloned()
            .ok_or_else(|| ContractViolation::UnknownArgument(name.to_string()))
    }

    /// Assign an Out or InOut argument declared on this activity
    pub fn set_argument(&mut self, name: &str, value: Value) -> ContractResult<()> {
        let direction = self
            .executor
            .definition()
            .node(self.activity_id())
            .argument(name)
            .map(|a| a.direction)
            .ok_or_else(|| ContractViolation::UnknownArgument(name.to_string()))?;
        if !direction.is_output() {
            return Err(ContractViolation::ReadOnlyArgument(name.to_string()));
        }
        match self.executor.instance_mut(self.instance) {
            Some(instance) => {
                instance.environment.declare(name, value);
                Ok(())
            }
            None => Err(ContractViolation::UnknownInstance(self.instance)),
        }
    }

    /// Typed service lookup
    pub fn get_extension<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.executor.extensions().get::<T>()
    }

    /// Find an execution property on this instance or the nearest ancestor
    pub fn find_property(&self, name: &str) -> Option<Value> {
        let mut current = Some(self.instance);
        while let Some(id) = current {
            let instance = self.executor.instance(id)?;
            if let Some(value) = instance.properties.get(name) {
                return Some(value.clone());
            }
            current = instance.parent();
        }
        None
    }
}

/// Context for [`CodeActivity`](super::activity::CodeActivity) bodies
pub struct CodeActivityContext<'a> {
    inner: ActivityContext<'a>,
}

impl<'a> CodeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self {
            inner: ActivityContext::new(executor, instance),
        }
    }
}

impl<'a> Deref for CodeActivityContext<'a> {
    type Target = ActivityContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for CodeActivityContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Context for [`AsyncCodeActivity`](super::activity::AsyncCodeActivity) bodies
pub struct AsyncCodeActivityContext<'a> {
    inner: ActivityContext<'a>,
}

impl<'a> AsyncCodeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self {
            inner: ActivityContext::new(executor, instance),
        }
    }

    /// Whether cancellation was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.executor.is_cancel_requested(self.inner.instance)
    }

    /// Acknowledge a cancel request; outstanding operations are abandoned
    pub fn mark_canceled(&mut self) -> ContractResult<()> {
        self.inner.executor.mark_canceled(self.inner.instance)
    }
}

impl<'a> Deref for AsyncCodeActivityContext<'a> {
    type Target = ActivityContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for AsyncCodeActivityContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Context for [`NativeActivity`](super::activity::NativeActivity) bodies
pub struct NativeActivityContext<'a> {
    inner: ActivityContext<'a>,
}

impl<'a> NativeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId) -> Self {
        Self {
            inner: ActivityContext::new(executor, instance),
        }
    }

    /// Declared children of the running activity, in declaration order
    pub fn children(&self) -> Vec<ActivityId> {
        self.inner
            .executor
            .definition()
            .node(self.inner.activity_id())
            .children
            .clone()
    }

    /// Child instances that have not completed yet, in schedule order
    pub fn child_instances(&self) -> Vec<InstanceId> {
        self.inner
            .executor
            .instance(self.inner.instance)
            .map(|i| i.children().to_vec())
            .unwrap_or_default()
    }

    /// Schedule a declared child with an optional completion callback
    pub fn schedule_activity(
        &mut self,
        child: ActivityId,
        on_completed: Option<CallbackTag>,
    ) -> ContractResult<InstanceId> {
        let options = ScheduleOptions {
            on_completed,
            ..ScheduleOptions::default()
        };
        self.schedule_activity_with(child, options)
    }

    /// Schedule a declared child
    pub fn schedule_activity_with(
        &mut self,
        child: ActivityId,
        options: ScheduleOptions,
    ) -> ContractResult<InstanceId> {
        self.inner
            .executor
            .schedule_child(self.inner.instance, child, options)
    }

    /// Request cancellation of one child instance
    pub fn cancel_child(&mut self, child: InstanceId) -> ContractResult<()> {
        self.inner.executor.cancel_child(self.inner.instance, child)
    }

    /// Request cancellation of every outstanding child instance
    pub fn cancel_children(&mut self) {
        self.inner.executor.cancel_children(self.inner.instance);
    }

    /// Whether cancellation was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.executor.is_cancel_requested(self.inner.instance)
    }

    /// Acknowledge a cancel request; the instance closes as Canceled
    pub fn mark_canceled(&mut self) -> ContractResult<()> {
        self.inner.executor.mark_canceled(self.inner.instance)
    }

    /// Create a one-shot blocking bookmark in the ambient scope
    pub fn create_bookmark(
        &mut self,
        name: impl Into<String>,
        callback: Option<CallbackTag>,
    ) -> BookmarkResult<Bookmark> {
        self.create_bookmark_with(name, callback, BookmarkOptions::none())
    }

    /// Create a bookmark in the ambient scope
    pub fn create_bookmark_with(
        &mut self,
        name: impl Into<String>,
        callback: Option<CallbackTag>,
        options: BookmarkOptions,
    ) -> BookmarkResult<Bookmark> {
        let scope = self
            .inner
            .executor
            .instance(self.inner.instance)
            .map(|i| *i.bookmark_scope())
            .unwrap_or(BookmarkScope::Default);
        self.create_bookmark_in_scope(name, scope, callback, options)
    }

    /// Create a bookmark in an explicit scope
    pub fn create_bookmark_in_scope(
        &mut self,
        name: impl Into<String>,
        scope: BookmarkScope,
        callback: Option<CallbackTag>,
        options: BookmarkOptions,
    ) -> BookmarkResult<Bookmark> {
        self.inner.executor.create_bookmark(
            self.inner.instance,
            Bookmark::in_scope(name, scope),
            callback,
            options,
        )
    }

    /// Remove a bookmark owned by this instance
    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> bool {
        self.inner.executor.remove_bookmark(self.inner.instance, bookmark)
    }

    /// Remove every bookmark owned by this instance
    pub fn remove_all_bookmarks(&mut self) {
        self.inner.executor.remove_all_bookmarks(self.inner.instance);
    }

    /// Create a bookmark scope owned by this instance
    pub fn create_bookmark_scope(&mut self) -> ContractResult<BookmarkScope> {
        self.inner.executor.create_bookmark_scope(self.inner.instance)
    }

    /// Resume a bookmark from inside the workflow
    pub fn resume_bookmark(
        &mut self,
        bookmark: &Bookmark,
        value: Value,
    ) -> BookmarkResumptionResult {
        self.inner
            .executor
            .resume_bookmark_with_priority(bookmark, value, WorkItemPriority::Normal)
    }

    /// Set the result reported to the parent on completion
    pub fn set_result(&mut self, value: Value) {
        if let Some(instance) = self.inner.executor.instance_mut(self.inner.instance) {
            instance.result = Some(value);
        }
    }

    /// Add an execution property visible to descendants
    pub fn add_property(&mut self, name: impl Into<String>, value: Value) {
        if let Some(instance) = self.inner.executor.instance_mut(self.inner.instance) {
            instance.properties.insert(name.into(), value);
        }
    }

    /// Remove an execution property from this instance
    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.inner
            .executor
            .instance_mut(self.inner.instance)
            .and_then(|instance| instance.properties.remove(name))
    }

    /// Ask the host to persist at the next idle point
    pub fn request_persist(&mut self) {
        self.inner.executor.set_persist_requested();
    }
}

impl<'a> Deref for NativeActivityContext<'a> {
    type Target = ActivityContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for NativeActivityContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
