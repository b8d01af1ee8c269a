//! Activity instances: the runtime instance tree
//!
//! One [`ActivityInstance`] exists per in-flight activation of an activity
//! definition node. Instances live in the executor's table keyed by
//! [`InstanceId`]; ownership flows root to children and the parent link is an
//! id used only for callback routing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::activity::CallbackTag;
use super::bookmark::BookmarkScope;
use super::definition::ActivityId;
use super::fault::FaultInfo;
use super::value::Value;

/// Identifier of a whole workflow instance (the unit of persistence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowInstanceId(pub Uuid);

impl WorkflowInstanceId {
    /// Create a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for WorkflowInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an activity instance, unique within its workflow
///
/// Ids are allocated sequentially and the counter is persisted, so a reloaded
/// workflow continues the same sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an activity instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    /// Running; the only state in which children may be scheduled
    Executing,
    /// Cancel requested, waiting for children to drain
    Canceling,
    /// Fault being applied to the subtree
    Faulting,
    /// Completed normally
    Closed,
    /// Completed through cancellation
    Canceled,
    /// Completed through a fault
    Faulted,
}

impl ActivityInstanceState {
    /// True for Closed, Canceled and Faulted
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActivityInstanceState::Closed
                | ActivityInstanceState::Canceled
                | ActivityInstanceState::Faulted
        )
    }

    /// True for states in which an instance may own bookmarks
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ActivityInstanceState::Executing | ActivityInstanceState::Canceling
        )
    }
}

/// Variable and argument values owned by one instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    locations: BTreeMap<String, Value>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare or overwrite a location
    pub fn declare(&mut self, name: impl Into<String>, value: Value) {
        self.locations.insert(name.into(), value);
    }

    /// True when the location is declared here
    pub fn contains(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    /// Read a location
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.locations.get(name)
    }

    /// Write an existing location; returns false when it is not declared here
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.locations.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Iterate over locations in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.locations.iter()
    }

    /// Number of locations
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// True when no location is declared
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// A resolved location: the instance whose environment declares `name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationReference {
    /// Instance that declares the location
    pub owner: InstanceId,
    /// Location name
    pub name: String,
}

/// One live activation of an activity definition
#[derive(Debug, Clone)]
pub struct ActivityInstance {
    pub(crate) id: InstanceId,
    pub(crate) activity: ActivityId,
    pub(crate) state: ActivityInstanceState,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) children: Vec<InstanceId>,
    pub(crate) environment: Environment,
    pub(crate) properties: BTreeMap<String, Value>,
    pub(crate) busy_count: u32,
    pub(crate) completion_callback: Option<CallbackTag>,
    pub(crate) fault_callback: Option<CallbackTag>,
    pub(crate) bookmark_scope: BookmarkScope,
    pub(crate) executed: bool,
    pub(crate) cancel_requested: bool,
    pub(crate) marked_canceled: bool,
    pub(crate) result: Option<Value>,
    pub(crate) fault: Option<FaultInfo>,
}

impl ActivityInstance {
    pub(crate) fn new(
        id: InstanceId,
        activity: ActivityId,
        parent: Option<InstanceId>,
        bookmark_scope: BookmarkScope,
    ) -> Self {
        Self {
            id,
            activity,
            state: ActivityInstanceState::Executing,
            parent,
            children: Vec::new(),
            environment: Environment::new(),
            properties: BTreeMap::new(),
            busy_count: 0,
            completion_callback: None,
            fault_callback: None,
            bookmark_scope,
            executed: false,
            cancel_requested: false,
            marked_canceled: false,
            result: None,
            fault: None,
        }
    }

    /// Instance id
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Definition node this instance runs
    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    /// Current state
    pub fn state(&self) -> ActivityInstanceState {
        self.state
    }

    /// Parent instance
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Children that have not yet been observed by this instance
    pub fn children(&self) -> &[InstanceId] {
        &self.children
    }

    /// Variables and arguments declared by this instance
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Outstanding children, blocking bookmarks and async operations
    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    /// Ambient bookmark scope
    pub fn bookmark_scope(&self) -> &BookmarkScope {
        &self.bookmark_scope
    }

    /// Whether cancellation was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Result value, if the body produced one
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Fault, for faulted instances
    pub fn fault(&self) -> Option<&FaultInfo> {
        self.fault.as_ref()
    }

    /// Ready to complete: body ran and nothing is outstanding
    pub(crate) fn can_complete(&self) -> bool {
        self.executed && self.busy_count == 0 && !self.state.is_terminal()
    }

    pub(crate) fn increment_busy(&mut self) {
        self.busy_count += 1;
    }

    pub(crate) fn decrement_busy(&mut self) {
        debug_assert!(self.busy_count > 0, "busy count underflow on {}", self.id);
        self.busy_count = self.busy_count.saturating_sub(1);
    }
}

/// What a parent observes when a child reaches a terminal state
#[derive(Debug, Clone)]
pub struct CompletedChild {
    /// Child instance id
    pub instance: InstanceId,
    /// Child definition node
    pub activity: ActivityId,
    /// Terminal state
    pub state: ActivityInstanceState,
    /// Result value for closed children
    pub result: Option<Value>,
    /// Fault for faulted children
    pub fault: Option<FaultInfo>,
}
