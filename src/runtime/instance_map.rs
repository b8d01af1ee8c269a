//! Workflow snapshots: capture and reconstruction of the instance graph
//!
//! A snapshot flattens the live instance tree into records that refer to one
//! another through [`ActivityInstanceReference`]s instead of pointers. Records
//! are written depth-first from the root, so every parent precedes its
//! children and children appear in schedule order.
//!
//! On reload each record is materialized exactly once into an
//! [`ActivityInstanceMap`]; every reference (parent links, bookmark owners,
//! scope owners) is then resolved against that map, and any reference without
//! a target fails the load.
//!
//! Snapshots are encoded with the preserves packed format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::activity::CallbackTag;
use super::bookmark::{BookmarkManager, BookmarkOptions, BookmarkScope, Bookmark};
use super::definition::{ActivityId, WorkflowDefinition};
use super::error::{PersistenceError, PersistenceResult};
use super::executor::{ActivityExecutor, WorkflowState};
use super::fault::FaultInfo;
use super::instance::{
    ActivityInstance, ActivityInstanceState, Environment, InstanceId, WorkflowInstanceId,
};
use super::value::{NamedValue, PersistedValue};

/// Serialized pointer to another instance record in the same snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityInstanceReference(pub InstanceId);

/// Fault carried by a completed, faulted root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Rendered error chain
    pub message: String,
    /// Instance that raised the fault
    pub source: InstanceId,
    /// Definition path of the source
    pub source_path: String,
    /// Display name of the source
    pub source_name: String,
    /// Host termination
    pub terminated: bool,
}

/// One activity instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance id
    pub id: InstanceId,
    /// Definition path of the activity it runs
    pub activity_path: String,
    /// Parent record, none for the root
    pub parent: Option<ActivityInstanceReference>,
    /// Lifecycle state
    pub state: ActivityInstanceState,
    /// Declared variables and arguments
    pub environment: Vec<NamedValue>,
    /// Execution properties
    pub properties: Vec<NamedValue>,
    /// Outstanding work keeping the instance open
    pub busy_count: u32,
    /// Parent callback for completion
    pub completion_callback: Option<CallbackTag>,
    /// Parent callback for faults
    pub fault_callback: Option<CallbackTag>,
    /// Ambient bookmark scope
    pub bookmark_scope: BookmarkScope,
    /// Body has run
    pub executed: bool,
    /// Cancellation requested
    pub cancel_requested: bool,
    /// Body agreed to cancel
    pub marked_canceled: bool,
    /// Result value
    pub result: Option<PersistedValue>,
    /// Fault, for a faulted root
    pub fault: Option<FaultRecord>,
}

/// One pending bookmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    /// Bookmark name and scope
    pub bookmark: Bookmark,
    /// Owning instance
    pub owner: ActivityInstanceReference,
    /// Callback on the owner
    pub callback: Option<CallbackTag>,
    /// Registration options
    pub options: BookmarkOptions,
}

/// One named bookmark scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Scope id
    pub id: Uuid,
    /// Owning instance
    pub owner: ActivityInstanceReference,
}

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// When the snapshot was taken (informational only)
    pub created_at: DateTime<Utc>,
    /// Number of instance records
    pub instance_count: usize,
    /// Number of bookmark records
    pub bookmark_count: usize,
}

/// Serializable image of an idle or completed workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow instance id
    pub workflow_id: WorkflowInstanceId,
    /// Fingerprint of the definition the snapshot was taken from
    pub definition_fingerprint: String,
    /// Workflow-level state
    pub state: WorkflowState,
    /// Next instance id to allocate
    pub next_instance_id: u64,
    /// Next asynchronous operation id to allocate
    pub next_async_id: u64,
    /// Root record
    pub root: ActivityInstanceReference,
    /// Instances, depth-first from the root
    pub instances: Vec<InstanceRecord>,
    /// Pending bookmarks in (scope, name) order
    pub bookmarks: Vec<BookmarkRecord>,
    /// Named bookmark scopes
    pub scopes: Vec<ScopeRecord>,
    /// Metadata
    pub metadata: SnapshotMetadata,
}

/// Capture the executor's instance graph
pub(crate) fn capture(executor: &ActivityExecutor) -> PersistenceResult<WorkflowSnapshot> {
    if executor.state == WorkflowState::Aborted {
        return Err(PersistenceError::NotIdle("workflow was aborted".to_string()));
    }
    if !executor.queue.is_empty() {
        return Err(PersistenceError::NotIdle(format!(
            "{} work items queued",
            executor.queue.len()
        )));
    }
    if executor.state == WorkflowState::Runnable {
        return Err(PersistenceError::NotIdle(
            "workflow has not settled since it last ran".to_string(),
        ));
    }
    if !executor.async_ops.is_empty() {
        return Err(PersistenceError::AsyncOperationsOutstanding(
            executor.async_ops.len(),
        ));
    }

    let definition = &executor.definition;
    let mut instances = Vec::with_capacity(executor.instances.len());
    let mut pending = vec![executor.root];
    while let Some(id) = pending.pop() {
        let instance = executor
            .instances
            .get(&id)
            .ok_or(PersistenceError::UnresolvedReference(id))?;
        instances.push(record_instance(definition, instance));
        pending.extend(instance.children.iter().rev().copied());
    }
    if instances.len() != executor.instances.len() {
        return Err(PersistenceError::InvalidSnapshot(format!(
            "{} instances are not reachable from the root",
            executor.instances.len() - instances.len()
        )));
    }

    let bookmarks: Vec<BookmarkRecord> = executor
        .bookmarks
        .iter()
        .map(|registration| BookmarkRecord {
            bookmark: registration.bookmark.clone(),
            owner: ActivityInstanceReference(registration.owner),
            callback: registration.callback.clone(),
            options: registration.options,
        })
        .collect();
    let scopes = executor
        .bookmarks
        .scopes()
        .map(|(id, owner)| ScopeRecord {
            id: *id,
            owner: ActivityInstanceReference(*owner),
        })
        .collect();

    Ok(WorkflowSnapshot {
        workflow_id: executor.workflow_id,
        definition_fingerprint: definition.fingerprint().0.clone(),
        state: executor.state,
        next_instance_id: executor.next_instance_id,
        next_async_id: executor.next_async_id,
        root: ActivityInstanceReference(executor.root),
        metadata: SnapshotMetadata {
            created_at: Utc::now(),
            instance_count: instances.len(),
            bookmark_count: bookmarks.len(),
        },
        instances,
        bookmarks,
        scopes,
    })
}

fn record_instance(definition: &WorkflowDefinition, instance: &ActivityInstance) -> InstanceRecord {
    let named = |(name, value): (&String, &super::value::Value)| NamedValue {
        name: name.clone(),
        value: PersistedValue(value.clone()),
    };
    InstanceRecord {
        id: instance.id,
        activity_path: definition.node(instance.activity).path.clone(),
        parent: instance.parent.map(ActivityInstanceReference),
        state: instance.state,
        environment: instance.environment.iter().map(named).collect(),
        properties: instance.properties.iter().map(named).collect(),
        busy_count: instance.busy_count,
        completion_callback: instance.completion_callback.clone(),
        fault_callback: instance.fault_callback.clone(),
        bookmark_scope: instance.bookmark_scope,
        executed: instance.executed,
        cancel_requested: instance.cancel_requested,
        marked_canceled: instance.marked_canceled,
        result: instance.result.clone().map(PersistedValue),
        fault: instance.fault.as_ref().map(|fault| FaultRecord {
            message: format!("{:#}", fault.error()),
            source: fault.source(),
            source_path: definition.node(fault.source_activity()).path.clone(),
            source_name: fault.source_name().to_string(),
            terminated: fault.is_termination(),
        }),
    }
}

/// Instances materialized from records, each exactly once
#[derive(Debug, Default)]
pub struct ActivityInstanceMap {
    loaded: BTreeMap<InstanceId, ActivityInstance>,
}

impl ActivityInstanceMap {
    fn insert(&mut self, instance: ActivityInstance) -> PersistenceResult<()> {
        let id = instance.id;
        if self.loaded.insert(id, instance).is_some() {
            return Err(PersistenceError::DuplicateInstance(id));
        }
        Ok(())
    }

    /// Resolve a reference to a materialized instance
    pub fn resolve(
        &self,
        reference: &ActivityInstanceReference,
    ) -> PersistenceResult<&ActivityInstance> {
        self.loaded
            .get(&reference.0)
            .ok_or(PersistenceError::UnresolvedReference(reference.0))
    }

    fn resolve_mut(
        &mut self,
        reference: &ActivityInstanceReference,
    ) -> PersistenceResult<&mut ActivityInstance> {
        self.loaded
            .get_mut(&reference.0)
            .ok_or(PersistenceError::UnresolvedReference(reference.0))
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

/// Executor state rebuilt from a snapshot
pub(crate) struct RestoredGraph {
    pub(crate) workflow_id: WorkflowInstanceId,
    pub(crate) instances: BTreeMap<InstanceId, ActivityInstance>,
    pub(crate) root: InstanceId,
    pub(crate) next_instance_id: u64,
    pub(crate) next_async_id: u64,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) state: WorkflowState,
}

/// Rebuild the instance graph against `definition`
pub(crate) fn restore(
    definition: &WorkflowDefinition,
    snapshot: WorkflowSnapshot,
) -> PersistenceResult<RestoredGraph> {
    let found = definition.fingerprint().0.clone();
    if snapshot.definition_fingerprint != found {
        return Err(PersistenceError::DefinitionMismatch {
            expected: snapshot.definition_fingerprint,
            found,
        });
    }
    match snapshot.state {
        WorkflowState::Runnable | WorkflowState::Aborted => {
            return Err(PersistenceError::InvalidSnapshot(format!(
                "workflow state {:?} cannot be restored",
                snapshot.state
            )));
        }
        _ => {}
    }

    // First pass: materialize every record once
    let mut map = ActivityInstanceMap::default();
    let mut links = Vec::with_capacity(snapshot.instances.len());
    for record in snapshot.instances {
        if record.id.0 >= snapshot.next_instance_id {
            return Err(PersistenceError::InvalidSnapshot(format!(
                "instance {} is beyond the id counter {}",
                record.id, snapshot.next_instance_id
            )));
        }
        links.push((record.id, record.parent));
        map.insert(materialize(definition, record)?)?;
    }

    // Second pass: resolve parent references in record order
    for (id, parent) in &links {
        let Some(parent) = parent else {
            continue;
        };
        let child_activity = map.resolve(&ActivityInstanceReference(*id))?.activity;
        let parent_instance = map.resolve_mut(parent)?;
        if !definition.is_declared_child(parent_instance.activity, child_activity) {
            return Err(PersistenceError::InvalidSnapshot(format!(
                "instance {} does not run a declared child of instance {}",
                id, parent.0
            )));
        }
        parent_instance.children.push(*id);
    }

    let root = map.resolve(&snapshot.root)?;
    if root.parent.is_some() || root.activity != ActivityId::ROOT {
        return Err(PersistenceError::InvalidSnapshot(
            "root record does not run the root activity".to_string(),
        ));
    }
    let root = root.id;

    let mut bookmarks = BookmarkManager::new();
    for scope in snapshot.scopes {
        let owner = map.resolve(&scope.owner)?;
        bookmarks.restore_scope(scope.id, owner.id);
    }
    for record in snapshot.bookmarks {
        let owner = map.resolve(&record.owner)?;
        if !owner.state.is_live() {
            return Err(PersistenceError::InvalidSnapshot(format!(
                "bookmark '{}' is owned by {:?} instance {}",
                record.bookmark, owner.state, owner.id
            )));
        }
        bookmarks
            .register(record.bookmark, owner.id, record.callback, record.options)
            .map_err(|e| PersistenceError::InvalidSnapshot(e.to_string()))?;
    }

    Ok(RestoredGraph {
        workflow_id: snapshot.workflow_id,
        instances: map.loaded,
        root,
        next_instance_id: snapshot.next_instance_id,
        next_async_id: snapshot.next_async_id,
        bookmarks,
        state: snapshot.state,
    })
}

fn materialize(
    definition: &WorkflowDefinition,
    record: InstanceRecord,
) -> PersistenceResult<ActivityInstance> {
    let activity = definition
        .find_by_path(&record.activity_path)
        .ok_or_else(|| PersistenceError::UnknownActivityPath(record.activity_path.clone()))?;

    let mut environment = Environment::new();
    for named in record.environment {
        environment.declare(named.name, named.value.into_value());
    }
    let fault = match record.fault {
        Some(fault) => {
            let source_activity = definition
                .find_by_path(&fault.source_path)
                .ok_or_else(|| PersistenceError::UnknownActivityPath(fault.source_path.clone()))?;
            Some(FaultInfo::restored(
                fault.message,
                fault.source,
                source_activity,
                fault.source_name,
                fault.terminated,
            ))
        }
        None => None,
    };

    let mut instance = ActivityInstance::new(
        record.id,
        activity,
        record.parent.map(|p| p.0),
        record.bookmark_scope,
    );
    instance.state = record.state;
    instance.environment = environment;
    instance.properties = record
        .properties
        .into_iter()
        .map(|named| (named.name, named.value.into_value()))
        .collect();
    instance.busy_count = record.busy_count;
    instance.completion_callback = record.completion_callback;
    instance.fault_callback = record.fault_callback;
    instance.executed = record.executed;
    instance.cancel_requested = record.cancel_requested;
    instance.marked_canceled = record.marked_canceled;
    instance.result = record.result.map(PersistedValue::into_value);
    instance.fault = fault;
    Ok(instance)
}

/// Encode a snapshot with the preserves packed format
pub fn encode_snapshot(snapshot: &WorkflowSnapshot) -> PersistenceResult<Vec<u8>> {
    use preserves::PackedWriter;
    let mut buf = Vec::new();
    let mut writer = PackedWriter::new(&mut buf);
    preserves::serde::to_writer(&mut writer, snapshot)
        .map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    Ok(buf)
}

/// Decode a snapshot written by [`encode_snapshot`]
pub fn decode_snapshot(data: &[u8]) -> PersistenceResult<WorkflowSnapshot> {
    preserves::serde::from_bytes(data).map_err(|e| PersistenceError::Decoding(e.to_string()))
}
