//! Instance stores: durable homes for persisted workflows
//!
//! The engine talks to storage through one command-based trait,
//! [`InstanceStore`]. Every command carries a timeout and either completes or
//! fails with a [`StoreError`]; the engine never retries.
//!
//! Ownership: a host registers itself as a workflow owner and saves or loads
//! instances under that owner. An instance stays locked to the owner that last
//! saved or loaded it until it is saved with `unlock` or `complete`, or the
//! owner is deleted.
//!
//! Two providers are included:
//! - [`MemoryInstanceStore`] for tests and embedded hosts
//! - [`FileInstanceStore`], which keeps a JSON index and one packed snapshot
//!   per instance under a storage root

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::executor::WorkflowState;
use super::instance::WorkflowInstanceId;
use super::instance_map::WorkflowSnapshot;
use super::storage::StoreLayout;

/// Identity of a host registered with a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    /// Create a new random owner id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queryable summary saved alongside a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// Fingerprint of the definition the instance runs
    pub definition_fingerprint: String,
    /// Workflow-level state at save time
    pub state: WorkflowState,
    /// Names of pending bookmarks
    pub bookmarks: Vec<String>,
    /// Number of live instances
    pub instance_count: usize,
    /// Save time
    pub saved_at: DateTime<Utc>,
}

impl InstanceMetadata {
    /// Summarize a snapshot
    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Self {
        Self {
            definition_fingerprint: snapshot.definition_fingerprint.clone(),
            state: snapshot.state,
            bookmarks: snapshot
                .bookmarks
                .iter()
                .map(|record| record.bookmark.to_string())
                .collect(),
            instance_count: snapshot.instances.len(),
            saved_at: Utc::now(),
        }
    }
}

/// Encoded snapshot plus its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceData {
    /// Packed snapshot bytes
    pub bytes: Vec<u8>,
    /// Summary
    pub metadata: InstanceMetadata,
}

/// Store commands
#[derive(Debug, Clone)]
pub enum InstanceCommand {
    /// Register a host as an owner
    CreateWorkflowOwner {
        /// Human-readable owner name
        name: String,
    },
    /// Remove an owner, releasing every lock it holds
    DeleteWorkflowOwner {
        /// Owner to remove
        owner: OwnerId,
    },
    /// Save an instance
    SaveWorkflow {
        /// Saving owner
        owner: OwnerId,
        /// Instance id
        instance: WorkflowInstanceId,
        /// Snapshot and metadata
        data: InstanceData,
        /// The workflow has completed; no further saves or loads are accepted
        complete: bool,
        /// Release the owner's lock after saving
        unlock: bool,
    },
    /// Load an instance and lock it to the owner
    LoadWorkflow {
        /// Loading owner
        owner: OwnerId,
        /// Instance id
        instance: WorkflowInstanceId,
    },
}

impl InstanceCommand {
    /// Command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            InstanceCommand::CreateWorkflowOwner { .. } => "CreateWorkflowOwner",
            InstanceCommand::DeleteWorkflowOwner { .. } => "DeleteWorkflowOwner",
            InstanceCommand::SaveWorkflow { .. } => "SaveWorkflow",
            InstanceCommand::LoadWorkflow { .. } => "LoadWorkflow",
        }
    }
}

/// Successful command result
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// New owner id
    OwnerCreated(OwnerId),
    /// Owner removed
    OwnerDeleted,
    /// Instance saved
    Saved,
    /// Instance loaded
    Loaded(InstanceData),
}

impl CommandOutcome {
    /// The loaded data, for `LoadWorkflow`
    pub fn into_loaded(self) -> Option<InstanceData> {
        match self {
            CommandOutcome::Loaded(data) => Some(data),
            _ => None,
        }
    }

    /// The new owner, for `CreateWorkflowOwner`
    pub fn into_owner(self) -> Option<OwnerId> {
        match self {
            CommandOutcome::OwnerCreated(owner) => Some(owner),
            _ => None,
        }
    }
}

/// Durable instance storage
pub trait InstanceStore: Send + Sync {
    /// Execute one command within `timeout`
    fn try_command(
        &self,
        command: InstanceCommand,
        timeout: Duration,
    ) -> StoreResult<CommandOutcome>;
}

/// Register an owner and return its id
pub fn create_owner(
    store: &dyn InstanceStore,
    name: impl Into<String>,
    timeout: Duration,
) -> StoreResult<OwnerId> {
    store
        .try_command(InstanceCommand::CreateWorkflowOwner { name: name.into() }, timeout)?
        .into_owner()
        .ok_or_else(|| StoreError::Storage("store did not return an owner".to_string()))
}

/// A registered owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    /// Name supplied at registration
    pub name: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

/// Lock and completion state of one stored instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
    /// Owner holding the lock
    pub locked_by: Option<OwnerId>,
    /// Saved with the complete flag
    pub complete: bool,
    /// Summary of the last save
    pub metadata: InstanceMetadata,
}

/// Owner and lock bookkeeping shared by the store providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreIndex {
    /// Registered owners
    pub owners: BTreeMap<OwnerId, OwnerRecord>,
    /// Stored instances
    pub instances: BTreeMap<WorkflowInstanceId, InstanceEntry>,
}

impl StoreIndex {
    fn create_owner(&mut self, name: String) -> OwnerId {
        let owner = OwnerId::new();
        self.owners.insert(
            owner,
            OwnerRecord {
                name,
                created_at: Utc::now(),
            },
        );
        owner
    }

    fn delete_owner(&mut self, owner: OwnerId) -> StoreResult<()> {
        self.owners
            .remove(&owner)
            .ok_or(StoreError::OwnerNotFound(owner))?;
        for entry in self.instances.values_mut() {
            if entry.locked_by == Some(owner) {
                entry.locked_by = None;
            }
        }
        Ok(())
    }

    fn ensure_owner(&self, owner: OwnerId) -> StoreResult<()> {
        if !self.owners.contains_key(&owner) {
            return Err(StoreError::OwnerNotFound(owner));
        }
        Ok(())
    }

    fn check_access(&self, owner: OwnerId, instance: WorkflowInstanceId) -> StoreResult<()> {
        let Some(entry) = self.instances.get(&instance) else {
            return Ok(());
        };
        if entry.complete {
            return Err(StoreError::InstanceCompleted(instance));
        }
        match entry.locked_by {
            Some(holder) if holder != owner => Err(StoreError::InstanceLocked {
                instance,
                owner: holder,
            }),
            _ => Ok(()),
        }
    }

    /// Validate and record a save; the caller writes the payload
    fn save(
        &mut self,
        owner: OwnerId,
        instance: WorkflowInstanceId,
        metadata: InstanceMetadata,
        complete: bool,
        unlock: bool,
    ) -> StoreResult<()> {
        self.ensure_owner(owner)?;
        self.check_access(owner, instance)?;
        let locked_by = if unlock || complete { None } else { Some(owner) };
        self.instances.insert(
            instance,
            InstanceEntry {
                locked_by,
                complete,
                metadata,
            },
        );
        Ok(())
    }

    /// Validate and record a load; the caller reads the payload
    fn load(
        &mut self,
        owner: OwnerId,
        instance: WorkflowInstanceId,
    ) -> StoreResult<InstanceMetadata> {
        self.ensure_owner(owner)?;
        if !self.instances.contains_key(&instance) {
            return Err(StoreError::InstanceNotFound(instance));
        }
        self.check_access(owner, instance)?;
        let entry = self
            .instances
            .get_mut(&instance)
            .ok_or(StoreError::InstanceNotFound(instance))?;
        entry.locked_by = Some(owner);
        Ok(entry.metadata.clone())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    index: StoreIndex,
    payloads: HashMap<WorkflowInstanceId, Vec<u8>>,
    failures: VecDeque<StoreError>,
}

/// In-memory instance store
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    state: Mutex<MemoryState>,
}

impl MemoryInstanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next command fail with `error`
    pub fn inject_failure(&self, error: StoreError) {
        self.state.lock().failures.push_back(error);
    }

    /// Current lock and completion state of every stored instance
    pub fn entries(&self) -> BTreeMap<WorkflowInstanceId, InstanceEntry> {
        self.state.lock().index.instances.clone()
    }

    /// Packed snapshot of a stored instance
    pub fn snapshot_bytes(&self, instance: WorkflowInstanceId) -> Option<Vec<u8>> {
        self.state.lock().payloads.get(&instance).cloned()
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn try_command(
        &self,
        command: InstanceCommand,
        timeout: Duration,
    ) -> StoreResult<CommandOutcome> {
        let mut state = self
            .state
            .try_lock_for(timeout)
            .ok_or(StoreError::Timeout(timeout))?;
        if let Some(error) = state.failures.pop_front() {
            tracing::debug!(command = command.name(), "injected store failure: {}", error);
            return Err(error);
        }

        tracing::trace!(command = command.name(), "memory store command");
        match command {
            InstanceCommand::CreateWorkflowOwner { name } => {
                Ok(CommandOutcome::OwnerCreated(state.index.create_owner(name)))
            }
            InstanceCommand::DeleteWorkflowOwner { owner } => {
                state.index.delete_owner(owner)?;
                Ok(CommandOutcome::OwnerDeleted)
            }
            InstanceCommand::SaveWorkflow {
                owner,
                instance,
                data,
                complete,
                unlock,
            } => {
                state
                    .index
                    .save(owner, instance, data.metadata, complete, unlock)?;
                state.payloads.insert(instance, data.bytes);
                Ok(CommandOutcome::Saved)
            }
            InstanceCommand::LoadWorkflow { owner, instance } => {
                let metadata = state.index.load(owner, instance)?;
                let bytes = state
                    .payloads
                    .get(&instance)
                    .cloned()
                    .ok_or(StoreError::InstanceNotFound(instance))?;
                Ok(CommandOutcome::Loaded(InstanceData { bytes, metadata }))
            }
        }
    }
}

/// File-backed instance store
///
/// Keeps the owner and lock index as JSON and one packed snapshot per
/// instance; see [`StoreLayout`] for the file layout.
#[derive(Debug)]
pub struct FileInstanceStore {
    layout: StoreLayout,
    lock: Mutex<()>,
}

impl FileInstanceStore {
    /// Open a store, creating its directories when missing
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let layout = StoreLayout::new(root);
        layout.init().map_err(storage_error)?;
        Ok(Self {
            layout,
            lock: Mutex::new(()),
        })
    }

    /// Directory layout of this store
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Read the index
    pub fn index(&self) -> StoreResult<StoreIndex> {
        let index = self
            .layout
            .read_json(&self.layout.index_path())
            .map_err(storage_error)?;
        Ok(index.unwrap_or_default())
    }

    fn write_index(&self, index: &StoreIndex) -> StoreResult<()> {
        self.layout
            .write_json(&self.layout.index_path(), index)
            .map_err(storage_error)
    }

    /// Stored instances with their lock state
    pub fn list_instances(&self) -> StoreResult<Vec<(WorkflowInstanceId, InstanceEntry)>> {
        Ok(self.index()?.instances.into_iter().collect())
    }

    /// Registered owners
    pub fn list_owners(&self) -> StoreResult<Vec<(OwnerId, OwnerRecord)>> {
        Ok(self.index()?.owners.into_iter().collect())
    }

    /// Packed snapshot of a stored instance, without taking its lock
    pub fn read_snapshot_bytes(&self, instance: WorkflowInstanceId) -> StoreResult<Vec<u8>> {
        self.layout
            .read_snapshot(instance)
            .map_err(storage_error)?
            .ok_or(StoreError::InstanceNotFound(instance))
    }
}

impl InstanceStore for FileInstanceStore {
    fn try_command(
        &self,
        command: InstanceCommand,
        timeout: Duration,
    ) -> StoreResult<CommandOutcome> {
        let _guard = self
            .lock
            .try_lock_for(timeout)
            .ok_or(StoreError::Timeout(timeout))?;
        let mut index = self.index()?;

        tracing::debug!(command = command.name(), root = ?self.layout.root(), "file store command");
        let outcome = match command {
            InstanceCommand::CreateWorkflowOwner { name } => {
                CommandOutcome::OwnerCreated(index.create_owner(name))
            }
            InstanceCommand::DeleteWorkflowOwner { owner } => {
                index.delete_owner(owner)?;
                CommandOutcome::OwnerDeleted
            }
            InstanceCommand::SaveWorkflow {
                owner,
                instance,
                data,
                complete,
                unlock,
            } => {
                index.save(owner, instance, data.metadata, complete, unlock)?;
                self.layout
                    .write_snapshot(instance, &data.bytes)
                    .map_err(storage_error)?;
                CommandOutcome::Saved
            }
            InstanceCommand::LoadWorkflow { owner, instance } => {
                let metadata = index.load(owner, instance)?;
                let bytes = self.read_snapshot_bytes(instance)?;
                CommandOutcome::Loaded(InstanceData { bytes, metadata })
            }
        };

        // Loads take the lock, so every command rewrites the index
        self.write_index(&index)?;
        Ok(outcome)
    }
}

fn storage_error(err: anyhow::Error) -> StoreError {
    StoreError::Storage(format!("{:#}", err))
}
