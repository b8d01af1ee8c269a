//! Error types for the CoreWF execution core
//!
//! Domain errors use thiserror, one enum per concern, with conversions into
//! the top-level [`EngineError`] at the executor and host boundaries. Faults
//! raised by activity code are not errors of the engine: they travel as
//! [`FaultInfo`](super::fault::FaultInfo) through the instance tree.

use std::io;
use std::time::Duration;
use thiserror::Error;

use super::bookmark::BookmarkScope;
use super::instance::{ActivityInstanceState, InstanceId, WorkflowInstanceId};
use super::store::OwnerId;
use super::validation::ValidationErrors;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// The definition failed validation and cannot run
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// A programming-contract violation
    #[error("Invalid operation: {0}")]
    Contract(#[from] ContractViolation),

    /// Snapshot or reconstruction failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Instance store command failure
    #[error("Instance store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Misuse of the engine by activity code or by the host
///
/// These are always fatal to the operation that triggered them. When raised by
/// activity code they become a fault of the calling instance.
#[derive(Debug, Error)]
pub enum ContractViolation {
    /// Scheduling or mutation attempted on an instance that is not executing
    #[error("Instance {instance} is {state:?}, expected Executing")]
    InstanceNotExecuting {
        /// Instance that was targeted
        instance: InstanceId,
        /// Its current state
        state: ActivityInstanceState,
    },

    /// The activity is not a declared child of the scheduling activity
    #[error("Activity '{child}' is not a declared child of '{parent}'")]
    NotADeclaredChild {
        /// Path of the scheduling activity
        parent: String,
        /// Path of the requested activity
        child: String,
    },

    /// The activity has cached validation errors
    #[error("Activity '{0}' has validation errors and cannot be scheduled")]
    InvalidDefinition(String),

    /// The instance id is not live
    #[error("Instance {0} not found")]
    UnknownInstance(InstanceId),

    /// The target instance is not a child of the caller
    #[error("Instance {child} is not a child of {parent}")]
    NotAChildInstance {
        /// Caller instance
        parent: InstanceId,
        /// Instance that was targeted
        child: InstanceId,
    },

    /// A context or operation handle was used after its turn ended
    #[error("Context used after its turn ended")]
    ContextDisposed,

    /// No variable or argument with this name is visible
    #[error("No location named '{0}' is visible from this activity")]
    UnknownLocation(String),

    /// The argument is not declared on the current activity
    #[error("Argument '{0}' is not declared")]
    UnknownArgument(String),

    /// Out value written to an In argument
    #[error("Argument '{0}' is an In argument and cannot be assigned")]
    ReadOnlyArgument(String),

    /// The bookmark scope is not owned by the caller
    #[error("Bookmark scope {0} is not owned by the calling instance")]
    ScopeNotOwned(BookmarkScope),

    /// The workflow is already in a terminal state
    #[error("Workflow {0} has already completed")]
    WorkflowCompleted(WorkflowInstanceId),

    /// The workflow was aborted and can no longer run
    #[error("Workflow {0} was aborted")]
    WorkflowAborted(WorkflowInstanceId),

    /// `mark_canceled` called by an instance nobody asked to cancel
    #[error("Instance {0} can only be marked canceled after cancellation was requested")]
    CancelNotRequested(InstanceId),
}

/// Convenience result alias for contract checks
pub type ContractResult<T> = std::result::Result<T, ContractViolation>;

/// Recoverable bookmark registration failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookmarkError {
    /// A bookmark with this name already exists in the scope
    #[error("Bookmark '{name}' already exists in scope {scope}")]
    DuplicateName {
        /// Bookmark name
        name: String,
        /// Scope where the collision happened
        scope: BookmarkScope,
    },

    /// The scope has not been created or is already gone
    #[error("Bookmark scope {0} does not exist")]
    UnknownScope(BookmarkScope),

    /// The owner is not live
    #[error("Instance {0} cannot own bookmarks in its current state")]
    OwnerNotLive(InstanceId),
}

/// Convenience result alias for bookmark operations
pub type BookmarkResult<T> = std::result::Result<T, BookmarkError>;

/// Snapshot and reconstruction errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Persistence requested while work is runnable
    #[error("Workflow is not idle ({0})")]
    NotIdle(String),

    /// Persistence requested while asynchronous operations are in flight
    #[error("Cannot persist while {0} asynchronous operations are outstanding")]
    AsyncOperationsOutstanding(usize),

    /// The definition supplied on reload is not the one that was persisted
    #[error("Definition identity mismatch: expected {expected}, found {found}")]
    DefinitionMismatch {
        /// Fingerprint stored in the snapshot
        expected: String,
        /// Fingerprint of the supplied definition
        found: String,
    },

    /// Activity path in the snapshot has no counterpart in the definition
    #[error("Unknown activity path '{0}'")]
    UnknownActivityPath(String),

    /// An instance reference could not be resolved
    #[error("Unresolved instance reference {0}")]
    UnresolvedReference(InstanceId),

    /// An instance appears twice in the snapshot
    #[error("Instance {0} appears more than once in the snapshot")]
    DuplicateInstance(InstanceId),

    /// Structural inconsistency in the snapshot
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Encoding error
    #[error("Snapshot encoding failed: {0}")]
    Encoding(String),

    /// Decoding error
    #[error("Snapshot decoding failed: {0}")]
    Decoding(String),
}

/// Convenience result alias for persistence operations
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Instance store command errors
///
/// The engine never retries a failed command; retry is a host decision.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The command did not finish within its timeout
    #[error("Store command timed out after {0:?}")]
    Timeout(Duration),

    /// A transient failure the host may retry
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// No instance with this id was saved
    #[error("Instance {0} not found")]
    InstanceNotFound(WorkflowInstanceId),

    /// The instance is locked by another owner
    #[error("Instance {instance} is locked by owner {owner}")]
    InstanceLocked {
        /// Locked instance
        instance: WorkflowInstanceId,
        /// Current lock holder
        owner: OwnerId,
    },

    /// The instance was saved with the complete flag
    #[error("Instance {0} has completed")]
    InstanceCompleted(WorkflowInstanceId),

    /// The owner was never created or has been deleted
    #[error("Owner {0} not found")]
    OwnerNotFound(OwnerId),

    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the workflow host
#[derive(Debug, Error)]
pub enum HostError {
    /// Another caller is currently running this instance
    #[error("Workflow instance {0} is already running")]
    InstanceBusy(WorkflowInstanceId),

    /// The instance was unloaded or aborted
    #[error("Workflow instance {0} is not loaded")]
    NotLoaded(WorkflowInstanceId),

    /// Persistence requires an instance store
    #[error("No instance store configured")]
    NoInstanceStore,

    /// Engine-level failure
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StoreError> for HostError {
    fn from(err: StoreError) -> Self {
        HostError::Engine(EngineError::Store(err))
    }
}

impl From<PersistenceError> for HostError {
    fn from(err: PersistenceError) -> Self {
        HostError::Engine(EngineError::Persistence(err))
    }
}

impl From<ContractViolation> for HostError {
    fn from(err: ContractViolation) -> Self {
        HostError::Engine(EngineError::Contract(err))
    }
}

/// Convenience result alias for host operations
pub type HostResult<T> = std::result::Result<T, HostError>;
