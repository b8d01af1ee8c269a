//! Workflow runtime and public API
//!
//! The runtime is organized bottom-up:
//! - definitions ([`activity`], [`definition`], [`validation`]) describe what runs
//! - the instance tree ([`instance`], [`bookmark`], [`work_item`], [`fault`])
//!   records what is running
//! - the [`executor`] drives the work queue, handing activity code a
//!   [`context`] for each callback
//! - [`instance_map`] and [`store`] take idle workflows to durable storage
//! - [`application`] hosts one workflow for a program

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

// Submodules
pub mod activity;
pub mod application;
pub mod async_op;
pub mod bookmark;
pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod fault;
pub mod instance;
pub mod instance_map;
pub mod storage;
pub mod store;
pub mod tracking;
pub mod validation;
pub mod value;
pub mod work_item;

/// Configuration for workflow hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory of the file-backed instance store (default: .corewf/)
    pub root: PathBuf,

    /// Timeout applied to every instance store command, in milliseconds
    pub store_timeout_ms: u64,

    /// Action taken when a workflow with a store goes idle and the host
    /// installed no `on_persistable_idle` callback
    pub persistable_idle: PersistableIdleAction,

    /// Emit tracking records to participants
    pub tracking: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".corewf"),
            store_timeout_ms: 5_000,
            persistable_idle: PersistableIdleAction::None,
            tracking: true,
        }
    }
}

impl EngineConfig {
    /// Create the store root and write this configuration into it
    pub fn init(&self) -> anyhow::Result<()> {
        storage::write_config(self)
    }

    /// Load the configuration stored under `root`
    pub fn load(root: PathBuf) -> anyhow::Result<Self> {
        storage::load_config(&root)
    }
}

// Re-export commonly used types
pub use activity::{
    Activity, ActivityKind, Argument, ArgumentBinding, ArgumentDirection, AsyncCodeActivity,
    CallbackTag, CodeActivity, NativeActivity, Variable,
};
pub use application::{PersistableIdleAction, WorkflowApplication, WorkflowIdleEventArgs};
pub use async_op::{AsyncOperation, AsyncOperationId};
pub use bookmark::{
    Bookmark, BookmarkInfo, BookmarkOptions, BookmarkResumptionResult, BookmarkScope,
};
pub use context::{
    ActivityContext, AsyncCodeActivityContext, CodeActivityContext, NativeActivityContext,
    ScheduleOptions,
};
pub use definition::{ActivityId, ActivityMetadata, WorkflowDefinition};
pub use error::{
    BookmarkError, ContractViolation, EngineError, EngineResult, HostError, HostResult,
    PersistenceError, StoreError,
};
pub use executor::{ActivityExecutor, RunOutcome, WorkflowState};
pub use extensions::Extensions;
pub use fault::{FaultContext, FaultHandling, FaultInfo};
pub use instance::{ActivityInstanceState, CompletedChild, InstanceId, WorkflowInstanceId};
pub use instance_map::WorkflowSnapshot;
pub use store::{FileInstanceStore, InstanceStore, MemoryInstanceStore, OwnerId};
pub use tracking::{
    RecordingParticipant, TrackingEvent, TrackingParticipant, TrackingProvider, TrackingRecord,
    WorkflowTrackingState,
};
pub use validation::{Severity, ValidationError, ValidationErrors};
pub use value::{Value, null};
pub use work_item::WorkItemPriority;
