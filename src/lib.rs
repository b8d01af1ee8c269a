//! CoreWF – An activity-based workflow execution engine
//!
//! This crate implements a workflow runtime with:
//! - Immutable, validated activity definitions shared by every instance
//! - A single-threaded executor that drives activity instances through a work queue
//! - Bookmarks: named suspension points resumed by external stimulus
//! - Structured fault propagation and cooperative cancellation
//! - Durable persistence of idle workflows through pluggable instance stores
//! - Tracking records for every lifecycle transition

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules implementing the workflow engine
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{
    Activity, ActivityExecutor, EngineConfig, RunOutcome, WorkflowApplication, WorkflowDefinition,
};

/// Current version of the CoreWF engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the snapshot format written to instance stores
pub const SNAPSHOT_FORMAT_VERSION: &str = "1.0.0";
