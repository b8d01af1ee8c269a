//! Faults raised by activity code and their propagation records

use std::fmt;
use std::sync::Arc;

use super::definition::ActivityId;
use super::instance::InstanceId;

/// An error that escaped activity code, with the instance it came from
///
/// The original error is kept intact so hosts can downcast it.
#[derive(Clone)]
pub struct FaultInfo {
    error: Arc<anyhow::Error>,
    source: InstanceId,
    source_activity: ActivityId,
    source_name: String,
    terminated: bool,
}

impl FaultInfo {
    pub(crate) fn new(
        error: anyhow::Error,
        source: InstanceId,
        source_activity: ActivityId,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            error: Arc::new(error),
            source,
            source_activity,
            source_name: source_name.into(),
            terminated: false,
        }
    }

    pub(crate) fn terminated(
        reason: impl Into<String>,
        source: InstanceId,
        source_activity: ActivityId,
        source_name: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        Self {
            terminated: true,
            ..Self::new(
                anyhow::anyhow!("workflow terminated: {}", reason),
                source,
                source_activity,
                source_name,
            )
        }
    }

    /// Rebuild a fault from its persisted rendering
    pub(crate) fn restored(
        message: String,
        source: InstanceId,
        source_activity: ActivityId,
        source_name: impl Into<String>,
        terminated: bool,
    ) -> Self {
        Self {
            terminated,
            ..Self::new(anyhow::Error::msg(message), source, source_activity, source_name)
        }
    }

    /// The original error
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Downcast the original error
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Error message (outermost context only)
    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// Instance whose code raised the error
    pub fn source(&self) -> InstanceId {
        self.source
    }

    /// Definition node of the source instance
    pub fn source_activity(&self) -> ActivityId {
        self.source_activity
    }

    /// Display name of the source activity
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// True when the fault was produced by a host terminate request
    pub fn is_termination(&self) -> bool {
        self.terminated
    }
}

impl fmt::Debug for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultInfo")
            .field("error", &format!("{:#}", self.error))
            .field("source", &self.source)
            .field("source_name", &self.source_name)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' (instance {}) faulted: {:#}",
            self.source_name, self.source, self.error
        )
    }
}

/// Handed to a fault callback
#[derive(Debug, Clone)]
pub struct FaultContext {
    /// The propagating fault
    pub fault: FaultInfo,
    /// Child whose subtree faulted (not necessarily the source)
    pub faulted_child: InstanceId,
    /// Definition node of the faulted child
    pub faulted_child_activity: ActivityId,
}

/// Decision returned by a fault callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultHandling {
    /// The fault stops here; the faulted child's completion is still delivered
    Handled,
    /// Fault this instance too and keep propagating
    Propagate,
}

/// Render a panic payload caught at the dispatch boundary
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
