//! Tracking: lifecycle records dispatched to participants
//!
//! The executor emits a [`TrackingRecord`] for every workflow and activity
//! state change. Participants are fire-and-forget: an error or panic in one
//! is logged and otherwise ignored.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::bookmark::Bookmark;
use super::fault::panic_message;
use super::instance::{ActivityInstanceState, InstanceId, WorkflowInstanceId};

/// Workflow-level states reported to participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowTrackingState {
    /// Root scheduled for the first time
    Started,
    /// Reconstructed from a snapshot
    Loaded,
    /// Work queue drained with bookmarks or operations outstanding
    Idle,
    /// Snapshot handed to an instance store
    Persisted,
    /// Removed from memory by the host
    Unloaded,
    /// Root closed
    Completed,
    /// Root canceled
    Canceled,
    /// Root faulted
    Faulted,
    /// Host terminate request
    Terminated,
    /// Torn down without completing
    Aborted,
}

/// Activity identity carried in records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Instance id
    pub instance: InstanceId,
    /// Dotted definition path
    pub activity_path: String,
    /// Display name
    pub name: String,
}

/// Tracking payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingEvent {
    /// Workflow-level transition
    WorkflowInstanceStateChanged {
        /// New state
        state: WorkflowTrackingState,
    },
    /// A child was scheduled
    ActivityScheduled {
        /// Scheduling instance, none for the root
        parent: Option<ActivityInfo>,
        /// New child
        child: ActivityInfo,
    },
    /// An instance changed state
    ActivityStateChanged {
        /// The instance
        activity: ActivityInfo,
        /// New state
        state: ActivityInstanceState,
    },
    /// A bookmark resumption was delivered to its owner
    BookmarkResumed {
        /// The bookmark
        bookmark: Bookmark,
        /// Owner instance
        owner: ActivityInfo,
    },
    /// A fault reached a handler or the root
    FaultPropagated {
        /// Instance that raised the fault
        source: ActivityInfo,
        /// Instance whose handler receives it, none at the root
        handler: Option<ActivityInfo>,
        /// Error message
        message: String,
    },
}

/// One tracking record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Workflow the record belongs to
    pub workflow: WorkflowInstanceId,
    /// Monotonic per-provider sequence number
    pub record_number: u64,
    /// Wall-clock time of emission
    pub timestamp: DateTime<Utc>,
    /// Payload
    pub event: TrackingEvent,
}

/// A tracking listener
pub trait TrackingParticipant: Send + Sync {
    /// Receive a record
    fn track(&self, record: &TrackingRecord) -> anyhow::Result<()>;
}

/// Fan-out of records to registered participants
#[derive(Clone)]
pub struct TrackingProvider {
    participants: Vec<Arc<dyn TrackingParticipant>>,
    next_record: u64,
    enabled: bool,
}

impl TrackingProvider {
    /// Create a provider with no participants
    pub fn new() -> Self {
        Self {
            participants: Vec::new(),
            next_record: 0,
            enabled: true,
        }
    }

    /// Register a participant
    pub fn add_participant(&mut self, participant: Arc<dyn TrackingParticipant>) {
        self.participants.push(participant);
    }

    /// Enable or disable emission
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// True when records would reach at least one participant
    pub fn is_active(&self) -> bool {
        self.enabled && !self.participants.is_empty()
    }

    /// Dispatch a record to every participant
    pub(crate) fn emit(&mut self, workflow: WorkflowInstanceId, event: TrackingEvent) {
        if !self.is_active() {
            return;
        }

        let record = TrackingRecord {
            workflow,
            record_number: self.next_record,
            timestamp: Utc::now(),
            event,
        };
        self.next_record += 1;

        for participant in &self.participants {
            match panic::catch_unwind(AssertUnwindSafe(|| participant.track(&record))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        workflow = %workflow,
                        record = record.record_number,
                        "tracking participant failed: {:#}",
                        err
                    );
                }
                Err(payload) => {
                    tracing::warn!(
                        workflow = %workflow,
                        record = record.record_number,
                        "tracking participant panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

impl Default for TrackingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrackingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingProvider")
            .field("participants", &self.participants.len())
            .field("next_record", &self.next_record)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Participant that keeps every record in memory
#[derive(Debug, Default)]
pub struct RecordingParticipant {
    records: Mutex<Vec<TrackingRecord>>,
}

impl RecordingParticipant {
    /// Create an empty recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of the records received so far
    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records.lock().clone()
    }

    /// Events received so far, without envelope
    pub fn events(&self) -> Vec<TrackingEvent> {
        self.records.lock().iter().map(|r| r.event.clone()).collect()
    }

    /// Drop the records received so far
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl TrackingParticipant for RecordingParticipant {
    fn track(&self, record: &TrackingRecord) -> anyhow::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl TrackingParticipant for Failing {
        fn track(&self, _record: &TrackingRecord) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    struct Panicking;

    impl TrackingParticipant for Panicking {
        fn track(&self, _record: &TrackingRecord) -> anyhow::Result<()> {
            panic!("participant bug")
        }
    }

    fn started() -> TrackingEvent {
        TrackingEvent::WorkflowInstanceStateChanged {
            state: WorkflowTrackingState::Started,
        }
    }

    #[test]
    fn test_records_are_numbered_in_order() {
        let recorder = RecordingParticipant::new();
        let mut provider = TrackingProvider::new();
        provider.add_participant(recorder.clone());

        let workflow = WorkflowInstanceId::new();
        provider.emit(workflow, started());
        provider.emit(
            workflow,
            TrackingEvent::WorkflowInstanceStateChanged {
                state: WorkflowTrackingState::Completed,
            },
        );

        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_number, 0);
        assert_eq!(records[1].record_number, 1);
        assert_eq!(records[0].workflow, workflow);
    }

    #[test]
    fn test_failing_participants_do_not_stop_dispatch() {
        let recorder = RecordingParticipant::new();
        let mut provider = TrackingProvider::new();
        provider.add_participant(Arc::new(Failing));
        provider.add_participant(Arc::new(Panicking));
        provider.add_participant(recorder.clone());

        provider.emit(WorkflowInstanceId::new(), started());
        assert_eq!(recorder.events(), vec![started()]);
    }

    #[test]
    fn test_disabled_provider_emits_nothing() {
        let recorder = RecordingParticipant::new();
        let mut provider = TrackingProvider::new();
        provider.add_participant(recorder.clone());
        provider.set_enabled(false);

        provider.emit(WorkflowInstanceId::new(), started());
        assert!(recorder.records().is_empty());
    }
}
