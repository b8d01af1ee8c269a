//! Asynchronous operation handles
//!
//! An [`AsyncCodeActivity`](super::activity::AsyncCodeActivity) receives an
//! [`AsyncOperation`] when it begins. The handle is `Send` and may be moved to
//! any thread; completing it posts a message on the executor's channel, which
//! the executor drains into its work queue at the next scheduling point.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::error::{ContractResult, ContractViolation};
use super::instance::WorkflowInstanceId;
use super::value::Value;

/// Identifier of an outstanding asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AsyncOperationId(pub u64);

impl fmt::Display for AsyncOperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Message posted when an operation finishes
#[derive(Debug)]
pub struct AsyncCompletionMessage {
    /// Operation id
    pub operation: AsyncOperationId,
    /// Value or error produced by the operation
    pub result: anyhow::Result<Value>,
}

pub(crate) type CompletionSender = UnboundedSender<AsyncCompletionMessage>;
pub(crate) type CompletionReceiver = UnboundedReceiver<AsyncCompletionMessage>;

pub(crate) fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Sending half handed to each operation, paired with a wakeup for hosts
/// waiting on completions
#[derive(Debug, Clone)]
pub(crate) struct CompletionSink {
    sender: CompletionSender,
    notify: Arc<Notify>,
}

impl CompletionSink {
    pub(crate) fn new(sender: CompletionSender, notify: Arc<Notify>) -> Self {
        Self { sender, notify }
    }
}

/// Handle used to finish an asynchronous operation from any thread
#[derive(Debug)]
pub struct AsyncOperation {
    id: AsyncOperationId,
    workflow: WorkflowInstanceId,
    sink: CompletionSink,
}

impl AsyncOperation {
    pub(crate) fn new(
        id: AsyncOperationId,
        workflow: WorkflowInstanceId,
        sink: CompletionSink,
    ) -> Self {
        Self { id, workflow, sink }
    }

    /// Operation id
    pub fn id(&self) -> AsyncOperationId {
        self.id
    }

    /// Workflow the operation belongs to
    pub fn workflow(&self) -> WorkflowInstanceId {
        self.workflow
    }

    /// Finish the operation
    ///
    /// Fails with [`ContractViolation::ContextDisposed`] when the executor that
    /// issued the handle no longer exists (unloaded, aborted or dropped).
    pub fn complete(self, result: anyhow::Result<Value>) -> ContractResult<()> {
        self.sink
            .sender
            .send(AsyncCompletionMessage {
                operation: self.id,
                result,
            })
            .map_err(|_| ContractViolation::ContextDisposed)?;
        self.sink.notify.notify_one();
        Ok(())
    }

    /// Finish the operation with a value
    pub fn succeed(self, value: Value) -> ContractResult<()> {
        self.complete(Ok(value))
    }

    /// Finish the operation with an error; the owning instance faults
    pub fn fail(self, error: anyhow::Error) -> ContractResult<()> {
        self.complete(Err(error))
    }
}
