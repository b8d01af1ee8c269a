//! Work items and the priority work queue
//!
//! Every unit of scheduler work is a [`WorkItem`]. The [`WorkQueue`] hands
//! them out in strict FIFO order within a priority class; low-priority items
//! run only when no normal-priority item is waiting.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::activity::CallbackTag;
use super::async_op::AsyncOperationId;
use super::bookmark::Bookmark;
use super::fault::FaultInfo;
use super::instance::InstanceId;
use super::value::Value;

/// Priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkItemPriority {
    /// Background work (timers, idle-driven resumptions)
    Low,
    /// Everything else
    Normal,
}

/// A pending unit of scheduler work
#[derive(Debug)]
pub enum WorkItem {
    /// Run an instance's body
    ExecuteActivity {
        /// Target instance
        instance: InstanceId,
    },

    /// Deliver a terminal child to its parent
    CompletionCallback {
        /// Parent instance
        parent: InstanceId,
        /// Terminal child
        child: InstanceId,
    },

    /// Deliver a fault to the handler registered by the parent
    FaultCallback {
        /// Instance that registered the handler
        handler: InstanceId,
        /// Faulted child of the handler
        child: InstanceId,
        /// Callback on the handler's activity
        callback: CallbackTag,
        /// The fault
        fault: FaultInfo,
    },

    /// Request cancellation of an instance
    Cancel {
        /// Target instance
        instance: InstanceId,
    },

    /// Deliver a bookmark payload to its owner
    BookmarkResumption {
        /// Owner instance
        owner: InstanceId,
        /// The resumed bookmark
        bookmark: Bookmark,
        /// Callback on the owner's activity
        callback: Option<CallbackTag>,
        /// Payload
        value: Value,
        /// Whether processing releases one unit of the owner's busy count
        releases_owner: bool,
    },

    /// An asynchronous operation finished
    AsyncCompletion {
        /// Operation id
        operation: AsyncOperationId,
        /// Operation result
        result: anyhow::Result<Value>,
    },
}

impl WorkItem {
    /// Instance the item acts on
    pub fn target(&self) -> Option<InstanceId> {
        match self {
            WorkItem::ExecuteActivity { instance } | WorkItem::Cancel { instance } => {
                Some(*instance)
            }
            WorkItem::CompletionCallback { parent, .. } => Some(*parent),
            WorkItem::FaultCallback { handler, .. } => Some(*handler),
            WorkItem::BookmarkResumption { owner, .. } => Some(*owner),
            WorkItem::AsyncCompletion { .. } => None,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::ExecuteActivity { .. } => "execute",
            WorkItem::CompletionCallback { .. } => "completion",
            WorkItem::FaultCallback { .. } => "fault",
            WorkItem::Cancel { .. } => "cancel",
            WorkItem::BookmarkResumption { .. } => "bookmark",
            WorkItem::AsyncCompletion { .. } => "async-completion",
        }
    }
}

/// Queued work item with its ordering key
#[derive(Debug)]
struct ScheduledWorkItem {
    priority: WorkItemPriority,
    sequence: u64,
    item: WorkItem,
}

impl PartialEq for ScheduledWorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for ScheduledWorkItem {}

impl PartialOrd for ScheduledWorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledWorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earliest sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// FIFO-per-priority work queue
#[derive(Debug, Default)]
pub struct WorkQueue {
    heap: BinaryHeap<ScheduledWorkItem>,
    next_sequence: u64,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at normal priority
    pub fn push(&mut self, item: WorkItem) {
        self.push_with_priority(item, WorkItemPriority::Normal);
    }

    /// Enqueue with an explicit priority
    pub fn push_with_priority(&mut self, item: WorkItem, priority: WorkItemPriority) {
        tracing::trace!(kind = item.kind(), ?priority, "work item queued");
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(ScheduledWorkItem {
            priority,
            sequence,
            item,
        });
    }

    /// Dequeue the next item
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.heap.pop().map(|scheduled| scheduled.item)
    }

    /// True when work is waiting
    pub fn has_work(&self) -> bool {
        !self.heap.is_empty()
    }

    /// True when normal-priority work is waiting
    pub fn has_normal_work(&self) -> bool {
        self.heap
            .peek()
            .map(|top| top.priority == WorkItemPriority::Normal)
            .unwrap_or(false)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every queued item
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute(id: u64) -> WorkItem {
        WorkItem::ExecuteActivity {
            instance: InstanceId(id),
        }
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = WorkQueue::new();
        for i in 0..5 {
            queue.push(execute(i));
        }

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|item| item.target().unwrap().0)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_low_priority_yields_to_normal() {
        let mut queue = WorkQueue::new();
        queue.push_with_priority(execute(10), WorkItemPriority::Low);
        queue.push(execute(1));
        queue.push_with_priority(execute(11), WorkItemPriority::Low);
        queue.push(execute(2));

        assert!(queue.has_normal_work());
        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|item| item.target().unwrap().0)
            .collect();
        assert_eq!(order, vec![1, 2, 10, 11]);
    }

    #[test]
    fn test_normal_item_enqueued_later_still_runs_first() {
        let mut queue = WorkQueue::new();
        queue.push_with_priority(execute(10), WorkItemPriority::Low);
        assert!(!queue.has_normal_work());

        queue.push(execute(1));
        assert_eq!(queue.pop().unwrap().target(), Some(InstanceId(1)));
        assert_eq!(queue.pop().unwrap().target(), Some(InstanceId(10)));
        assert!(queue.is_empty());
    }
}
