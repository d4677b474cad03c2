//! Priority-ordered buffer for operations awaiting delivery
//!
//! Each priority class is its own FIFO lane. Dequeue order is strictly by lane
//! (`next_session`, then `user_progress`, then `metadata`) and FIFO within a
//! lane. A failed operation keeps its position, so nothing behind it in the
//! same or a lower lane can overtake it.

use crate::types::{SyncOperation, SyncPriority};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncQueue {
    lanes: [VecDeque<SyncOperation>; 3],
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from a persisted list (in any order)
    pub fn from_operations(operations: impl IntoIterator<Item = SyncOperation>) -> Self {
        let mut queue = Self::new();
        for operation in operations {
            queue.enqueue(operation);
        }
        queue
    }

    pub fn enqueue(&mut self, operation: SyncOperation) {
        self.lanes[operation.priority.lane()].push_back(operation);
    }

    pub fn peek(&self) -> Option<&SyncOperation> {
        self.lanes.iter().find_map(|lane| lane.front())
    }

    /// Remove the next operation in priority-then-FIFO order
    pub fn dequeue(&mut self) -> Option<SyncOperation> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Remove a specific operation after it was delivered
    pub fn remove(&mut self, id: Uuid) -> Option<SyncOperation> {
        for lane in self.lanes.iter_mut() {
            if let Some(position) = lane.iter().position(|op| op.id == id) {
                return lane.remove(position);
            }
        }
        None
    }

    /// Count a failed attempt; the operation keeps its position
    pub fn record_failure(&mut self, id: Uuid) -> Option<u32> {
        self.lanes
            .iter_mut()
            .flat_map(|lane| lane.iter_mut())
            .find(|op| op.id == id)
            .map(|op| {
                op.record_failure();
                op.attempts
            })
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn len_for(&self, priority: SyncPriority) -> usize {
        self.lanes[priority.lane()].len()
    }

    /// Operations in dequeue order
    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.lanes.iter().flat_map(|lane| lane.iter())
    }

    pub fn to_vec(&self) -> Vec<SyncOperation> {
        self.iter().cloned().collect()
    }
}
