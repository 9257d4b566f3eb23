//! A dedup, FIFO, in-process ready queue, grounded on the request-actor's
//! own in-memory queue: one `VecDeque` for order, one `HashSet` to keep a
//! task id from being enqueued twice while it is already pending or running.

use std::collections::{HashSet, VecDeque};

use warden_lib::TaskId;

#[derive(Debug, Default)]
pub struct ReadyQueue {
    pending: VecDeque<TaskId>,
    in_flight: HashSet<TaskId>,
    queued: HashSet<TaskId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue::default()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.queued.contains(&task_id)
    }

    /// Enqueues `task_id` unless it is already pending or in flight.
    /// Returns whether it was newly added.
    pub fn push(&mut self, task_id: TaskId) -> bool {
        if self.queued.insert(task_id) {
            self.pending.push_back(task_id);
            true
        } else {
            false
        }
    }

    /// Moves the next pending task id into the in-flight set.
    pub fn pop(&mut self) -> Option<TaskId> {
        let task_id = self.pending.pop_front()?;
        self.in_flight.insert(task_id);
        Some(task_id)
    }

    /// Marks a previously-popped task id as finished, making it eligible to
    /// be enqueued again (e.g. after an automatic re-queue).
    pub fn complete(&mut self, task_id: TaskId) {
        self.in_flight.remove(&task_id);
        self.queued.remove(&task_id);
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_pending_pushes() {
        let mut q = ReadyQueue::new();
        assert!(q.push(TaskId::from(1)));
        assert!(!q.push(TaskId::from(1)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_moves_to_in_flight_and_complete_frees_it() {
        let mut q = ReadyQueue::new();
        q.push(TaskId::from(1));
        let popped = q.pop().unwrap();
        assert_eq!(popped, TaskId::from(1));
        assert!(q.contains(TaskId::from(1)));
        assert!(!q.push(TaskId::from(1)));

        q.complete(TaskId::from(1));
        assert!(!q.contains(TaskId::from(1)));
        assert!(q.push(TaskId::from(1)));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = ReadyQueue::new();
        q.push(TaskId::from(1));
        q.push(TaskId::from(2));
        q.push(TaskId::from(3));
        assert_eq!(q.pop(), Some(TaskId::from(1)));
        assert_eq!(q.pop(), Some(TaskId::from(2)));
        assert_eq!(q.pop(), Some(TaskId::from(3)));
        assert_eq!(q.pop(), None);
    }
}
