//! The delayed-task timer wheel (spec.md §4.6 "Delayed-task timer"): one
//! in-memory `DelayedTask` per task parked as WAITING_FOR_INTERVAL, each
//! polled on its own schedule rather than a single shared tick loop, since
//! sleep durations vary per task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use warden_lib::TaskId;

/// One task's sleep-timer bookkeeping, kept purely in-process; the durable
/// `millisecondsRemaining` attribute is the source of truth across restarts.
#[derive(Debug, Clone, Copy)]
pub struct DelayedTask {
    pub started_at: Instant,
    pub remaining_millis: i64,
}

/// A concurrent table of in-flight delayed tasks. `std::sync::Mutex` is
/// sufficient here: every access is a short, non-blocking map operation,
/// never held across an `.await`.
#[derive(Default)]
pub struct DelayedTaskTable {
    entries: Mutex<HashMap<TaskId, DelayedTask>>,
}

impl DelayedTaskTable {
    pub fn new() -> Self {
        DelayedTaskTable::default()
    }

    pub fn insert(&self, task_id: TaskId, remaining_millis: i64) {
        self.entries.lock().unwrap().insert(
            task_id,
            DelayedTask { started_at: Instant::now(), remaining_millis },
        );
    }

    pub fn update_remaining(&self, task_id: TaskId, remaining_millis: i64) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&task_id) {
            entry.remaining_millis = remaining_millis;
        }
    }

    pub fn remove(&self, task_id: TaskId) {
        self.entries.lock().unwrap().remove(&task_id);
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.lock().unwrap().contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.entries.lock().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_round_trip() {
        let table = DelayedTaskTable::new();
        let id = TaskId::from(1);
        assert!(!table.contains(id));
        table.insert(id, 5_000);
        assert!(table.contains(id));
        assert_eq!(table.len(), 1);
        table.remove(id);
        assert!(!table.contains(id));
        assert!(table.is_empty());
    }

    #[test]
    fn update_remaining_only_touches_existing_entries() {
        let table = DelayedTaskTable::new();
        let id = TaskId::from(1);
        table.update_remaining(id, 1_000);
        assert!(!table.contains(id));

        table.insert(id, 5_000);
        table.update_remaining(id, 2_000);
        assert_eq!(table.task_ids(), vec![id]);
    }
}
