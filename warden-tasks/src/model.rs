use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_lib::{TaskId, TaskState, QUEUED_SENTINEL, WAITING_SENTINEL};

use crate::error::BuildError;

/// Where a task currently sits relative to a monitor (spec.md §3's
/// `monitorId` invariant, made explicit instead of overloading a raw
/// string): a live monitor owns it, it is dispatchable, it is blocked on
/// locks/prerequisites, or it is terminal and owns nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorSlot {
    Owned(String),
    Queued,
    Waiting,
    None,
}

impl MonitorSlot {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MonitorSlot::Owned(id) => Some(id),
            MonitorSlot::Queued => Some(QUEUED_SENTINEL),
            MonitorSlot::Waiting => Some(WAITING_SENTINEL),
            MonitorSlot::None => None,
        }
    }

    pub fn from_str_opt(value: Option<&str>) -> Self {
        match value {
            None => MonitorSlot::None,
            Some(v) if v == QUEUED_SENTINEL => MonitorSlot::Queued,
            Some(v) if v == WAITING_SENTINEL => MonitorSlot::Waiting,
            Some(v) => MonitorSlot::Owned(v.to_string()),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MonitorSlot::Queued)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, MonitorSlot::Waiting)
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            MonitorSlot::Owned(id) => Some(id),
            _ => None,
        }
    }
}

/// The durable job record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub entity_type: String,
    pub entity_id: String,
    pub task_state: TaskState,
    pub monitor_id: MonitorSlot,
    pub lock_ids: Vec<String>,
    pub prerequisite_task_ids: Vec<TaskId>,
    pub any_prerequisite: bool,
    pub checkpoint_data: Vec<u8>,
    pub update_data: Option<Vec<u8>>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub run_count: i64,
    pub requeues: i64,
    pub milliseconds_remaining: Option<i64>,
    pub canceled_by: Option<String>,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
    pub error_id: Option<String>,
}

impl TaskInfo {
    pub fn is_terminal(&self) -> bool {
        self.task_state.is_terminal()
    }

    /// The `entityId + "@" + sortKey(taskId)` compound range key (spec.md
    /// §4.3), sorted by task id within one entity.
    pub fn entity_range_key(&self) -> String {
        format!("{}@{}", self.entity_id, self.task_id.sort_key())
    }

    /// Non-terminal mirror attributes: present only while non-terminal
    /// (spec.md §4.3); deliberately `None` once terminal so the index row
    /// is naturally dropped.
    pub fn non_terminal_type(&self) -> Option<&str> {
        (!self.is_terminal()).then_some(self.entity_type.as_str())
    }

    pub fn non_terminal_range_key(&self) -> Option<String> {
        (!self.is_terminal()).then(|| self.entity_range_key())
    }
}

warden_lib::impl_display_using_json_pretty!(TaskInfo);

/// A point-in-time, in-memory view of a [`TaskInfo`] (SPEC_FULL §2
/// supplemental feature, ported from `reqpool::request::StatusWithContext`):
/// never persisted as a distinct store attribute, only used for logging,
/// subscriber delivery and the demo binary's console output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task: TaskInfo,
    pub recorded_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn new(task: TaskInfo) -> Self {
        TaskSnapshot { task, recorded_at: Utc::now() }
    }

    pub fn count_by_entity_type(snapshots: &[TaskSnapshot], entity_type: &str) -> usize {
        snapshots.iter().filter(|s| s.task.entity_type == entity_type).count()
    }

    pub fn is_empty(snapshots: &[TaskSnapshot]) -> bool {
        snapshots.is_empty()
    }
}

warden_lib::impl_display_using_json_pretty!(TaskSnapshot);

/// Builds a new [`TaskInfo`] before it has a `task_id`, an entry point to
/// `createTask()` (spec.md §4.8).
#[derive(Debug, Clone, Default)]
pub struct TaskBuilder {
    entity_type: Option<String>,
    entity_id: Option<String>,
    lock_ids: Vec<String>,
    prerequisite_task_ids: Vec<TaskId>,
    any_prerequisite: bool,
    checkpoint_data: Vec<u8>,
    update_data: Option<Vec<u8>>,
    milliseconds_remaining: Option<i64>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        TaskBuilder::default()
    }

    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn lock_ids(mut self, lock_ids: Vec<String>) -> Self {
        self.lock_ids = lock_ids;
        self
    }

    pub fn prerequisite_task_ids(mut self, ids: Vec<TaskId>) -> Self {
        self.prerequisite_task_ids = ids;
        self
    }

    pub fn any_prerequisite(mut self, any: bool) -> Self {
        self.any_prerequisite = any;
        self
    }

    pub fn checkpoint_data(mut self, data: Vec<u8>) -> Self {
        self.checkpoint_data = data;
        self
    }

    pub fn update_data(mut self, data: Vec<u8>) -> Self {
        self.update_data = Some(data);
        self
    }

    pub fn sleep_for(mut self, milliseconds: i64) -> Self {
        self.milliseconds_remaining = Some(milliseconds);
        self
    }

    /// Validates the builder and assigns a task id from `seq` (C1).
    pub async fn build(
        self,
        seq: &dyn warden_store::Sequence,
    ) -> crate::error::TaskResult<TaskInfo> {
        let entity_type = self.entity_type.ok_or(BuildError::MissingEntityType)?;
        let entity_id = self.entity_id.ok_or(BuildError::MissingEntityId)?;
        if self.any_prerequisite && self.prerequisite_task_ids.is_empty() {
            return Err(BuildError::EmptyAnyPrerequisite.into());
        }

        let task_id = TaskId::from(seq.next().await?);

        Ok(TaskInfo {
            task_id,
            entity_type,
            entity_id,
            task_state: TaskState::Queued,
            monitor_id: MonitorSlot::Queued,
            lock_ids: self.lock_ids,
            prerequisite_task_ids: self.prerequisite_task_ids,
            any_prerequisite: self.any_prerequisite,
            checkpoint_data: self.checkpoint_data,
            update_data: self.update_data,
            start_time: None,
            end_time: None,
            run_count: 0,
            requeues: 0,
            milliseconds_remaining: self.milliseconds_remaining,
            canceled_by: None,
            error_message: None,
            error_stack_trace: None,
            error_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::{InMemorySequence, Sequence};

    #[tokio::test]
    async fn build_requires_entity_type_and_id() {
        let seq = InMemorySequence::new();
        let err = TaskBuilder::new().entity_id("e1").build(&seq).await.unwrap_err();
        assert!(matches!(err, crate::error::TaskError::Build(BuildError::MissingEntityType)));

        let err = TaskBuilder::new().entity_type("echo").build(&seq).await.unwrap_err();
        assert!(matches!(err, crate::error::TaskError::Build(BuildError::MissingEntityId)));
    }

    #[tokio::test]
    async fn build_rejects_any_prerequisite_with_no_ids() {
        let seq = InMemorySequence::new();
        let err = TaskBuilder::new()
            .entity_type("echo")
            .entity_id("e1")
            .any_prerequisite(true)
            .build(&seq)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::TaskError::Build(BuildError::EmptyAnyPrerequisite)));
    }

    #[tokio::test]
    async fn build_assigns_id_and_defaults() {
        let seq = InMemorySequence::new();
        let task = TaskBuilder::new()
            .entity_type("echo")
            .entity_id("e1")
            .build(&seq)
            .await
            .unwrap();
        assert_eq!(task.task_id.get(), 1);
        assert_eq!(task.task_state, TaskState::Queued);
        assert!(task.monitor_id.is_queued());
        assert_eq!(task.run_count, 0);
    }

    #[test]
    fn entity_range_key_sorts_by_task_id() {
        let mut a = sample_task();
        a.task_id = TaskId::from(1);
        let mut b = sample_task();
        b.task_id = TaskId::from(2);
        assert!(a.entity_range_key() < b.entity_range_key());
    }

    #[test]
    fn non_terminal_mirror_drops_when_terminal() {
        let mut task = sample_task();
        assert!(task.non_terminal_type().is_some());
        task.task_state = TaskState::Success;
        assert!(task.non_terminal_type().is_none());
        assert!(task.non_terminal_range_key().is_none());
    }

    fn sample_task() -> TaskInfo {
        TaskInfo {
            task_id: TaskId::from(1),
            entity_type: "echo".into(),
            entity_id: "e1".into(),
            task_state: TaskState::Queued,
            monitor_id: MonitorSlot::Queued,
            lock_ids: vec![],
            prerequisite_task_ids: vec![],
            any_prerequisite: false,
            checkpoint_data: vec![],
            update_data: None,
            start_time: None,
            end_time: None,
            run_count: 0,
            requeues: 0,
            milliseconds_remaining: None,
            canceled_by: None,
            error_message: None,
            error_stack_trace: None,
            error_id: None,
        }
    }
}
