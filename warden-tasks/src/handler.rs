//! The external collaborator contracts spec.md §6 names: the heartbeat
//! "monitor" context the state machine runs inside, and the user-supplied
//! task function registry it dispatches into. Both are traits so the
//! `warden` facade crate can supply concrete implementations without this
//! crate knowing about them.

use std::sync::Arc;

use async_trait::async_trait;
use warden_store::{AttrValue, KvStore, Predicate, StoreError, Table};

use crate::error::{TaskError, TaskResult};
use crate::model::TaskInfo;

/// A heartbeat-bearing worker process context (spec.md §6's "Monitor
/// contract"), supplied externally; the core only ever reads from it or
/// tells it that this process's locks must be abandoned.
pub trait Monitor: Send + Sync {
    fn monitor_id(&self) -> &str;
    fn node_name(&self) -> &str;
    fn has_failed_heartbeat(&self) -> bool;
    fn force_heartbeat_failure(&self);
    fn is_active_monitor(&self) -> bool;
}

/// What a [`TaskHandler`] hands back to request a change to the task
/// record beyond a bare success/failure (spec.md §4.5 "Finalize"): any
/// field left `None` is left unchanged from the claimed snapshot.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub lock_ids: Option<Vec<String>>,
    pub prerequisite_task_ids: Option<Vec<warden_lib::TaskId>>,
    pub milliseconds_remaining: Option<i64>,
    pub update_data: Option<Vec<u8>>,
}

/// The per-attempt handle given to a [`TaskHandler`]: the claimed task
/// snapshot, the active monitor, and `commit_checkpoint` — the only
/// mutation a handler may make mid-run without returning.
pub struct TaskContext {
    task: TaskInfo,
    monitor_id: String,
    store: Arc<dyn KvStore>,
}

impl TaskContext {
    pub(crate) fn new(task: TaskInfo, monitor_id: String, store: Arc<dyn KvStore>) -> Self {
        TaskContext { task, monitor_id, store }
    }

    pub fn task(&self) -> &TaskInfo {
        &self.task
    }

    /// Conditionally updates `checkpointData`, guarded by `mid = me`
    /// (spec.md §4.5). A guard failure means another monitor now owns this
    /// task — fatal to the current run.
    pub async fn commit_checkpoint(&self, data: Vec<u8>) -> TaskResult<()> {
        let guard = Predicate::eq("mid", self.monitor_id.clone());
        match self
            .store
            .conditional_merge(
                Table::Tasks,
                &self.task.task_id.get().to_string(),
                None,
                vec![("st8".to_string(), AttrValue::B(data))],
                vec![],
                guard,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::PreconditionFailed) => {
                Err(TaskError::LostLock(format!("checkpoint commit for task {}", self.task.task_id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The user-supplied task function for one `entityType` (spec.md §6
/// "Handler registry"). Returning `Err` persists the task as FAILED with a
/// fresh error id; returning `Ok(Some(update))` may force an automatic
/// re-queue per spec.md §4.5.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<Option<TaskUpdate>, String>;
}

/// A lookup from `entityType` to its handler (spec.md §6); the concrete
/// `HashMap`-backed registry lives in the `warden` facade crate (component
/// C8), which is where callers register handlers.
pub trait HandlerRegistry: Send + Sync {
    fn get(&self, entity_type: &str) -> Option<Arc<dyn TaskHandler>>;
}
