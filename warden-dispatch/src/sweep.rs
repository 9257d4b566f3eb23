//! Background sweepers (spec.md §4.7, component C7): periodic queued-task
//! catch-up, deep cleanup every `cleanup_intervals` ticks, and monitor-death
//! recovery.

use std::sync::Arc;

use tracing::error;
use warden_lib::{TaskId, QUEUED_SENTINEL, WAITING_SENTINEL};
use warden_store::{AttrValue, FullScanRequest, KvStore, Predicate, ScanRequest, StoreError, Table};
use warden_tasks::{item_to_lock_row, item_to_task, LockCoordinator, LockRow, TaskInfo};

use crate::error::DispatchResult;

/// Caller-supplied filter applied to queued tasks before they're enqueued
/// (spec.md §4.7: "matched by an optional predicate"); this is an
/// application-level filter over decoded rows, distinct from
/// `warden_store::Predicate`, which only ever guards a write.
pub type TaskFilter = Arc<dyn Fn(&TaskInfo) -> bool + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
pub struct DeepCleanupReport {
    pub locks_reclaimed: usize,
    pub tasks_rescued: usize,
}

pub struct Sweeper {
    store: Arc<dyn KvStore>,
    locks: LockCoordinator,
}

impl Sweeper {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let locks = LockCoordinator::new(store.clone());
        Sweeper { store, locks }
    }

    /// Pages all tasks with `monitorId = QUEUED_SENTINEL`, matched by an
    /// optional filter, and returns their ids (spec.md §4.7 "Pages all
    /// tasks... and enqueues them").
    pub async fn find_queued(&self, filter: Option<&TaskFilter>) -> DispatchResult<Vec<TaskId>> {
        let mut ids = Vec::new();
        let mut token = None;
        loop {
            let req = ScanRequest::new("by_monitor", QUEUED_SENTINEL).with_start_after(token);
            let page = self.store.query_by_index(Table::Tasks, req).await?;
            for item in &page.items {
                let task = item_to_task(item)?;
                if filter.map(|f| f(&task)).unwrap_or(true) {
                    ids.push(task.task_id);
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    /// Deep cleanup (spec.md §4.7): reclaims locks abandoned by terminal
    /// tasks, then rescues waiting tasks the release path should already
    /// have woken.
    pub async fn deep_cleanup(&self) -> DispatchResult<DeepCleanupReport> {
        let locks_reclaimed = self.reclaim_abandoned_locks().await?;
        let tasks_rescued = self.rescue_waiting_tasks().await?;
        if tasks_rescued > 0 {
            error!(
                tasks_rescued,
                "deep-cleanup sweep rescued waiting tasks that release should have woken"
            );
        }
        Ok(DeepCleanupReport { locks_reclaimed, tasks_rescued })
    }

    /// Step 1: scan every held lock row (`TASK_ID_NONE` range key only,
    /// across every lock id) and delete the ones whose owning task has gone
    /// terminal without releasing.
    async fn reclaim_abandoned_locks(&self) -> DispatchResult<usize> {
        let mut reclaimed = 0;
        let mut token = None;
        loop {
            let req = FullScanRequest::new("by_lock").with_start_after(token);
            let page = self.store.scan_by_index(Table::Locks, req).await?;
            for item in &page.items {
                let Ok(LockRow::Held { lock_id, monitor_id, running_task_id, tasks_queued }) =
                    item_to_lock_row(item)
                else {
                    continue;
                };
                if self.locks.task_is_terminal(running_task_id).await?
                    && self.locks.delete_abandoned(&lock_id, &monitor_id, tasks_queued).await?
                {
                    reclaimed += 1;
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(reclaimed)
    }

    /// Step 2: scan every task with `monitorId = WAITING_SENTINEL` and flip
    /// any whose prerequisites and locks are now clear back to QUEUED.
    async fn rescue_waiting_tasks(&self) -> DispatchResult<usize> {
        let mut rescued = 0;
        let mut token = None;
        loop {
            let req = ScanRequest::new("by_monitor", WAITING_SENTINEL).with_start_after(token);
            let page = self.store.query_by_index(Table::Tasks, req).await?;
            for item in &page.items {
                let task = item_to_task(item)?;
                if !self
                    .locks
                    .prerequisites_satisfied(&task.prerequisite_task_ids, task.any_prerequisite)
                    .await?
                {
                    continue;
                }
                let mut all_free = true;
                for lock_id in &task.lock_ids {
                    if !self.locks.is_free(lock_id).await? {
                        all_free = false;
                        break;
                    }
                }
                if !all_free {
                    continue;
                }
                if self.try_wake_waiting_task(task.task_id).await? {
                    rescued += 1;
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(rescued)
    }

    async fn try_wake_waiting_task(&self, task_id: TaskId) -> DispatchResult<bool> {
        let guard = Predicate::eq("mid", WAITING_SENTINEL);
        let sets = vec![
            ("mid".to_string(), AttrValue::S(QUEUED_SENTINEL.to_string())),
            ("stat".to_string(), AttrValue::S(warden_lib::TaskState::Queued.to_code().to_string())),
        ];
        match self
            .store
            .conditional_merge(Table::Tasks, &task_id.get().to_string(), None, sets, vec![], guard)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::PreconditionFailed) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Monitor-death recovery (spec.md §4.7 "Monitor-death recovery"),
    /// driven externally when the heartbeat registry reports `dead_monitor_id`
    /// gone. Releases every lock it held (waking all waiters on each) and
    /// flips every task it still owned back to QUEUED, returning their ids
    /// so the caller can enqueue them.
    pub async fn release_locks_for_monitor(&self, dead_monitor_id: &str) -> DispatchResult<Vec<TaskId>> {
        let mut token = None;
        loop {
            let req = ScanRequest::new("by_monitor", dead_monitor_id).with_start_after(token);
            let page = self.store.query_by_index(Table::Locks, req).await?;
            for item in &page.items {
                if let Ok(LockRow::Held { lock_id, .. }) = item_to_lock_row(item) {
                    self.locks.force_release_for_monitor(&lock_id, dead_monitor_id).await?;
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let mut recovered = Vec::new();
        let mut token = None;
        loop {
            let req = ScanRequest::new("by_monitor", dead_monitor_id).with_start_after(token);
            let page = self.store.query_by_index(Table::Tasks, req).await?;
            for item in &page.items {
                let task = item_to_task(item)?;
                if self.flip_to_queued_from(task.task_id, dead_monitor_id).await? {
                    recovered.push(task.task_id);
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(recovered)
    }

    async fn flip_to_queued_from(&self, task_id: TaskId, dead_monitor_id: &str) -> DispatchResult<bool> {
        let guard = Predicate::eq("mid", dead_monitor_id.to_string());
        let sets = vec![
            ("mid".to_string(), AttrValue::S(QUEUED_SENTINEL.to_string())),
            ("stat".to_string(), AttrValue::S(warden_lib::TaskState::Queued.to_code().to_string())),
        ];
        match self
            .store
            .conditional_merge(Table::Tasks, &task_id.get().to_string(), None, sets, vec![], guard)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::PreconditionFailed) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
