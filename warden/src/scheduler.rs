//! The public API (spec.md §4.8, component C8): wires the KV façade, the
//! task/lock codec, the lock coordinator + state machine, and the
//! dispatcher + sweepers behind `add`/`delete`/`cancel`/`update`/query plus
//! terminal-state subscriptions. Nothing downstream of this module should
//! ever touch `warden_store`/`warden_tasks` internals directly.

use std::sync::Arc;

use warden_lib::{TaskId, TaskState, WardenError, WardenResult, QUEUED_SENTINEL, WAITING_SENTINEL};
use warden_store::{
    AttrValue, FullScanRequest, InMemorySequence, InMemoryStore, KvStore, Page, PageToken, Predicate,
    ScanRequest, Sequence, StoreError, Table,
};
use warden_tasks::{
    item_to_task, task_to_item, HandlerRegistry, LockCoordinator, Monitor, SubscriberRegistry, SubscriptionId,
    TaskBuilder, TaskHandler, TaskInfo, TerminalSubscriber,
};

use warden_dispatch::{Dispatcher, DispatcherHealth, TaskFilter};

use crate::config::SchedulerConfig;
use crate::registry::HandlerMap;

/// A paged, decoded view of the task table, mirroring `warden_store::Page`
/// but over [`TaskInfo`] rather than raw [`warden_store::Item`] rows.
pub type TaskPage = Page<TaskInfo>;

/// The facade over the whole warden stack: one per process, shared (it is
/// cheaply `Clone`-able — every field is `Arc`-backed or itself `Clone`).
/// Constructing a `TaskScheduler` does not start any background work;
/// call [`TaskScheduler::monitor_task_queue`] for that.
#[derive(Clone)]
pub struct TaskScheduler {
    store: Arc<dyn KvStore>,
    seq: Arc<dyn Sequence>,
    handlers: HandlerMap,
    dispatcher: Dispatcher,
    locks: LockCoordinator,
}

impl TaskScheduler {
    /// Wires a scheduler over caller-supplied collaborators: a store, an id
    /// sequence, and a monitor context (spec.md §6's external contracts).
    pub fn new(
        store: Arc<dyn KvStore>,
        seq: Arc<dyn Sequence>,
        monitor: Arc<dyn Monitor>,
        config: SchedulerConfig,
    ) -> Self {
        let handlers = HandlerMap::new();
        let dispatcher =
            Dispatcher::new(store.clone(), monitor, Arc::new(handlers.clone()), config.dispatcher_config());
        let locks = LockCoordinator::new(store.clone());
        TaskScheduler { store, seq, handlers, dispatcher, locks }
    }

    /// Convenience constructor for tests and single-node demos: an
    /// in-memory store and sequence, regardless of `config.store` (which is
    /// ignored here — use [`TaskScheduler::new`] directly for a Redis-backed
    /// scheduler, since `RedisSequence` needs a concrete `RedisStore`
    /// reference [`warden_store::open_store`] cannot hand back once erased
    /// to `Arc<dyn KvStore>`).
    pub fn in_memory(monitor: Arc<dyn Monitor>, config: SchedulerConfig) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq: Arc<dyn Sequence> = Arc::new(InMemorySequence::new());
        Self::new(store, seq, monitor, config)
    }

    /// The id sequence this scheduler mints task ids from; builders read it
    /// via `task_builder.build(scheduler.sequence())`.
    pub fn sequence(&self) -> &Arc<dyn Sequence> {
        &self.seq
    }

    pub fn register_handler(&self, entity_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(entity_type, handler);
    }

    pub fn deregister_handler(&self, entity_type: &str) {
        self.handlers.deregister(entity_type);
    }

    /// `createTask()` (spec.md §4.8): a fresh, unassigned builder. Call
    /// `.build(scheduler.sequence())` on it, then [`TaskScheduler::add_task`].
    pub fn create_task(&self) -> TaskBuilder {
        TaskBuilder::new()
    }

    /// `addTask(t)` (spec.md §4.8): validates `entity_type`/`entity_id` are
    /// non-empty and a handler is registered for `entity_type`, resets
    /// run-time fields to a fresh QUEUED task, persists, and enqueues.
    pub async fn add_task(&self, mut task: TaskInfo) -> WardenResult<TaskInfo> {
        if task.entity_type.is_empty() {
            return Err(WardenError::InvalidArgument("entity_type is required".into()));
        }
        if task.entity_id.is_empty() {
            return Err(WardenError::InvalidArgument("entity_id is required".into()));
        }
        if !self.handlers.contains(&task.entity_type) {
            return Err(WardenError::InvalidArgument(format!(
                "no handler registered for entity type {}",
                task.entity_type
            )));
        }

        task.task_state = TaskState::Queued;
        task.monitor_id = warden_tasks::MonitorSlot::Queued;
        task.start_time = None;
        task.end_time = None;
        task.run_count = 0;
        task.requeues = 0;
        task.canceled_by = None;
        task.error_message = None;
        task.error_stack_trace = None;
        task.error_id = None;

        // Establishes the prerequisite barrier before the task is visible to
        // anyone (spec.md §3 "held for the entire lifetime of task T") — a
        // dependent task added afterward with this one as a prerequisite
        // must never see it as terminal just because it hasn't run yet.
        self.locks.create_barrier(task.task_id).await?;

        let item = task_to_item(&task);
        self.store.put(Table::Tasks, &task.task_id.get().to_string(), None, item, Predicate::Always).await?;
        self.dispatcher.submit(task.task_id).await;
        Ok(task)
    }

    /// `deleteTask(id)` (spec.md §4.8): deletes iff `mid` is absent,
    /// `QUEUED_SENTINEL`, or `WAITING_SENTINEL`.
    pub async fn delete_task(&self, task_id: TaskId) -> WardenResult<()> {
        let guard = Predicate::or([
            Predicate::not_exists("mid"),
            Predicate::eq("mid", QUEUED_SENTINEL),
            Predicate::eq("mid", WAITING_SENTINEL),
        ]);
        match self.store.conditional_delete(Table::Tasks, &task_id.get().to_string(), None, guard).await {
            Ok(()) => Ok(()),
            Err(StoreError::PreconditionFailed) => Err(WardenError::InvalidArgument(format!(
                "task {task_id} is running or terminal and cannot be deleted"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// `cancelTask(by, id)` (spec.md §4.8): sets `canceledBy` iff a
    /// `mid` exists (terminal tasks are silently ignored); if the task was
    /// WAITING_FOR_* on a lock/prerequisite, also flips it to QUEUED and
    /// enqueues it so cancellation is observed on the next claim attempt.
    pub async fn cancel_task(&self, canceled_by: impl Into<String>, task_id: TaskId) -> WardenResult<()> {
        let pk = task_id.get().to_string();
        let guard = Predicate::exists("mid");
        let sets = vec![("cancel".to_string(), AttrValue::S(canceled_by.into()))];
        match self.store.conditional_merge(Table::Tasks, &pk, None, sets, vec![], guard).await {
            Ok(item) => {
                let task = item_to_task(&item)?;
                if task.monitor_id.is_waiting() {
                    self.flip_waiting_to_queued(task_id).await?;
                }
                Ok(())
            }
            Err(StoreError::PreconditionFailed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `updateTask(bytes, id)` (spec.md §4.8): sets `updateData` iff a
    /// `mid` exists, with the same WAITING-to-QUEUED re-queue rule as
    /// [`TaskScheduler::cancel_task`].
    pub async fn update_task(&self, data: Vec<u8>, task_id: TaskId) -> WardenResult<()> {
        let pk = task_id.get().to_string();
        let guard = Predicate::exists("mid");
        let sets = vec![("upd".to_string(), AttrValue::B(data))];
        match self.store.conditional_merge(Table::Tasks, &pk, None, sets, vec![], guard).await {
            Ok(item) => {
                let task = item_to_task(&item)?;
                if task.monitor_id.is_waiting() {
                    self.flip_waiting_to_queued(task_id).await?;
                }
                Ok(())
            }
            Err(StoreError::PreconditionFailed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flip_waiting_to_queued(&self, task_id: TaskId) -> WardenResult<()> {
        let guard = Predicate::eq("mid", WAITING_SENTINEL);
        let sets = vec![
            ("mid".to_string(), AttrValue::S(QUEUED_SENTINEL.to_string())),
            ("stat".to_string(), AttrValue::S(TaskState::Queued.to_code().to_string())),
        ];
        match self.store.conditional_merge(Table::Tasks, &task_id.get().to_string(), None, sets, vec![], guard).await
        {
            Ok(_) => {
                self.dispatcher.submit(task_id).await;
                Ok(())
            }
            Err(StoreError::PreconditionFailed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Query by id.
    pub async fn get_task(&self, task_id: TaskId) -> WardenResult<Option<TaskInfo>> {
        match self.store.get(Table::Tasks, &task_id.get().to_string(), None).await? {
            Some(item) => Ok(Some(item_to_task(&item)?)),
            None => Ok(None),
        }
    }

    /// Query by entity type, paged, every task state.
    pub async fn tasks_by_entity_type(
        &self,
        entity_type: &str,
        limit: usize,
        start_after: Option<PageToken>,
    ) -> WardenResult<TaskPage> {
        self.query_index("by_entity", entity_type, None, limit, start_after).await
    }

    /// Query by entity type and an `entityId` prefix, paged, every task state.
    pub async fn tasks_by_entity(
        &self,
        entity_type: &str,
        entity_id_prefix: &str,
        limit: usize,
        start_after: Option<PageToken>,
    ) -> WardenResult<TaskPage> {
        self.query_index("by_entity", entity_type, Some(entity_id_prefix), limit, start_after).await
    }

    /// As [`TaskScheduler::tasks_by_entity_type`], restricted to non-terminal tasks.
    pub async fn non_terminal_tasks_by_entity_type(
        &self,
        entity_type: &str,
        limit: usize,
        start_after: Option<PageToken>,
    ) -> WardenResult<TaskPage> {
        self.query_index("by_entity_nt", entity_type, None, limit, start_after).await
    }

    /// As [`TaskScheduler::tasks_by_entity`], restricted to non-terminal tasks.
    pub async fn non_terminal_tasks_by_entity(
        &self,
        entity_type: &str,
        entity_id_prefix: &str,
        limit: usize,
        start_after: Option<PageToken>,
    ) -> WardenResult<TaskPage> {
        self.query_index("by_entity_nt", entity_type, Some(entity_id_prefix), limit, start_after).await
    }

    /// Every non-terminal task in the system, regardless of entity type,
    /// paged (spec.md §4.8 "all non-terminal").
    pub async fn all_non_terminal_tasks(&self, limit: usize, start_after: Option<PageToken>) -> WardenResult<TaskPage> {
        self.full_scan("by_entity_nt", limit, start_after).await
    }

    /// Every task in the system, paged (spec.md §4.8 "all tasks").
    pub async fn all_tasks(&self, limit: usize, start_after: Option<PageToken>) -> WardenResult<TaskPage> {
        self.full_scan("by_entity", limit, start_after).await
    }

    async fn query_index(
        &self,
        index: &'static str,
        hash: &str,
        range_prefix: Option<&str>,
        limit: usize,
        start_after: Option<PageToken>,
    ) -> WardenResult<TaskPage> {
        let mut req = ScanRequest::new(index, hash).with_limit(limit).with_start_after(start_after);
        if let Some(prefix) = range_prefix {
            req = req.with_range_prefix(prefix);
        }
        let page = self.store.query_by_index(Table::Tasks, req).await?;
        self.decode_page(page)
    }

    async fn full_scan(
        &self,
        index: &'static str,
        limit: usize,
        start_after: Option<PageToken>,
    ) -> WardenResult<TaskPage> {
        let req = FullScanRequest::new(index).with_limit(limit).with_start_after(start_after);
        let page = self.store.scan_by_index(Table::Tasks, req).await?;
        self.decode_page(page)
    }

    fn decode_page(&self, page: Page<warden_store::Item>) -> WardenResult<TaskPage> {
        let items = page.items.iter().map(item_to_task).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, page.next))
    }

    /// `addOnTerminalState(handler)` (spec.md §4.8).
    pub fn add_on_terminal_state(&self, subscriber: Arc<dyn TerminalSubscriber>) -> SubscriptionId {
        self.dispatcher.subscribers().add(subscriber)
    }

    /// `removeOnTerminalState(handler)` (spec.md §4.8).
    pub fn remove_on_terminal_state(&self, id: SubscriptionId) {
        self.dispatcher.subscribers().remove(id)
    }

    /// `monitorTaskQueue([predicate])` (spec.md §4.8): starts the
    /// dispatcher's drive loop and the periodic sweep loop in the
    /// background. Idempotent to call more than once is *not* guaranteed —
    /// callers should call this exactly once per scheduler instance.
    pub fn monitor_task_queue(&self, filter: Option<TaskFilter>) {
        self.dispatcher.serve_in_background();
        self.dispatcher.spawn_sweep_loop(filter);
    }

    /// `stopTaskQueueMonitor(forceInterrupt)` (spec.md §4.8): cancels all
    /// outstanding background work and blocks until drained (or escalation
    /// to `force_interrupt` is exhausted).
    pub async fn stop_task_queue_monitor(&self, force_interrupt: bool) {
        self.dispatcher.shutdown(force_interrupt).await;
    }

    /// Monitor-death recovery (spec.md §4.7), invoked by the caller's own
    /// heartbeat registry when it observes `dead_monitor_id` gone.
    pub async fn release_locks_for_monitor(&self, dead_monitor_id: &str) -> WardenResult<Vec<TaskId>> {
        Ok(self.dispatcher.release_locks_for_monitor(dead_monitor_id).await?)
    }

    /// SPEC_FULL §2 `SchedulerHandle::health()`: a cheap, non-blocking
    /// operational snapshot.
    pub fn health(&self) -> DispatcherHealth {
        self.dispatcher.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SimpleMonitor;
    use async_trait::async_trait;
    use warden_tasks::TaskContext;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<Option<warden_tasks::TaskUpdate>, String> {
            Ok(None)
        }
    }

    fn scheduler() -> TaskScheduler {
        let monitor = Arc::new(SimpleMonitor::new("m1", "node-a"));
        TaskScheduler::in_memory(monitor, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn add_task_without_a_handler_is_rejected() {
        let scheduler = scheduler();
        let task = scheduler.create_task().entity_type("echo").entity_id("e1").build(scheduler.sequence()).await.unwrap();
        let err = scheduler.add_task(task).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_success() {
        let scheduler = scheduler();
        scheduler.register_handler("echo", Arc::new(EchoHandler));
        let task = scheduler.create_task().entity_type("echo").entity_id("e1").build(scheduler.sequence()).await.unwrap();
        let task_id = task.task_id;
        scheduler.add_task(task).await.unwrap();

        scheduler.monitor_task_queue(None);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Some(found) = scheduler.get_task(task_id).await.unwrap() {
                    if found.task_state == TaskState::Success {
                        break;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should reach SUCCESS");

        scheduler.stop_task_queue_monitor(true).await;
    }

    #[tokio::test]
    async fn delete_task_rejects_a_running_task() {
        let scheduler = scheduler();
        scheduler.register_handler("echo", Arc::new(EchoHandler));
        let task = scheduler.create_task().entity_type("echo").entity_id("e1").build(scheduler.sequence()).await.unwrap();
        let task_id = task.task_id;
        let mut running = scheduler.add_task(task).await.unwrap();
        running.task_state = TaskState::Running;
        running.monitor_id = warden_tasks::MonitorSlot::Owned("m1".into());
        scheduler
            .store
            .put(Table::Tasks, &task_id.get().to_string(), None, task_to_item(&running), Predicate::Always)
            .await
            .unwrap();

        let err = scheduler.delete_task(task_id).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_is_a_silent_no_op() {
        let scheduler = scheduler();
        scheduler.register_handler("echo", Arc::new(EchoHandler));
        let task = scheduler.create_task().entity_type("echo").entity_id("e1").build(scheduler.sequence()).await.unwrap();
        let task_id = task.task_id;
        let mut terminal = scheduler.add_task(task).await.unwrap();
        terminal.task_state = TaskState::Success;
        terminal.monitor_id = warden_tasks::MonitorSlot::None;
        scheduler
            .store
            .put(Table::Tasks, &task_id.get().to_string(), None, task_to_item(&terminal), Predicate::Always)
            .await
            .unwrap();

        scheduler.cancel_task("alice", task_id).await.unwrap();
        let reloaded = scheduler.get_task(task_id).await.unwrap().unwrap();
        assert!(reloaded.canceled_by.is_none());
    }

    #[tokio::test]
    async fn query_by_entity_type_returns_every_task() {
        let scheduler = scheduler();
        scheduler.register_handler("echo", Arc::new(EchoHandler));
        for i in 0..3 {
            let task = scheduler
                .create_task()
                .entity_type("echo")
                .entity_id(format!("e{i}"))
                .build(scheduler.sequence())
                .await
                .unwrap();
            scheduler.add_task(task).await.unwrap();
        }

        let page = scheduler.tasks_by_entity_type("echo", 10, None).await.unwrap();
        assert_eq!(page.len(), 3);
    }
}
