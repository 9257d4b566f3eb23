//! The task state machine (spec.md §4.5, component C5): claim, branch on
//! the task body, invoke the handler, finalize, persist, release locks.
//!
//! One call to [`TaskEngine::attempt`] is one full pass of this machine for
//! one task id. Dispatching which task ids to attempt, and when, is the
//! dispatcher's job (component C6), not this crate's.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};
use warden_lib::{TaskState, NO_HANDLER_RETRY_MS, QUEUED_SENTINEL};
use warden_store::{KvStore, Predicate, StoreError, Table};

use crate::codec::task_to_item;
use crate::error::{TaskError, TaskResult};
use crate::handler::{HandlerRegistry, Monitor, TaskContext, TaskUpdate};
use crate::locks::{AcquireOutcome, LockCoordinator, PrereqOutcome};
use crate::model::{MonitorSlot, TaskInfo, TaskSnapshot};
use crate::subscribers::SubscriberRegistry;

/// What one [`TaskEngine::attempt`] call did with a task id.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Another monitor claimed it first (or it was no longer QUEUED by the
    /// time we tried); nothing to do.
    LostRace,
    /// Reached a terminal state this attempt.
    Terminal(TaskSnapshot),
    /// Parked as WAITING_FOR_INTERVAL; caller should re-attempt no sooner
    /// than `milliseconds_remaining` from now.
    Sleeping { milliseconds_remaining: i64 },
    /// Parked as WAITING_FOR_PREREQUISITE or WAITING_FOR_LOCK; a release
    /// elsewhere will flip it back to QUEUED.
    Blocked,
    /// The handler asked for changes that force an automatic re-queue
    /// (spec.md §4.5 "Finalize"); caller should re-enqueue `task_id`
    /// immediately rather than wait for the next sweep.
    Requeued(warden_lib::TaskId),
}

/// Runs the claim → branch → execute → finalize → persist → release
/// sequence for one task at a time. Stateless beyond its store handle and
/// lock coordinator; safe to share across worker tasks.
pub struct TaskEngine {
    store: Arc<dyn KvStore>,
    locks: LockCoordinator,
    subscribers: Arc<SubscriberRegistry>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let locks = LockCoordinator::new(store.clone());
        TaskEngine { store, locks, subscribers: Arc::new(SubscriberRegistry::new()) }
    }

    /// The shared terminal-state subscriber registry (spec.md §4.8
    /// `addOnTerminalState`/`removeOnTerminalState`); the facade crate reads
    /// this handle to add and remove subscribers without owning the engine.
    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    pub async fn attempt(
        &self,
        task_id: warden_lib::TaskId,
        monitor: &dyn Monitor,
        registry: &dyn HandlerRegistry,
    ) -> TaskResult<AttemptOutcome> {
        let Some(mut task) = self.claim(task_id, monitor.monitor_id()).await? else {
            return Ok(AttemptOutcome::LostRace);
        };
        let requeues_at_claim = task.requeues;

        // Transfers the barrier (held since `addTask` by a placeholder
        // owner, see `LockCoordinator::create_barrier`) to this monitor via
        // the re-entrant `rtid = taskId` branch of "Acquire", unconditionally
        // and before any branch below — every branch's eventual
        // finalize/release assumes this monitor already owns the barrier.
        self.locks.acquire_barrier(task_id, monitor.monitor_id()).await?;

        if let Some(canceled_by) = task.canceled_by.clone() {
            warn!(%task_id, %canceled_by, "claimed task already marked canceled");
            task.task_state = TaskState::Canceled;
            task.end_time = Some(now_millis());
            self.finalize_terminal(task, monitor, &[]).await.map(AttemptOutcome::Terminal)
        } else if task.update_data.is_none() && task.milliseconds_remaining.is_some() {
            self.enter_sleep(task, monitor, requeues_at_claim).await
        } else {
            self.run_body(task, requeues_at_claim, monitor, registry).await
        }
    }

    /// Claim step (spec.md §4.5): conditional update guarded by
    /// `mid = QUEUED_SENTINEL`, setting `mid = me`, `stat = RUNNING`,
    /// `startTime` and incrementing `runCount`.
    async fn claim(&self, task_id: warden_lib::TaskId, monitor_id: &str) -> TaskResult<Option<TaskInfo>> {
        let pk = task_id.get().to_string();
        let guard = Predicate::eq("mid", QUEUED_SENTINEL.to_string());
        let sets = vec![
            ("mid".to_string(), warden_store::AttrValue::S(monitor_id.to_string())),
            ("stat".to_string(), warden_store::AttrValue::S(TaskState::Running.to_code().to_string())),
            ("ts".to_string(), warden_store::AttrValue::N(now_millis())),
        ];
        match self.store.conditional_merge(Table::Tasks, &pk, None, sets, vec![("cnt".to_string(), 1)], guard).await
        {
            Ok(item) => Ok(Some(crate::codec::item_to_task(&item)?)),
            Err(StoreError::PreconditionFailed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sleep-timer branch (spec.md §4.5): keeps the monitor's own id in
    /// `mid` (not handed over to a sentinel) and parks as
    /// WAITING_FOR_INTERVAL. The barrier (acquired in `attempt`) stays held,
    /// so prerequisite waiters on this task continue to see it as
    /// non-terminal.
    async fn enter_sleep(
        &self,
        mut task: TaskInfo,
        monitor: &dyn Monitor,
        requeues_at_claim: i64,
    ) -> TaskResult<AttemptOutcome> {
        task.task_state = TaskState::WaitingForInterval;
        let remaining = task.milliseconds_remaining.unwrap_or(0);
        self.persist_owned(&task, monitor.monitor_id(), requeues_at_claim).await?;
        Ok(AttemptOutcome::Sleeping { milliseconds_remaining: remaining })
    }

    /// The prerequisite/lock/handler branch: everything after the claim
    /// that is not the sleep-timer or already-canceled shortcut.
    async fn run_body(
        &self,
        mut task: TaskInfo,
        requeues_at_claim: i64,
        monitor: &dyn Monitor,
        registry: &dyn HandlerRegistry,
    ) -> TaskResult<AttemptOutcome> {
        let task_id = task.task_id;

        match self.locks.check_prerequisites(task_id, &task.prerequisite_task_ids, task.any_prerequisite).await? {
            PrereqOutcome::Waiting => {
                task.task_state = TaskState::WaitingForPrerequisite;
                return self.persist_waiting(task, monitor, requeues_at_claim).await;
            }
            PrereqOutcome::Clear => {}
        }

        let held_locks = match self.locks.acquire(task_id, &task.lock_ids, monitor.monitor_id()).await? {
            AcquireOutcome::Acquired(ids) => ids,
            AcquireOutcome::Waiting => {
                task.task_state = TaskState::WaitingForLock;
                return self.persist_waiting(task, monitor, requeues_at_claim).await;
            }
        };

        let Some(handler) = registry.get(&task.entity_type) else {
            warn!(entity_type = %task.entity_type, %task_id, "no handler registered, parking");
            self.locks.release(task_id, &held_locks, false, monitor.monitor_id()).await?;
            task.task_state = TaskState::WaitingForInterval;
            task.milliseconds_remaining = Some(NO_HANDLER_RETRY_MS);
            self.persist_owned(&task, monitor.monitor_id(), requeues_at_claim).await?;
            return Ok(AttemptOutcome::Sleeping { milliseconds_remaining: NO_HANDLER_RETRY_MS });
        };

        let ctx = TaskContext::new(task.clone(), monitor.monitor_id().to_string(), self.store.clone());
        let result = handler.handle(&ctx).await;

        let finalized = self.apply_finalize(task, result);
        self.finalize_terminal(finalized, monitor, &held_locks).await.map(|snap| {
            if snap.task.task_state == TaskState::Queued {
                AttemptOutcome::Requeued(snap.task.task_id)
            } else {
                AttemptOutcome::Terminal(snap)
            }
        })
    }

    /// Applies the handler's outcome to the claimed task (spec.md §4.5
    /// "Finalize"), deciding between SUCCESS/FAILED and an automatic
    /// re-queue to QUEUED.
    fn apply_finalize(&self, mut task: TaskInfo, result: Result<Option<TaskUpdate>, String>) -> TaskInfo {
        task.end_time = Some(now_millis());
        match result {
            Err(message) => {
                task.task_state = TaskState::Failed;
                task.error_message = Some(message);
                task.error_id = Some(fresh_error_id());
                task
            }
            Ok(update) => {
                let mut lock_ids_changed = false;
                let mut prereq_changed = false;
                let mut sleep_requested = false;
                let mut update_pending = false;

                if let Some(update) = update {
                    if let Some(lock_ids) = update.lock_ids {
                        lock_ids_changed = lock_ids != task.lock_ids;
                        task.lock_ids = lock_ids;
                    }
                    if let Some(prereqs) = update.prerequisite_task_ids {
                        prereq_changed = prereqs != task.prerequisite_task_ids;
                        task.prerequisite_task_ids = prereqs;
                    }
                    if let Some(millis) = update.milliseconds_remaining {
                        sleep_requested = true;
                        task.milliseconds_remaining = Some(millis);
                    }
                    if let Some(data) = update.update_data {
                        update_pending = true;
                        task.update_data = Some(data);
                    }
                }

                if lock_ids_changed || prereq_changed || sleep_requested || update_pending {
                    task.task_state = TaskState::Queued;
                    task.monitor_id = MonitorSlot::Queued;
                    task.canceled_by = None;
                } else {
                    task.task_state = TaskState::Success;
                    task.update_data = None;
                }
                task
            }
        }
    }

    /// Persists a terminal (or auto-requeued) outcome, always releasing
    /// locks afterward regardless of whether the persist itself succeeds,
    /// then invokes terminal subscribers if truly terminal.
    async fn finalize_terminal(
        &self,
        mut task: TaskInfo,
        monitor: &dyn Monitor,
        held_locks: &[String],
    ) -> TaskResult<TaskSnapshot> {
        let task_id = task.task_id;
        let is_terminal = task.task_state.is_terminal();
        if is_terminal {
            task.monitor_id = MonitorSlot::None;
        }

        let guard = Predicate::eq("mid", monitor.monitor_id().to_string());
        let item = task_to_item(&task);
        let persisted = self.store.put(Table::Tasks, &task_id.get().to_string(), None, item, guard).await;

        // Locks release regardless of whether the persist above landed: a
        // lost `mid = me` guard means another monitor already owns this
        // task (and will release on its own terms), but our own process no
        // longer has any business holding locks for it.
        let release_result = self.locks.release(task_id, held_locks, is_terminal, monitor.monitor_id()).await;

        match persisted {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed) => {
                monitor.force_heartbeat_failure();
                return Err(TaskError::LostLock(format!("finalize persist for task {task_id}")));
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = release_result {
            error!(%task_id, error = %e, "failed releasing locks after finalize");
        }

        let snapshot = TaskSnapshot::new(task);
        if is_terminal {
            self.subscribers.notify_all(&snapshot);
        }
        Ok(snapshot)
    }

    /// Persists a WAITING_FOR_LOCK/WAITING_FOR_PREREQUISITE transition,
    /// guarded by both `mid = me` and `requeues = valueReadAtClaim`
    /// (spec.md §4.5 "Persist"). Losing the fence means a release elsewhere
    /// already woke this task while we were still computing the wait, so we
    /// must not strand it — rewrite to QUEUED and report it as such instead.
    async fn persist_waiting(
        &self,
        mut task: TaskInfo,
        monitor: &dyn Monitor,
        requeues_at_claim: i64,
    ) -> TaskResult<AttemptOutcome> {
        let task_id = task.task_id;
        task.monitor_id = MonitorSlot::Waiting;
        let guard = Predicate::and([
            Predicate::eq("mid", monitor.monitor_id().to_string()),
            Predicate::eq("agn", requeues_at_claim),
        ]);
        let item = task_to_item(&task);
        match self.store.put(Table::Tasks, &task_id.get().to_string(), None, item, guard).await {
            Ok(()) => Ok(AttemptOutcome::Blocked),
            Err(StoreError::PreconditionFailed) => {
                // Lost the wakeup race: force this task back to QUEUED
                // ourselves rather than leave it parked on a wake that
                // already happened.
                task.task_state = TaskState::Queued;
                task.monitor_id = MonitorSlot::Queued;
                self.persist_owned(&task, monitor.monitor_id(), requeues_at_claim).await?;
                Ok(AttemptOutcome::Requeued(task_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persists a transition that keeps this monitor's own id in `mid`
    /// (WAITING_FOR_INTERVAL, or the forced-requeue fallback from
    /// [`Self::persist_waiting`]): guarded by `mid = me` alone, no fence.
    async fn persist_owned(&self, task: &TaskInfo, monitor_id: &str, _requeues_at_claim: i64) -> TaskResult<()> {
        let guard = Predicate::eq("mid", monitor_id.to_string());
        let item = task_to_item(task);
        match self.store.put(Table::Tasks, &task.task_id.get().to_string(), None, item, guard).await {
            Ok(()) => Ok(()),
            Err(StoreError::PreconditionFailed) => {
                Err(TaskError::LostLock(format!("persist for task {}", task.task_id)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A fresh v4 UUID for `errorId` (spec.md §3).
fn fresh_error_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerRegistry, Monitor, TaskHandler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use warden_store::{InMemorySequence, InMemoryStore, Sequence};

    struct FixedMonitor {
        id: String,
        failed: AtomicBool,
    }

    impl FixedMonitor {
        fn new(id: &str) -> Self {
            FixedMonitor { id: id.to_string(), failed: AtomicBool::new(false) }
        }
    }

    impl Monitor for FixedMonitor {
        fn monitor_id(&self) -> &str {
            &self.id
        }
        fn node_name(&self) -> &str {
            "test-node"
        }
        fn has_failed_heartbeat(&self) -> bool {
            self.failed.load(Ordering::SeqCst)
        }
        fn force_heartbeat_failure(&self) {
            self.failed.store(true, Ordering::SeqCst);
        }
        fn is_active_monitor(&self) -> bool {
            !self.has_failed_heartbeat()
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<Option<TaskUpdate>, String> {
            Ok(None)
        }
    }

    struct FailHandler;

    #[async_trait]
    impl TaskHandler for FailHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<Option<TaskUpdate>, String> {
            Err("boom".to_string())
        }
    }

    struct SingleHandlerRegistry(Arc<dyn TaskHandler>);

    impl HandlerRegistry for SingleHandlerRegistry {
        fn get(&self, _entity_type: &str) -> Option<Arc<dyn TaskHandler>> {
            Some(self.0.clone())
        }
    }

    struct EmptyRegistry;

    impl HandlerRegistry for EmptyRegistry {
        fn get(&self, _entity_type: &str) -> Option<Arc<dyn TaskHandler>> {
            None
        }
    }

    async fn seed_task(store: &Arc<dyn KvStore>, seq: &InMemorySequence) -> TaskInfo {
        let task = crate::model::TaskBuilder::new()
            .entity_type("echo")
            .entity_id("e1")
            .build(seq)
            .await
            .unwrap();
        store
            .put(Table::Tasks, &task.task_id.get().to_string(), None, task_to_item(&task), Predicate::Always)
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn successful_handler_reaches_success() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = seed_task(&store, &seq).await;

        let engine = TaskEngine::new(store);
        let monitor = FixedMonitor::new("m1");
        let registry = SingleHandlerRegistry(Arc::new(EchoHandler));

        let outcome = engine.attempt(task.task_id, &monitor, &registry).await.unwrap();
        match outcome {
            AttemptOutcome::Terminal(snapshot) => {
                assert_eq!(snapshot.task.task_state, TaskState::Success);
                assert!(matches!(snapshot.task.monitor_id, MonitorSlot::None));
            }
            other => panic!("expected Terminal(Success), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_handler_reaches_failed_with_error_id() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = seed_task(&store, &seq).await;

        let engine = TaskEngine::new(store);
        let monitor = FixedMonitor::new("m1");
        let registry = SingleHandlerRegistry(Arc::new(FailHandler));

        let outcome = engine.attempt(task.task_id, &monitor, &registry).await.unwrap();
        match outcome {
            AttemptOutcome::Terminal(snapshot) => {
                assert_eq!(snapshot.task.task_state, TaskState::Failed);
                assert_eq!(snapshot.task.error_message.as_deref(), Some("boom"));
                assert!(snapshot.task.error_id.is_some());
            }
            other => panic!("expected Terminal(Failed), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_parks_as_sleeping() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = seed_task(&store, &seq).await;

        let engine = TaskEngine::new(store);
        let monitor = FixedMonitor::new("m1");
        let registry = EmptyRegistry;

        let outcome = engine.attempt(task.task_id, &monitor, &registry).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Sleeping { milliseconds_remaining } if milliseconds_remaining == NO_HANDLER_RETRY_MS));
    }

    #[tokio::test]
    async fn second_claim_attempt_loses_the_race() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = seed_task(&store, &seq).await;

        let engine = TaskEngine::new(store);
        let m1 = FixedMonitor::new("m1");
        let m2 = FixedMonitor::new("m2");
        let registry = SingleHandlerRegistry(Arc::new(EchoHandler));

        // Claim succeeds, runs to completion (SUCCESS) before the second
        // attempt; a second attempt against a terminal task also loses the
        // race since `mid` is no longer QUEUED_SENTINEL.
        engine.attempt(task.task_id, &m1, &registry).await.unwrap();
        let second = engine.attempt(task.task_id, &m2, &registry).await.unwrap();
        assert!(matches!(second, AttemptOutcome::LostRace));
    }

    #[tokio::test]
    async fn sleep_timer_task_parks_without_running_handler() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = crate::model::TaskBuilder::new()
            .entity_type("echo")
            .entity_id("e1")
            .sleep_for(5_000)
            .build(&seq)
            .await
            .unwrap();
        store
            .put(Table::Tasks, &task.task_id.get().to_string(), None, task_to_item(&task), Predicate::Always)
            .await
            .unwrap();

        let engine = TaskEngine::new(store);
        let monitor = FixedMonitor::new("m1");
        let registry = SingleHandlerRegistry(Arc::new(EchoHandler));

        let outcome = engine.attempt(task.task_id, &monitor, &registry).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Sleeping { milliseconds_remaining: 5_000 }));
    }
}
