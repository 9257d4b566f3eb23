//! The in-process dispatcher (spec.md §4.6, component C6): a dedup ready
//! queue drained by a capacity-clamped worker pool, paced claim attempts,
//! and a delayed-task timer wheel — grounded on
//! `reqactor::actor::Actor::serve_in_background`'s
//! Semaphore + `Notify` + completion-channel shape.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_lib::{TaskId, MAX_POOL_CAPACITY};
use warden_store::KvStore;
use warden_tasks::{AttemptOutcome, HandlerRegistry, Monitor, SubscriberRegistry, TaskEngine};

use crate::error::DispatchResult;
use crate::pacing::{PacingClock, PacingDecision};
use crate::queue::ReadyQueue;
use crate::sweep::{Sweeper, TaskFilter};
use crate::DelayedTaskTable;

/// Tunables for one dispatcher instance (spec.md §4.6/§4.7/§9): the pool
/// size an operator configures, plus the named constants, overridable for
/// tests.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub pool_size: usize,
    pub poll_interval_ms: u64,
    pub max_tasks_in_interval: u32,
    pub cleanup_intervals: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            pool_size: 4,
            poll_interval_ms: warden_lib::POLL_INTERVAL_MS,
            max_tasks_in_interval: warden_lib::MAX_TASKS_IN_INTERVAL,
            cleanup_intervals: warden_lib::CLEANUP_INTERVALS,
        }
    }
}

impl DispatcherConfig {
    /// `maxCapacity = max(1, poolSize - 1)`, clamped also by
    /// `MAX_POOL_CAPACITY` (spec.md §4.6).
    pub fn worker_capacity(&self) -> usize {
        self.pool_size.saturating_sub(1).max(1).min(MAX_POOL_CAPACITY)
    }

    pub fn min_claim_spacing_ms(&self) -> u64 {
        (self.poll_interval_ms / self.max_tasks_in_interval.max(1) as u64).max(1)
    }
}

/// A cheap, non-blocking operational snapshot (SPEC_FULL §2
/// `SchedulerHandle::health()`, grounded on `reqactor::queue::Queue::size`).
#[derive(Debug, Clone, Copy)]
pub struct DispatcherHealth {
    pub queue_depth: usize,
    pub delayed_count: usize,
    pub available_permits: usize,
}

/// The dispatcher and its background machinery. Every field is cheaply
/// `Clone`-able (all `Arc`-backed), matching the teacher's `Actor`, so
/// methods can freely hand a clone of `self` into a spawned task rather than
/// threading lifetimes through it.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn KvStore>,
    engine: Arc<TaskEngine>,
    monitor: Arc<dyn Monitor>,
    registry: Arc<dyn HandlerRegistry>,
    queue: Arc<Mutex<ReadyQueue>>,
    notifier: Arc<Notify>,
    delayed: Arc<DelayedTaskTable>,
    semaphore: Arc<Semaphore>,
    pacing: Arc<PacingClock>,
    sweeper: Arc<Sweeper>,
    config: Arc<DispatcherConfig>,
    cancellation: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn KvStore>,
        monitor: Arc<dyn Monitor>,
        registry: Arc<dyn HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let engine = Arc::new(TaskEngine::new(store.clone()));
        let sweeper = Arc::new(Sweeper::new(store.clone()));
        let pacing = Arc::new(PacingClock::new(&config));
        let semaphore = Arc::new(Semaphore::new(config.worker_capacity()));
        Dispatcher {
            store,
            engine,
            monitor,
            registry,
            queue: Arc::new(Mutex::new(ReadyQueue::new())),
            notifier: Arc::new(Notify::new()),
            delayed: Arc::new(DelayedTaskTable::new()),
            semaphore,
            pacing,
            sweeper,
            config: Arc::new(config),
            cancellation: CancellationToken::new(),
        }
    }

    /// Enqueues `task_id` for dispatch if not already pending or in flight
    /// (spec.md §4.6's dedup ready set), and wakes the drive loop.
    pub async fn submit(&self, task_id: TaskId) {
        let newly_added = self.queue.lock().await.push(task_id);
        if newly_added {
            self.notifier.notify_one();
        }
    }

    /// The engine's terminal-state subscriber registry (spec.md §4.8), so
    /// the facade crate can wire `add_on_terminal_state`/
    /// `remove_on_terminal_state` through without reaching past the
    /// dispatcher into `warden-tasks` directly.
    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        self.engine.subscribers()
    }

    pub fn health(&self) -> DispatcherHealth {
        DispatcherHealth {
            // `try_lock` never blocks the caller; a held lock just means a
            // pop/push is mid-flight, not worth reporting stale data for.
            queue_depth: self.queue.try_lock().map(|q| q.len()).unwrap_or(0),
            delayed_count: self.delayed.len(),
            available_permits: self.semaphore.available_permits(),
        }
    }

    /// Starts the drain loop in the background; returns its `JoinHandle` so
    /// the caller can await it (tests) or drop it (production, where
    /// [`Self::shutdown`] is the intended stop signal).
    pub fn serve_in_background(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.drive().await })
    }

    /// Starts the periodic sweep loop (spec.md §4.7) in the background:
    /// one queued-task catch-up pass every `poll_interval_ms`, a deep-cleanup
    /// pass every `cleanup_intervals` ticks.
    pub fn spawn_sweep_loop(&self, filter: Option<TaskFilter>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.sweep_loop(filter).await })
    }

    async fn drive(&self) {
        loop {
            if self.cancellation.is_cancelled() {
                break;
            }

            let task_id = {
                let mut queue = self.queue.lock().await;
                match queue.pop() {
                    Some(id) => id,
                    None => {
                        drop(queue);
                        tokio::select! {
                            _ = self.notifier.notified() => continue,
                            _ = self.cancellation.cancelled() => break,
                        }
                    }
                }
            };

            match self.pacing.gate().await {
                PacingDecision::Proceed => {}
                PacingDecision::Delay(delay) => {
                    // Not our turn yet: put the id back and, unless someone
                    // else already armed a retry timer, arm one ourselves.
                    self.queue.lock().await.complete(task_id);
                    self.submit(task_id).await;
                    if self.pacing.try_claim_schedule_slot() {
                        let this = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            this.pacing.release_schedule_slot();
                            this.notifier.notify_one();
                        });
                    }
                    continue;
                }
            }

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed: shutting down
            };
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.run_one(task_id).await;
                this.queue.lock().await.complete(task_id);
                if !this.queue.lock().await.is_empty() {
                    this.notifier.notify_one();
                }
            });
        }
    }

    /// Draining (spec.md §4.6): skip if another monitor owns the task,
    /// otherwise run the claim/body/finalize machine for it, and act on the
    /// outcome (arm a sleep timer, or immediately resubmit an auto-requeue).
    async fn run_one(&self, task_id: TaskId) {
        let pk = task_id.get().to_string();
        match self.store.get(warden_store::Table::Tasks, &pk, None).await {
            Ok(Some(item)) => match warden_tasks::item_to_task(&item) {
                Ok(task) if !task.monitor_id.is_queued() => {
                    debug!(%task_id, "skipping, no longer queued by the time we drained it");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(%task_id, error = %e, "failed decoding task before attempt");
                    return;
                }
            },
            Ok(None) => {
                warn!(%task_id, "queued task id vanished before attempt");
                return;
            }
            Err(e) => {
                error!(%task_id, error = %e, "failed reading task before attempt");
                return;
            }
        }

        match self.engine.attempt(task_id, self.monitor.as_ref(), self.registry.as_ref()).await {
            Ok(AttemptOutcome::Sleeping { milliseconds_remaining }) => {
                self.spawn_delayed_timer(task_id, milliseconds_remaining);
            }
            Ok(AttemptOutcome::Requeued(id)) => {
                self.submit(id).await;
            }
            Ok(AttemptOutcome::Terminal(snapshot)) => {
                info!(%task_id, state = %snapshot.task.task_state, "task reached a terminal state");
            }
            Ok(AttemptOutcome::Blocked | AttemptOutcome::LostRace) => {}
            Err(e) => {
                error!(%task_id, error = %e, "attempt failed");
            }
        }
    }

    /// Delayed-task timer (spec.md §4.6): polls at
    /// `min(poll_interval_ms, remaining)`, conditionally decrementing
    /// `millisecondsRemaining` for liveness, flipping to QUEUED when it
    /// reaches zero or the monitor is no longer renewable.
    pub fn spawn_delayed_timer(&self, task_id: TaskId, initial_remaining_ms: i64) {
        let this = self.clone();
        self.delayed.insert(task_id, initial_remaining_ms.max(0));
        tokio::spawn(async move {
            let mut remaining = initial_remaining_ms.max(0);
            loop {
                let wait_ms = remaining.min(this.config.poll_interval_ms as i64).max(0) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                    _ = this.cancellation.cancelled() => break,
                }
                if !this.monitor.is_active_monitor() {
                    let _ = this.flip_delayed_to_queued(task_id).await;
                    break;
                }
                match this.tick_delayed(task_id, remaining, wait_ms as i64).await {
                    Ok(Some(new_remaining)) => {
                        remaining = new_remaining;
                        this.delayed.update_remaining(task_id, remaining);
                        if remaining <= 0 {
                            let _ = this.flip_delayed_to_queued(task_id).await;
                            break;
                        }
                    }
                    Ok(None) => break, // guard lost: task moved on without us
                    Err(e) => {
                        error!(%task_id, error = %e, "delayed-task tick failed");
                        break;
                    }
                }
            }
            this.delayed.remove(task_id);
        });
    }

    async fn tick_delayed(
        &self,
        task_id: TaskId,
        remaining_before: i64,
        elapsed_ms: i64,
    ) -> DispatchResult<Option<i64>> {
        let guard = warden_store::Predicate::and([
            warden_store::Predicate::eq("mid", self.monitor.monitor_id().to_string()),
            warden_store::Predicate::eq("tic", remaining_before),
        ]);
        match self
            .store
            .conditional_increment(
                warden_store::Table::Tasks,
                &task_id.get().to_string(),
                None,
                "tic",
                -elapsed_ms,
                guard,
            )
            .await
        {
            Ok(new_value) => Ok(Some(new_value)),
            Err(warden_store::StoreError::PreconditionFailed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn flip_delayed_to_queued(&self, task_id: TaskId) -> DispatchResult<()> {
        let guard = warden_store::Predicate::eq("mid", self.monitor.monitor_id().to_string());
        let sets = vec![
            ("mid".to_string(), warden_store::AttrValue::S(warden_lib::QUEUED_SENTINEL.to_string())),
            (
                "stat".to_string(),
                warden_store::AttrValue::S(warden_lib::TaskState::Queued.to_code().to_string()),
            ),
            ("tic".to_string(), warden_store::AttrValue::N(0)),
        ];
        match self
            .store
            .conditional_merge(warden_store::Table::Tasks, &task_id.get().to_string(), None, sets, vec![], guard)
            .await
        {
            Ok(_) => {
                self.submit(task_id).await;
                Ok(())
            }
            Err(warden_store::StoreError::PreconditionFailed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_loop(&self, filter: Option<TaskFilter>) {
        let mut tick: u32 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                _ = self.cancellation.cancelled() => break,
            }

            match self.sweeper.find_queued(filter.as_ref()).await {
                Ok(ids) => {
                    for id in ids {
                        self.submit(id).await;
                    }
                }
                Err(e) => error!(error = %e, "periodic sweep failed"),
            }

            tick = tick.wrapping_add(1);
            if tick % self.config.cleanup_intervals.max(1) == 0 {
                match self.sweeper.deep_cleanup().await {
                    Ok(report) => {
                        if report.locks_reclaimed > 0 || report.tasks_rescued > 0 {
                            info!(
                                locks_reclaimed = report.locks_reclaimed,
                                tasks_rescued = report.tasks_rescued,
                                "deep-cleanup sweep"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "deep-cleanup sweep failed"),
                }
            }
        }
    }

    /// Monitor-death recovery (spec.md §4.7), driven externally by the
    /// caller's heartbeat registry: releases every lock `dead_monitor_id`
    /// held and re-enqueues every task it still owned.
    pub async fn release_locks_for_monitor(&self, dead_monitor_id: &str) -> DispatchResult<Vec<TaskId>> {
        let recovered = self.sweeper.release_locks_for_monitor(dead_monitor_id).await?;
        for id in &recovered {
            self.submit(*id).await;
        }
        Ok(recovered)
    }

    /// `stopTaskQueueMonitor` (spec.md §4.8): cancels all outstanding
    /// background work and blocks until the worker semaphore is fully
    /// released, escalating to `force_interrupt` on successive timeouts of
    /// 60, 30, 15, ... seconds. Returns once every permit is back (clean
    /// drain) or the escalation is exhausted (forced).
    pub async fn shutdown(&self, force_interrupt: bool) {
        self.cancellation.cancel();
        let capacity = self.config.worker_capacity();

        let mut timeout_secs = 60u64;
        loop {
            let acquire_all = self.semaphore.acquire_many(capacity as u32);
            match tokio::time::timeout(Duration::from_secs(timeout_secs), acquire_all).await {
                Ok(Ok(permits)) => {
                    permits.forget();
                    info!("dispatcher drained cleanly");
                    break;
                }
                Ok(Err(_)) => break, // semaphore already closed
                Err(_) => {
                    warn!(timeout_secs, "worker pool still draining, waiting on outstanding work");
                    if !force_interrupt || timeout_secs <= 1 {
                        if force_interrupt {
                            error!("force-interrupt escalation exhausted, giving up on a clean drain");
                        }
                        break;
                    }
                    timeout_secs = (timeout_secs / 2).max(1);
                }
            }
        }
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;
    use warden_store::{InMemorySequence, InMemoryStore, Predicate, Sequence, Table};
    use warden_tasks::{task_to_item, TaskBuilder, TaskContext, TaskHandler, TaskUpdate};

    struct FixedMonitor {
        id: &'static str,
        active: AtomicBool,
    }

    impl FixedMonitor {
        fn new(id: &'static str) -> Self {
            FixedMonitor { id, active: AtomicBool::new(true) }
        }
    }

    impl Monitor for FixedMonitor {
        fn monitor_id(&self) -> &str {
            self.id
        }
        fn node_name(&self) -> &str {
            "test-node"
        }
        fn has_failed_heartbeat(&self) -> bool {
            !self.active.load(Ordering::SeqCst)
        }
        fn force_heartbeat_failure(&self) {
            self.active.store(false, Ordering::SeqCst);
        }
        fn is_active_monitor(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<Option<TaskUpdate>, String> {
            Ok(None)
        }
    }

    struct SingleHandlerRegistry(Arc<dyn TaskHandler>);

    impl HandlerRegistry for SingleHandlerRegistry {
        fn get(&self, _entity_type: &str) -> Option<Arc<dyn TaskHandler>> {
            Some(self.0.clone())
        }
    }

    fn echo_dispatcher(store: Arc<dyn KvStore>, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(FixedMonitor::new("m1")),
            Arc::new(SingleHandlerRegistry(Arc::new(EchoHandler))),
            config,
        )
    }

    #[tokio::test]
    async fn submitted_task_runs_to_success() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = TaskBuilder::new().entity_type("echo").entity_id("e1").build(&seq).await.unwrap();
        store
            .put(Table::Tasks, &task.task_id.get().to_string(), None, task_to_item(&task), Predicate::Always)
            .await
            .unwrap();

        let dispatcher = echo_dispatcher(store.clone(), DispatcherConfig::default());
        let _handle = dispatcher.serve_in_background();
        dispatcher.submit(task.task_id).await;

        tokio::time::timeout(StdDuration::from_secs(2), async {
            loop {
                let item = store.get(Table::Tasks, &task.task_id.get().to_string(), None).await.unwrap().unwrap();
                let reloaded = warden_tasks::item_to_task(&item).unwrap();
                if reloaded.task_state == warden_lib::TaskState::Success {
                    break;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should reach SUCCESS before the timeout");

        dispatcher.shutdown(true).await;
    }

    #[tokio::test]
    async fn sleeping_task_is_tracked_then_removed_once_woken() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let seq = InMemorySequence::new();
        let task = TaskBuilder::new()
            .entity_type("echo")
            .entity_id("e1")
            .sleep_for(20)
            .build(&seq)
            .await
            .unwrap();
        store
            .put(Table::Tasks, &task.task_id.get().to_string(), None, task_to_item(&task), Predicate::Always)
            .await
            .unwrap();

        let mut config = DispatcherConfig::default();
        config.poll_interval_ms = 20;
        let dispatcher = echo_dispatcher(store.clone(), config);
        let _handle = dispatcher.serve_in_background();
        dispatcher.submit(task.task_id).await;

        tokio::time::timeout(StdDuration::from_secs(2), async {
            loop {
                if dispatcher.delayed.contains(task.task_id) {
                    break;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("task should park as a delayed entry");

        tokio::time::timeout(StdDuration::from_secs(2), async {
            loop {
                if !dispatcher.delayed.contains(task.task_id) {
                    break;
                }
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("delayed task should eventually be woken");

        dispatcher.shutdown(true).await;
    }

    #[test]
    fn worker_capacity_is_clamped() {
        let mut config = DispatcherConfig::default();
        config.pool_size = 1;
        assert_eq!(config.worker_capacity(), 1);
        config.pool_size = 50;
        assert_eq!(config.worker_capacity(), MAX_POOL_CAPACITY);
    }
}
