//! The distributed lock and prerequisite coordinator (spec.md §4.4,
//! component C4): named mutual-exclusion locks with queued waiters, and
//! task-to-task happens-before edges encoded as a reserved lock per task
//! (the "prerequisite barrier").
//!
//! Implementation note (deviation from the literal algorithm, recorded in
//! the grounding ledger): spec.md §4.4 describes sorting a task's ordinary
//! lock ids together with its own barrier id into one combined acquire list,
//! so that a partial-acquire unwind releases whichever prefix was acquired —
//! barrier included. That would let the barrier wink in and out of
//! existence across unrelated lock contention for the same task, which
//! contradicts §3's invariant that the barrier exists "for the entire
//! lifetime of task T". Here the barrier is acquired and released as its
//! own step, never part of the ordinary-lock unwind: acquisition order
//! across the two is unobservable to callers (nothing else holds the
//! barrier), so this preserves every cross-process invariant while avoiding
//! the contradiction.
//!
//! The barrier row itself is created once, at task creation
//! ([`LockCoordinator::create_barrier`]), held by a placeholder owner until
//! the task is first claimed. A barrier that only came into existence at
//! claim time would leave a gap — from `addTask` until the first claim —
//! during which the task has no barrier row at all, and a dependent task's
//! prerequisite wait would misread that absence as "already terminal".

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use warden_lib::{
    task_barrier_lock_id, TaskId, TaskState, MAX_LOCK_BACKOFF_MS, QUEUED_SENTINEL, TASK_ID_NONE,
    WAITING_SENTINEL,
};
use warden_store::{AttrValue, KvStore, Predicate, StoreError, Table};

use crate::codec::{item_to_lock_row, item_to_task, lock_row_to_item, LockRow};
use crate::error::TaskResult;

#[derive(Clone)]
pub struct LockCoordinator {
    store: std::sync::Arc<dyn KvStore>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every requested lock id is now held by this task, in the order they
    /// were acquired (used to release in reverse order later).
    Acquired(Vec<String>),
    /// Blocked on one lock id; any ids already acquired during this call
    /// have been unwound and are no longer held.
    Waiting,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PrereqOutcome {
    Clear,
    Waiting,
}

impl LockCoordinator {
    pub fn new(store: std::sync::Arc<dyn KvStore>) -> Self {
        LockCoordinator { store }
    }

    /// Establishes a task's prerequisite barrier as a held lock for the
    /// task's entire lifetime (spec.md §3 "held for the entire lifetime of
    /// task T"), owned by no real monitor yet (`QUEUED_SENTINEL`). Must be
    /// called once, at task creation, before the task is ever enqueued:
    /// otherwise a dependent task's `wait_on_prerequisite` sees no barrier
    /// row for a still-QUEUED prerequisite and wrongly infers it terminal.
    /// [`Self::acquire_barrier`]'s re-entrant `rtid = taskId` branch later
    /// transfers ownership from this placeholder to whichever monitor
    /// actually claims the task.
    pub async fn create_barrier(&self, task_id: TaskId) -> TaskResult<()> {
        let barrier = task_barrier_lock_id(task_id);
        let row = LockRow::Held {
            lock_id: barrier.clone(),
            monitor_id: QUEUED_SENTINEL.to_string(),
            running_task_id: task_id,
            tasks_queued: 0,
        };
        self.store
            .put(Table::Locks, &barrier, Some(TASK_ID_NONE), lock_row_to_item(&row), Predicate::Always)
            .await?;
        Ok(())
    }

    /// Acquires (or re-entrantly confirms) a task's own prerequisite
    /// barrier. Idempotent: safe to call again for a task that already
    /// holds it.
    pub async fn acquire_barrier(&self, task_id: TaskId, monitor_id: &str) -> TaskResult<()> {
        let barrier = task_barrier_lock_id(task_id);
        loop {
            match self.try_acquire_one(&barrier, task_id, monitor_id).await? {
                true => return Ok(()),
                false => {
                    // Someone else is mid-release of a barrier we think is
                    // abandoned; this should not happen for a task's own
                    // barrier under normal operation. Treat as transient.
                    warn!(%barrier, "barrier acquire observed contention, retrying");
                    backoff_sleep().await;
                }
            }
        }
    }

    /// Acquires the task's ordinary named locks, sorted ascending to
    /// preclude deadlock (spec.md §4.4). On partial failure, already
    /// acquired ids are released before returning `Waiting`.
    pub async fn acquire(
        &self,
        task_id: TaskId,
        lock_ids: &[String],
        monitor_id: &str,
    ) -> TaskResult<AcquireOutcome> {
        let mut sorted: Vec<String> = lock_ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut acquired = Vec::new();
        for lock_id in &sorted {
            match self.try_acquire_one(lock_id, task_id, monitor_id).await? {
                true => acquired.push(lock_id.clone()),
                false => {
                    self.release_ordinary(task_id, &acquired, monitor_id).await?;
                    return Ok(AcquireOutcome::Waiting);
                }
            }
        }
        Ok(AcquireOutcome::Acquired(acquired))
    }

    /// One id's worth of the acquire algorithm (spec.md §4.4 "Acquire").
    /// Returns `true` if held afterward, `false` if the task should
    /// transition to WAITING_FOR_LOCK.
    async fn try_acquire_one(
        &self,
        lock_id: &str,
        task_id: TaskId,
        monitor_id: &str,
    ) -> TaskResult<bool> {
        loop {
            let guard = Predicate::or([
                Predicate::eq("rtid", task_id.get().to_string()),
                Predicate::not_exists("mid"),
            ]);
            let sets = vec![
                ("lid".to_string(), AttrValue::S(lock_id.to_string())),
                ("tid".to_string(), AttrValue::S(TASK_ID_NONE.to_string())),
                ("mid".to_string(), AttrValue::S(monitor_id.to_string())),
                ("rtid".to_string(), AttrValue::S(task_id.get().to_string())),
            ];
            match self
                .store
                .conditional_merge(
                    Table::Locks,
                    lock_id,
                    Some(TASK_ID_NONE),
                    sets,
                    vec![("agn".to_string(), 1)],
                    guard,
                )
                .await
            {
                Ok(_) => {
                    // Defensive cleanup: a prior retry of this same acquire
                    // may have left our own waiter row behind (see the
                    // PreconditionFailed branch below).
                    self.delete_waiter(lock_id, task_id).await?;
                    return Ok(true);
                }
                Err(StoreError::PreconditionFailed) => {
                    // Held elsewhere: enqueue as a waiter, then publish a
                    // happens-before with the holder via the tasksQueued
                    // fence.
                    self.put_waiter(lock_id, task_id).await?;
                    match self
                        .store
                        .conditional_increment(
                            Table::Locks,
                            lock_id,
                            Some(TASK_ID_NONE),
                            "agn",
                            1,
                            Predicate::exists("mid"),
                        )
                        .await
                    {
                        Ok(_) => return Ok(false),
                        Err(StoreError::PreconditionFailed) => {
                            // Holder just released; retry the whole acquire
                            // for this id after a bounded random backoff.
                            self.delete_waiter(lock_id, task_id).await?;
                            backoff_sleep().await;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Prerequisite gating (spec.md §4.4 "Prerequisites"). `any_prerequisite`
    /// selects ANY-semantics (first terminal unblocks) vs. ALL-semantics
    /// (first non-terminal blocks).
    pub async fn check_prerequisites(
        &self,
        task_id: TaskId,
        prerequisite_task_ids: &[TaskId],
        any_prerequisite: bool,
    ) -> TaskResult<PrereqOutcome> {
        if prerequisite_task_ids.is_empty() {
            return Ok(PrereqOutcome::Clear);
        }

        if any_prerequisite {
            for &p in prerequisite_task_ids {
                if self.task_is_terminal(p).await? {
                    self.delete_waiter(&task_barrier_lock_id(p), task_id).await?;
                    return Ok(PrereqOutcome::Clear);
                }
            }
            // None terminal yet: wait on the first as a representative;
            // re-evaluated from scratch on every claim attempt.
            self.wait_on_prerequisite(prerequisite_task_ids[0], task_id).await
        } else {
            for &p in prerequisite_task_ids {
                if !self.task_is_terminal(p).await? {
                    return self.wait_on_prerequisite(p, task_id).await;
                }
                self.delete_waiter(&task_barrier_lock_id(p), task_id).await?;
            }
            Ok(PrereqOutcome::Clear)
        }
    }

    async fn wait_on_prerequisite(&self, p: TaskId, me: TaskId) -> TaskResult<PrereqOutcome> {
        let barrier = task_barrier_lock_id(p);
        self.put_waiter(&barrier, me).await?;
        match self
            .store
            .conditional_increment(Table::Locks, &barrier, Some(TASK_ID_NONE), "agn", 1, Predicate::exists("mid"))
            .await
        {
            Ok(_) => Ok(PrereqOutcome::Waiting),
            Err(StoreError::PreconditionFailed) => {
                // P just became terminal (its barrier was just deleted).
                self.delete_waiter(&barrier, me).await?;
                Ok(PrereqOutcome::Clear)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn task_is_terminal(&self, task_id: TaskId) -> TaskResult<bool> {
        let item = self.store.get(Table::Tasks, &task_id.get().to_string(), None).await?;
        match item {
            None => Ok(true),
            Some(item) => Ok(item_to_task(&item)?.task_state.is_terminal()),
        }
    }

    /// Read-only: is `lock_id` currently unheld? Used by the deep-cleanup
    /// sweep's waiting-task rescue pass (spec.md §4.7 step 2), which must
    /// check every one of a waiting task's lock ids without taking part in
    /// acquisition itself.
    pub async fn is_free(&self, lock_id: &str) -> TaskResult<bool> {
        Ok(self.store.get(Table::Locks, lock_id, Some(TASK_ID_NONE)).await?.is_none())
    }

    /// Read-only prerequisite check, with the same any/all semantics as
    /// [`Self::check_prerequisites`] but no waiter side effects (spec.md
    /// §4.7 step 2).
    pub async fn prerequisites_satisfied(
        &self,
        prerequisite_task_ids: &[TaskId],
        any_prerequisite: bool,
    ) -> TaskResult<bool> {
        if prerequisite_task_ids.is_empty() {
            return Ok(true);
        }
        if any_prerequisite {
            for &p in prerequisite_task_ids {
                if self.task_is_terminal(p).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        } else {
            for &p in prerequisite_task_ids {
                if !self.task_is_terminal(p).await? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }

    /// Conditionally deletes a held lock whose owning task has gone terminal
    /// without releasing it (spec.md §4.7 deep-cleanup step 1): guarded by
    /// the monitor id and fence value read alongside it, so a fresh acquire
    /// or a waiter enqueue racing the sweep is never clobbered. Returns
    /// `false` (not an error) if the guard lost the race.
    pub async fn delete_abandoned(
        &self,
        lock_id: &str,
        owner_monitor_id: &str,
        tasks_queued: i64,
    ) -> TaskResult<bool> {
        let guard = Predicate::and([
            Predicate::eq("mid", owner_monitor_id.to_string()),
            Predicate::eq("agn", tasks_queued),
        ]);
        match self.store.conditional_delete(Table::Locks, lock_id, Some(TASK_ID_NONE), guard).await {
            Ok(()) => Ok(true),
            Err(StoreError::PreconditionFailed) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Forcibly releases a lock abandoned by a dead monitor (spec.md §4.7
    /// "Monitor-death recovery"). Unlike [`Self::release`], which knows
    /// whether the releasing task's own lock is ordinary or a barrier, a
    /// dead monitor's held lock carries no such context — its entire
    /// in-process state is gone — so every waiter is woken unconditionally;
    /// the normal acquire CAS still arbitrates which one actually gets the
    /// lock once it retries. Returns the woken task ids (the caller
    /// re-enqueues them via the `tasksByMonitor` scan, not here).
    pub async fn force_release_for_monitor(
        &self,
        lock_id: &str,
        dead_monitor_id: &str,
    ) -> TaskResult<Vec<TaskId>> {
        loop {
            let held = self.store.get(Table::Locks, lock_id, Some(TASK_ID_NONE)).await?;
            let Some(held) = held else { return Ok(Vec::new()) };
            if held.get("mid").and_then(AttrValue::as_str) != Some(dead_monitor_id) {
                return Ok(Vec::new());
            }
            let fence = held.get("agn").and_then(AttrValue::as_i64).unwrap_or(0);

            let woken = self.wake_all_waiters(lock_id).await?;
            let guard = Predicate::and([
                Predicate::eq("mid", dead_monitor_id.to_string()),
                Predicate::eq("agn", fence),
            ]);
            match self.store.conditional_delete(Table::Locks, lock_id, Some(TASK_ID_NONE), guard).await {
                Ok(()) => return Ok(woken),
                Err(StoreError::PreconditionFailed) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Releases a task's ordinary locks (reverse acquisition order),
    /// waking at most one waiter per lock, and — only when `is_terminal` —
    /// also releases the task's own barrier, waking every waiter on it.
    /// Returns the task ids that were woken and should be re-enqueued.
    pub async fn release(
        &self,
        task_id: TaskId,
        held_ordinary_locks: &[String],
        is_terminal: bool,
        monitor_id: &str,
    ) -> TaskResult<Vec<TaskId>> {
        let mut woken = self.release_ordinary(task_id, held_ordinary_locks, monitor_id).await?;
        if is_terminal {
            woken.extend(self.release_barrier(task_id, monitor_id).await?);
        }
        Ok(woken)
    }

    async fn release_ordinary(
        &self,
        task_id: TaskId,
        lock_ids: &[String],
        monitor_id: &str,
    ) -> TaskResult<Vec<TaskId>> {
        let mut woken = Vec::new();
        for lock_id in lock_ids.iter().rev() {
            woken.extend(self.release_one(lock_id, task_id, monitor_id, false).await?);
        }
        Ok(woken)
    }

    async fn release_barrier(&self, task_id: TaskId, monitor_id: &str) -> TaskResult<Vec<TaskId>> {
        let barrier = task_barrier_lock_id(task_id);
        self.release_one(&barrier, task_id, monitor_id, true).await
    }

    /// Steps 1-4 of spec.md §4.4 "Release" for one lock id.
    async fn release_one(
        &self,
        lock_id: &str,
        task_id: TaskId,
        monitor_id: &str,
        wake_all: bool,
    ) -> TaskResult<Vec<TaskId>> {
        loop {
            let held = self.store.get(Table::Locks, lock_id, Some(TASK_ID_NONE)).await?;
            let tasks_queued_at_start =
                held.as_ref().and_then(|i| i.get("agn")).and_then(AttrValue::as_i64).unwrap_or(0);

            let woken = if wake_all {
                self.wake_all_waiters(lock_id).await?
            } else {
                self.wake_one_waiter(lock_id).await?.into_iter().collect()
            };

            let guard = Predicate::and([
                Predicate::eq("mid", monitor_id.to_string()),
                Predicate::eq("agn", tasks_queued_at_start),
            ]);
            match self.store.conditional_delete(Table::Locks, lock_id, Some(TASK_ID_NONE), guard).await {
                Ok(()) => {
                    self.delete_waiter(lock_id, task_id).await?;
                    return Ok(woken);
                }
                Err(StoreError::PreconditionFailed) => {
                    // A concurrent waiter-enqueue bumped the fence; redo the
                    // wake + delete decision for this lock.
                    debug!(lock_id, "release fence mismatch, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wake_one_waiter(&self, lock_id: &str) -> TaskResult<Option<TaskId>> {
        for candidate in self.list_waiters(lock_id).await? {
            if self.try_wake(candidate).await? {
                self.delete_waiter(lock_id, candidate).await?;
                return Ok(Some(candidate));
            }
            self.bump_requeues(candidate).await?;
        }
        Ok(None)
    }

    async fn wake_all_waiters(&self, lock_id: &str) -> TaskResult<Vec<TaskId>> {
        let mut woken = Vec::new();
        for candidate in self.list_waiters(lock_id).await? {
            if self.try_wake(candidate).await? {
                woken.push(candidate);
            } else {
                self.bump_requeues(candidate).await?;
            }
            self.delete_waiter(lock_id, candidate).await?;
        }
        Ok(woken)
    }

    async fn list_waiters(&self, lock_id: &str) -> TaskResult<Vec<TaskId>> {
        let mut ids = Vec::new();
        let mut token = None;
        loop {
            let req = warden_store::ScanRequest::new("by_lock", lock_id).with_start_after(token);
            let page = self.store.query_by_index(Table::Locks, req).await?;
            for item in &page.items {
                if let LockRow::Waiter { waiting_task_id, .. } = item_to_lock_row(item)? {
                    ids.push(waiting_task_id);
                }
            }
            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    /// Conditionally flips a waiting task's `monitorId`/state from
    /// WAITING_SENTINEL to QUEUED_SENTINEL/QUEUED. Returns whether the flip
    /// happened (`false` means the waiter's task was already promoted or
    /// canceled by someone else).
    async fn try_wake(&self, task_id: TaskId) -> TaskResult<bool> {
        let guard = Predicate::eq("mid", WAITING_SENTINEL);
        let sets = vec![
            ("mid".to_string(), AttrValue::S(QUEUED_SENTINEL.to_string())),
            ("stat".to_string(), AttrValue::S(TaskState::Queued.to_code().to_string())),
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

    async fn bump_requeues(&self, task_id: TaskId) -> TaskResult<()> {
        self.store
            .conditional_increment(Table::Tasks, &task_id.get().to_string(), None, "agn", 1, Predicate::Always)
            .await?;
        Ok(())
    }

    async fn put_waiter(&self, lock_id: &str, task_id: TaskId) -> TaskResult<()> {
        let row = LockRow::Waiter { lock_id: lock_id.to_string(), waiting_task_id: task_id };
        self.store
            .put(Table::Locks, lock_id, Some(&task_id.sort_key()), lock_row_to_item(&row), Predicate::Always)
            .await?;
        Ok(())
    }

    async fn delete_waiter(&self, lock_id: &str, task_id: TaskId) -> TaskResult<()> {
        self.store
            .conditional_delete(Table::Locks, lock_id, Some(&task_id.sort_key()), Predicate::Always)
            .await?;
        Ok(())
    }
}

async fn backoff_sleep() {
    let jitter = rand::thread_rng().gen_range(0..=MAX_LOCK_BACKOFF_MS);
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::InMemoryStore;

    fn coordinator() -> LockCoordinator {
        LockCoordinator::new(std::sync::Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn create_barrier_makes_an_unclaimed_task_appear_non_terminal_to_waiters() {
        let coord = coordinator();
        let prereq = TaskId::from(1);
        let dependent = TaskId::from(2);

        coord.create_barrier(prereq).await.unwrap();

        let outcome = coord.check_prerequisites(dependent, &[prereq], false).await.unwrap();
        assert_eq!(outcome, PrereqOutcome::Waiting);
    }

    #[tokio::test]
    async fn acquire_barrier_transfers_ownership_from_the_placeholder() {
        let coord = coordinator();
        let task_id = TaskId::from(1);

        coord.create_barrier(task_id).await.unwrap();
        coord.acquire_barrier(task_id, "m1").await.unwrap();

        let woken = coord.release(task_id, &[], true, "m1").await.unwrap();
        assert!(woken.is_empty());
    }

    #[tokio::test]
    async fn second_acquirer_is_told_to_wait() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        let t2 = TaskId::from(2);

        let outcome1 = coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();
        assert_eq!(outcome1, AcquireOutcome::Acquired(vec!["L".to_string()]));

        let outcome2 = coord.acquire(t2, &["L".to_string()], "m2").await.unwrap();
        assert_eq!(outcome2, AcquireOutcome::Waiting);
    }

    #[tokio::test]
    async fn reentrant_acquire_by_same_task_succeeds() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();
        let outcome = coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired(vec!["L".to_string()]));
    }

    #[tokio::test]
    async fn release_wakes_a_waiting_acquirer() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        let t2 = TaskId::from(2);

        coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();
        coord.acquire(t2, &["L".to_string()], "m2").await.unwrap();

        let woken = coord.release(t1, &["L".to_string()], true, "m1").await.unwrap();
        // No task row seeded for t2 in this store, so the flip is a no-op;
        // this exercises that wake_one_waiter tolerates a missing task row.
        assert!(woken.is_empty() || woken == vec![t2]);
    }

    #[tokio::test]
    async fn is_free_reflects_held_state() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        assert!(coord.is_free("L").await.unwrap());
        coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();
        assert!(!coord.is_free("L").await.unwrap());
    }

    #[tokio::test]
    async fn delete_abandoned_requires_matching_fence_and_monitor() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();

        assert!(!coord.delete_abandoned("L", "m1", 999).await.unwrap());
        assert!(!coord.is_free("L").await.unwrap());

        assert!(coord.delete_abandoned("L", "m1", 0).await.unwrap());
        assert!(coord.is_free("L").await.unwrap());
    }

    #[tokio::test]
    async fn force_release_for_monitor_wakes_every_waiter() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        let t2 = TaskId::from(2);
        let t3 = TaskId::from(3);

        coord.acquire(t1, &["L".to_string()], "dead-monitor").await.unwrap();
        coord.acquire(t2, &["L".to_string()], "m2").await.unwrap();
        coord.acquire(t3, &["L".to_string()], "m3").await.unwrap();

        let woken = coord.force_release_for_monitor("L", "dead-monitor").await.unwrap();
        assert_eq!(woken.len(), 2);
        assert!(woken.contains(&t2));
        assert!(woken.contains(&t3));
        assert!(coord.is_free("L").await.unwrap());
    }

    #[tokio::test]
    async fn force_release_for_monitor_is_a_noop_if_monitor_no_longer_owns_it() {
        let coord = coordinator();
        let t1 = TaskId::from(1);
        coord.acquire(t1, &["L".to_string()], "m1").await.unwrap();

        let woken = coord.force_release_for_monitor("L", "some-other-dead-monitor").await.unwrap();
        assert!(woken.is_empty());
        assert!(!coord.is_free("L").await.unwrap());
    }
}
