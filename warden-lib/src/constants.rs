//! Named constants from spec.md §9 ("Retry/backoff knobs are hard-coded in
//! the source... preserve as named constants; expose through configuration").

/// Sentinel `monitorId` value meaning "dispatchable, no owner yet".
pub const QUEUED_SENTINEL: &str = "#";

/// Sentinel `monitorId` value meaning "blocked on a lock or prerequisite".
pub const WAITING_SENTINEL: &str = "$";

/// Sentinel `runningTaskId` value for a lock row that is not currently
/// associated with a waiter (i.e. the held-lock row itself).
pub const TASK_ID_NONE: &str = "#";

/// Prefix used to derive a task's own prerequisite barrier lock id.
pub const TASK_BARRIER_PREFIX: &str = "_TASK:";

/// Upper bound, in milliseconds, of the random backoff applied when a lock
/// acquire or release races another actor.
pub const MAX_LOCK_BACKOFF_MS: u64 = 500;

/// Dispatcher pacing window.
pub const POLL_INTERVAL_MS: u64 = 10_000;

/// Maximum claim attempts dispatched per `POLL_INTERVAL_MS`.
pub const MAX_TASKS_IN_INTERVAL: u32 = 10;

/// Number of sweep ticks between deep-cleanup passes.
pub const CLEANUP_INTERVALS: u32 = 30;

/// Hard cap on the worker pool, regardless of configured pool size.
pub const MAX_POOL_CAPACITY: usize = 10;

/// How long a task is parked when its entity type has no registered
/// handler, before the dispatcher retries it (spec.md §6, Handler registry).
pub const NO_HANDLER_RETRY_MS: i64 = 60_000;

pub fn task_barrier_lock_id(task_id: crate::TaskId) -> String {
    format!("{TASK_BARRIER_PREFIX}{}", task_id.sort_key())
}
