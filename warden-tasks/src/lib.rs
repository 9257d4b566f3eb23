//! Task records, their KV encoding, the lock/prerequisite coordinator, and
//! the state machine that drives one task through claim → run → finalize
//! (spec.md §3–§4.5, components C3/C4/C5). This crate has no opinion on
//! *when* to attempt a task id or how many workers run concurrently — that
//! is `warden-dispatch`'s job.

mod codec;
mod error;
mod handler;
mod locks;
mod machine;
mod model;
mod subscribers;

pub use codec::{is_queued_sentinel, item_to_lock_row, item_to_task, lock_row_to_item, task_to_item, LockRow};
pub use error::{BuildError, TaskError, TaskResult};
pub use handler::{HandlerRegistry, Monitor, TaskContext, TaskHandler, TaskUpdate};
pub use locks::{AcquireOutcome, LockCoordinator, PrereqOutcome};
pub use machine::{AttemptOutcome, TaskEngine};
pub use model::{MonitorSlot, TaskBuilder, TaskInfo, TaskSnapshot};
pub use subscribers::{SubscriberRegistry, SubscriptionId, TerminalSubscriber};
