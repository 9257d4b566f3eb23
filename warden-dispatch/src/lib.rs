//! The in-process dispatcher and background sweepers (spec.md §4.6–§4.7,
//! components C6/C7) that decide *when* to drive `warden_tasks::TaskEngine`
//! over a task id and keep the store's durable state converging with the
//! in-process ready queue: pacing, a worker pool, a delayed-task timer
//! wheel, periodic catch-up, deep cleanup, and monitor-death recovery.

mod delayed;
mod dispatcher;
mod error;
mod pacing;
mod queue;
mod sweep;

pub use delayed::{DelayedTask, DelayedTaskTable};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHealth};
pub use error::{DispatchError, DispatchResult};
pub use pacing::{PacingClock, PacingDecision};
pub use queue::ReadyQueue;
pub use sweep::{DeepCleanupReport, Sweeper, TaskFilter};
