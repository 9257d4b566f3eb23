//! The public facade of the warden task scheduler (spec.md §4.8, component
//! C8): a single `TaskScheduler` that wires the KV façade
//! (`warden_store`), the task/lock codec plus lock coordinator and state
//! machine (`warden_tasks`), and the dispatcher plus background sweepers
//! (`warden_dispatch`) behind one API surface. Callers embed this crate as
//! a library — there is no CLI or server here (that is `warden-demo`'s job).

mod config;
mod monitor;
mod registry;
mod scheduler;

pub use config::SchedulerConfig;
pub use monitor::SimpleMonitor;
pub use registry::HandlerMap;
pub use scheduler::{TaskPage, TaskScheduler};

// Re-exported so callers only ever need to depend on this crate for the
// whole public surface (builders, the handler/monitor contracts, and the
// store configuration types used by `SchedulerConfig`).
pub use warden_dispatch::TaskFilter;
pub use warden_lib::{TaskId, TaskState, WardenError, WardenResult};
pub use warden_store::{PageToken, StoreBackend, StoreConfig};
pub use warden_tasks::{
    HandlerRegistry, Monitor, SubscriberRegistry, SubscriptionId, TaskBuilder, TaskContext, TaskHandler,
    TaskInfo, TaskSnapshot, TaskUpdate, TerminalSubscriber,
};
