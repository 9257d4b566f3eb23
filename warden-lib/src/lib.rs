//! Shared vocabulary for the warden task scheduler: task identifiers, the
//! task state enum, sentinel values and the common error model. Every other
//! warden crate depends on this one; it depends on nothing warden-specific.

mod constants;
mod error;
mod macros;
mod state;
mod task_id;

pub use constants::*;
pub use error::{WardenError, WardenResult};
pub use state::TaskState;
pub use task_id::{sort_key, sort_key_to_i64, TaskId};
