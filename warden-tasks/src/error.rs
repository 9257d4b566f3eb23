use thiserror::Error;
use warden_lib::WardenError;

/// Errors raised while building, acquiring locks for, or running a task
/// (spec.md §7). `PreconditionFailed` and `LostLock` mirror the store-level
/// and monitor-level signals of the same name one layer down; everything
/// else is specific to this crate's validation and execution paths.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("precondition failed")]
    PreconditionFailed,

    #[error("lost lock: {0}")]
    LostLock(String),

    #[error("interrupted")]
    Interrupted,

    #[error("invalid task: {0}")]
    Build(#[from] BuildError),

    #[error("no handler registered for entity type {0}")]
    NoHandler(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error(transparent)]
    Store(#[from] warden_store::StoreError),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Validation failures for [`crate::model::TaskBuilder::build`] (SPEC_FULL §2
/// supplemental feature): distinct from the generic invalid-argument kind so
/// callers can match on exactly what was wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("entity_type is required")]
    MissingEntityType,

    #[error("entity_id is required")]
    MissingEntityId,

    #[error("any_prerequisite=true requires at least one prerequisite task id")]
    EmptyAnyPrerequisite,
}

impl From<TaskError> for WardenError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::PreconditionFailed => WardenError::PreconditionFailed,
            TaskError::LostLock(m) => WardenError::LostLock(m),
            TaskError::Interrupted => WardenError::Interrupted,
            TaskError::Build(e) => WardenError::InvalidArgument(e.to_string()),
            TaskError::NoHandler(e) => WardenError::InvalidArgument(format!("no handler: {e}")),
            TaskError::Handler(m) => WardenError::Handler(m),
            TaskError::Store(e) => e.into(),
        }
    }
}
