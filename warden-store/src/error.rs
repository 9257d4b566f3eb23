use thiserror::Error;

/// Errors surfaced by the KV facade (spec.md §4.2, §7).
///
/// `PreconditionFailed` is the success signal of "someone else got there
/// first" and must never be conflated with a transport error: callers in
/// `warden-tasks` match on it explicitly to decide whether to retry, wait,
/// or give up.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("precondition failed")]
    PreconditionFailed,

    #[error("item not found: {0}/{1}")]
    NotFound(String, String),

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for warden_lib::WardenError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PreconditionFailed => warden_lib::WardenError::PreconditionFailed,
            other => warden_lib::WardenError::Store(other.to_string()),
        }
    }
}
