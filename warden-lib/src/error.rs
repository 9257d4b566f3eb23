use thiserror::Error;

/// Error kinds shared by every warden crate (spec.md §7).
///
/// `PreconditionFailed` is deliberately not "an error" to most callers: the
/// core converts it into a local decision (retry, give up, rewrite state)
/// rather than surfacing it. It is kept in this enum so that store
/// implementations have one vocabulary to report it in.
#[derive(Error, Debug)]
pub enum WardenError {
    /// A conditional store write's predicate did not hold. Not fatal; the
    /// caller uses this as a coordination signal.
    #[error("precondition failed")]
    PreconditionFailed,

    /// A `mid = me` guard failed mid-run: another actor believes it owns
    /// this task or lock. Fatal to the current monitor context.
    #[error("lost lock on {0}")]
    LostLock(String),

    /// The current attempt was interrupted (thread cancellation or a
    /// store-level abort). The task returns to QUEUED for a peer to pick up.
    #[error("interrupted")]
    Interrupted,

    /// A synchronous, caller-facing validation error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The monitor contract reports no further work may be dispatched.
    #[error("shutting down")]
    ShuttingDown,

    /// The user-supplied handler returned an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// An underlying store transport/serialization failure (not a
    /// precondition failure).
    #[error("store error: {0}")]
    Store(String),
}

pub type WardenResult<T> = Result<T, WardenError>;

impl WardenError {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, WardenError::PreconditionFailed)
    }
}
