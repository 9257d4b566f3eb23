use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Task(#[from] warden_tasks::TaskError),

    #[error(transparent)]
    Store(#[from] warden_store::StoreError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl From<DispatchError> for warden_lib::WardenError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Task(e) => e.into(),
            DispatchError::Store(e) => e.into(),
        }
    }
}
