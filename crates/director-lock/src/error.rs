//! Error types for the lock manager.

use director_core::DirectorError;
use director_state::StateError;
use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock past the acquire timeout.
    #[error("Failed to acquire lock for {0}")]
    Timeout(String),

    /// The lease ran out and someone else took the lock.
    #[error("lock {0} was lost")]
    Lost(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl From<LockError> for DirectorError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout(name) => DirectorError::LockTimeout(name),
            other => DirectorError::Internal(other.to_string()),
        }
    }
}
