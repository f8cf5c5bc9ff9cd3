//! Error types for the task subsystem.

use director_core::DirectorError;
use director_state::StateError;
use thiserror::Error;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(u64),

    /// Invalid edge in the task state machine.
    #[error("{0}")]
    UnexpectedState(String),

    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    #[error("state error: {0}")]
    State(StateError),
}

impl From<StateError> for TaskError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => match what.strip_prefix("task ").and_then(|id| id.parse().ok()) {
                Some(id) => TaskError::NotFound(id),
                None => TaskError::State(StateError::NotFound(what)),
            },
            other => TaskError::State(other),
        }
    }
}

impl From<TaskError> for DirectorError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::NotFound(id) => DirectorError::TaskNotFound(id),
            TaskError::UnexpectedState(msg) => DirectorError::TaskUnexpectedState(msg),
            other => DirectorError::Internal(other.to_string()),
        }
    }
}
