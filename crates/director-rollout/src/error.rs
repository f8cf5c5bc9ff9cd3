use director_cloud::CloudError;
use director_core::DirectorError;
use director_state::StateError;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("Task {task_id} cancelled")]
    Cancelled { task_id: u64 },

    #[error("Task {task_id} lost its deployment lock")]
    LockLost { task_id: u64 },

    #[error("'{instance}' failed: {source}")]
    InstanceFailed {
        instance: String,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("'{instance}' is not running after {waited_ms}ms")]
    NotRunning { instance: String, waited_ms: u64 },

    #[error("instance worker stopped: {0}")]
    Join(String),
}

impl RolloutError {
    pub fn instance(instance: impl Into<String>, source: RolloutError) -> Self {
        Self::InstanceFailed {
            instance: instance.into(),
            source: Box::new(source),
        }
    }
}

impl From<RolloutError> for DirectorError {
    fn from(e: RolloutError) -> Self {
        match e {
            RolloutError::Cancelled { task_id } => DirectorError::TaskCancelled(task_id),
            RolloutError::Cloud(CloudError::Agent { .. }) => DirectorError::Agent(e.to_string()),
            RolloutError::Cloud(_) => DirectorError::Cpi(e.to_string()),
            RolloutError::InstanceFailed { ref source, .. } => match **source {
                RolloutError::Cloud(CloudError::Agent { .. }) | RolloutError::NotRunning { .. } => {
                    DirectorError::Agent(e.to_string())
                }
                RolloutError::Cloud(_) => DirectorError::Cpi(e.to_string()),
                _ => DirectorError::Internal(e.to_string()),
            },
            RolloutError::NotRunning { .. } => DirectorError::Agent(e.to_string()),
            RolloutError::State(_) | RolloutError::LockLost { .. } | RolloutError::Join(_) => {
                DirectorError::Internal(e.to_string())
            }
        }
    }
}
