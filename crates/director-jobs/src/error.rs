use director_cloud::CloudError;
use director_core::{codes, DirectorError};
use director_lock::LockError;
use director_planner::PlanError;
use director_resolve::ResolveError;
use director_rollout::RolloutError;
use director_state::StateError;
use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Director(#[from] DirectorError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("invalid job arguments: {0}")]
    Arguments(#[from] serde_json::Error),

    #[error("Deployment '{0}' doesn't exist")]
    DeploymentNotFound(String),

    #[error("Instance group '{job}' has no instance with index '{index}' in deployment '{deployment}'")]
    InstanceNotFound {
        deployment: String,
        job: String,
        index: String,
    },

    #[error("You should specify the job index. There is more than one instance of this job type.")]
    SpecifyIndex,

    #[error("Invalid index '{0}'")]
    InvalidIndex(String),

    #[error("Unknown resurrection state '{0}', expected 'on' or 'off'")]
    InvalidResurrectionState(String),
}

impl From<JobError> for DirectorError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Director(e) => e,
            JobError::Plan(e) => e.into(),
            JobError::Resolve(e) => e.into(),
            JobError::Rollout(e) => e.into(),
            JobError::Lock(e) => e.into(),
            JobError::Cloud(e) => e.into(),
            JobError::State(e) => DirectorError::Internal(e.to_string()),
            JobError::Arguments(e) => DirectorError::validation(codes::VALIDATION_INVALID_TYPE, e.to_string()),
            e @ JobError::DeploymentNotFound(_) => DirectorError::not_found(codes::DEPLOYMENT_NOT_FOUND, e.to_string()),
            e @ JobError::InstanceNotFound { .. } => DirectorError::not_found(codes::INSTANCE_NOT_FOUND, e.to_string()),
            e @ (JobError::SpecifyIndex | JobError::InvalidIndex(_)) => {
                DirectorError::validation(codes::INSTANCE_INVALID_INDEX, e.to_string())
            }
            e @ JobError::InvalidResurrectionState(_) => {
                DirectorError::validation(codes::VALIDATION_INVALID_VALUE, e.to_string())
            }
        }
    }
}
