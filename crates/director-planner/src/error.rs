//! Planner error types.

use director_core::{codes, DirectorError};
use director_resolve::ResolveError;
use director_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    /// Manifest or config failed structural validation.
    #[error(transparent)]
    Invalid(#[from] DirectorError),

    #[error("Release '{name}/{version}' doesn't exist")]
    ReleaseNotFound { name: String, version: String },

    #[error("Stemcell '{name}/{version}' doesn't exist")]
    StemcellNotFound { name: String, version: String },

    #[error("Instance group '{group}' references an unknown stemcell '{alias}'")]
    UnknownStemcell { group: String, alias: String },

    #[error("Job '{job}' not found in release '{release}'")]
    JobNotInRelease { job: String, release: String },

    #[error("Instance group '{group}' references unknown availability zone '{az}'")]
    UnknownAz { group: String, az: String },

    #[error("Instance group '{group}' references an unknown network '{network}'")]
    UnknownNetwork { group: String, network: String },

    #[error("Instance group '{group}' references an unknown vm type '{vm_type}'")]
    UnknownVmType { group: String, vm_type: String },

    #[error("Instance group '{group}' references an unknown disk type '{disk_type}'")]
    UnknownDiskType { group: String, disk_type: String },

    #[error("Instance group '{group}' must specify a vm_type")]
    MissingVmType { group: String },

    #[error("Instance group '{group}' must specify at least one network")]
    MissingNetworks { group: String },

    #[error(
        "Runtime config release '{name}' version '{runtime}' conflicts with deployment manifest version '{manifest}'"
    )]
    ReleaseConflict { name: String, manifest: String, runtime: String },

    #[error("Instance group '{group}' has an invalid update strategy '{value}'")]
    InvalidStrategy { group: String, value: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub type PlanResult<T> = Result<T, PlanError>;

impl From<PlanError> for DirectorError {
    fn from(e: PlanError) -> Self {
        let message = e.to_string();
        match e {
            PlanError::Invalid(inner) => inner,
            PlanError::Resolve(inner) => inner.into(),
            PlanError::ReleaseNotFound { .. } => DirectorError::not_found(codes::RELEASE_VERSION_NOT_FOUND, message),
            PlanError::StemcellNotFound { .. } => DirectorError::not_found(codes::STEMCELL_NOT_FOUND, message),
            PlanError::JobNotInRelease { .. } => DirectorError::not_found(codes::RESOURCE_NOT_FOUND, message),
            PlanError::UnknownStemcell { .. } => {
                DirectorError::validation(codes::INSTANCE_GROUP_UNKNOWN_STEMCELL, message)
            }
            PlanError::UnknownAz { .. } => DirectorError::validation(codes::JOB_UNKNOWN_AVAILABILITY_ZONE, message),
            PlanError::UnknownNetwork { .. } | PlanError::MissingNetworks { .. } => {
                DirectorError::validation(codes::JOB_UNKNOWN_NETWORK, message)
            }
            PlanError::UnknownVmType { .. } | PlanError::MissingVmType { .. } => {
                DirectorError::validation(codes::INSTANCE_GROUP_UNKNOWN_VM_TYPE, message)
            }
            PlanError::UnknownDiskType { .. } => {
                DirectorError::validation(codes::INSTANCE_GROUP_UNKNOWN_DISK_TYPE, message)
            }
            PlanError::ReleaseConflict { .. } => {
                DirectorError::validation(codes::RUNTIME_INVALID_DEPLOYMENT_RELEASE, message)
            }
            PlanError::InvalidStrategy { .. } => DirectorError::validation(codes::VALIDATION_INVALID_VALUE, message),
            PlanError::State(_) => DirectorError::Internal(message),
        }
    }
}
