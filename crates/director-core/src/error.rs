//! User-facing error taxonomy.
//!
//! Every error that can reach an API caller or a task's result stream is
//! expressed as a `DirectorError`. Library crates keep their own error enums
//! and convert into this one at the boundary.

use thiserror::Error;

/// Result type alias for operations that surface user-facing errors.
pub type DirectorResult<T> = Result<T, DirectorError>;

/// Stable numeric error codes, grouped in families.
pub mod codes {
    pub const TASK_NOT_FOUND: u32 = 10000;
    pub const TASK_CANCELLED: u32 = 10001;
    pub const TASK_UNEXPECTED_STATE: u32 = 10002;

    pub const RELEASE_NOT_FOUND: u32 = 30005;
    pub const RELEASE_VERSION_NOT_FOUND: u32 = 30006;
    pub const RELEASE_VERSION_INVALID: u32 = 30010;

    pub const VALIDATION_INVALID_TYPE: u32 = 40000;
    pub const VALIDATION_MISSING_FIELD: u32 = 40001;
    pub const VALIDATION_INVALID_VALUE: u32 = 40005;

    pub const STEMCELL_NOT_FOUND: u32 = 50003;

    pub const DEPLOYMENT_NOT_FOUND: u32 = 70000;
    pub const INSTANCE_NOT_FOUND: u32 = 70001;
    pub const INSTANCE_INVALID_INDEX: u32 = 70002;
    pub const VARIABLE_SET_NOT_FOUND: u32 = 70011;

    pub const RESOURCE_NOT_FOUND: u32 = 100002;
    pub const LOCK_TIMEOUT: u32 = 100003;

    pub const INSTANCE_GROUP_UNKNOWN_VM_TYPE: u32 = 140004;
    pub const INSTANCE_GROUP_UNKNOWN_STEMCELL: u32 = 140005;
    pub const INSTANCE_GROUP_UNKNOWN_DISK_TYPE: u32 = 140012;
    pub const JOB_MISSING_LINK: u32 = 140014;
    pub const JOB_UNKNOWN_AVAILABILITY_ZONE: u32 = 140018;
    pub const JOB_BOTH_INSTANCE_GROUP_AND_JOB: u32 = 140020;
    pub const JOB_UNKNOWN_NETWORK: u32 = 150001;

    pub const DEPLOYMENT_INVALID_LINK: u32 = 190016;

    pub const CPI_ERROR: u32 = 390000;
    pub const AGENT_ERROR: u32 = 400000;

    pub const BAD_MANIFEST: u32 = 440001;

    pub const SYSTEM_ERROR: u32 = 500000;

    pub const RUNTIME_AMBIGUOUS_RELEASE_SPEC: u32 = 530000;
    pub const RUNTIME_INVALID_RELEASE_VERSION: u32 = 530001;
    pub const ADDON_RELEASE_NOT_LISTED: u32 = 530002;
    pub const RUNTIME_INVALID_DEPLOYMENT_RELEASE: u32 = 530003;

    pub const CONFIG_SERVER_MISSING_NAME: u32 = 540002;
    pub const CONFIG_SERVER_INCONSISTENT_VARIABLE_STATE: u32 = 540008;

    pub const UNAUTHORIZED: u32 = 600000;

    pub const INVALID_YAML: u32 = 710000;
    pub const LINK_LOOKUP_ERROR: u32 = 810000;
}

/// The director's user-facing error taxonomy.
#[derive(Debug, Error)]
pub enum DirectorError {
    /// Malformed manifest or config. Surfaced synchronously, never retried.
    #[error("{message}")]
    Validation { code: u32, message: String },

    /// A referenced deployment, release, stemcell, instance or config is absent.
    #[error("{message}")]
    ResourceNotFound { code: u32, message: String },

    /// The named lock stayed held by someone else past the acquire timeout.
    #[error("Failed to acquire lock for {0}")]
    LockTimeout(String),

    /// An invalid task state transition was attempted.
    #[error("{0}")]
    TaskUnexpectedState(String),

    #[error("Task {0} not found")]
    TaskNotFound(u64),

    #[error("Task {0} cancelled")]
    TaskCancelled(u64),

    /// Failure reported by the cloud provider interface.
    #[error("CPI error: {0}")]
    Cpi(String),

    /// Failure reported by (or while talking to) an instance agent.
    #[error("Agent error: {0}")]
    Agent(String),

    /// Link could not be resolved (missing or ambiguous provider).
    #[error("{message}")]
    Link { code: u32, message: String },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),
}

impl DirectorError {
    pub fn validation(code: u32, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn bad_manifest(message: impl Into<String>) -> Self {
        Self::validation(codes::BAD_MANIFEST, message)
    }

    pub fn not_found(code: u32, message: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            code,
            message: message.into(),
        }
    }

    pub fn link(code: u32, message: impl Into<String>) -> Self {
        Self::Link {
            code,
            message: message.into(),
        }
    }

    /// Numeric code rendered in API error bodies.
    pub fn code(&self) -> u32 {
        match self {
            Self::Validation { code, .. } => *code,
            Self::ResourceNotFound { code, .. } => *code,
            Self::LockTimeout(_) => codes::LOCK_TIMEOUT,
            Self::TaskUnexpectedState(_) => codes::TASK_UNEXPECTED_STATE,
            Self::TaskNotFound(_) => codes::TASK_NOT_FOUND,
            Self::TaskCancelled(_) => codes::TASK_CANCELLED,
            Self::Cpi(_) => codes::CPI_ERROR,
            Self::Agent(_) => codes::AGENT_ERROR,
            Self::Link { code, .. } => *code,
            Self::Unauthorized(_) => codes::UNAUTHORIZED,
            Self::Internal(_) => codes::SYSTEM_ERROR,
        }
    }

    /// HTTP status the API layer maps this error to.
    pub fn status(&self) -> u16 {
        match self {
            Self::ResourceNotFound { .. } | Self::TaskNotFound(_) => 404,
            Self::Unauthorized(_) => 401,
            Self::TaskCancelled(_) => 200,
            Self::LockTimeout(_) => 409,
            Self::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let err = DirectorError::not_found(codes::DEPLOYMENT_NOT_FOUND, "Deployment 'x' doesn't exist");
        assert_eq!(err.code(), 70000);
        assert_eq!(err.status(), 404);

        let err = DirectorError::bad_manifest("Manifest should contain a name");
        assert_eq!(err.code(), 440001);
        assert_eq!(err.status(), 400);
        assert!(!err.is_retryable());

        let err = DirectorError::LockTimeout("lock:deployment:foo".into());
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Failed to acquire lock for lock:deployment:foo");
    }
}
