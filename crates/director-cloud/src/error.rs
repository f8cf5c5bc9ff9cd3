use director_core::DirectorError;
use thiserror::Error;

pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("CPI '{method}' failed: {message}")]
    Cpi {
        method: &'static str,
        message: String,
        /// Whether the same call may succeed if tried again.
        retryable: bool,
    },

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("Disk '{0}' not found")]
    DiskNotFound(String),

    #[error("Unknown CPI '{0}'")]
    UnknownCpi(String),

    #[error("Agent '{agent_id}' failed to {action}: {message}")]
    Agent {
        agent_id: String,
        action: &'static str,
        message: String,
    },
}

impl CloudError {
    pub fn cpi(method: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Cpi {
            method,
            message: message.into(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cpi { retryable: true, .. })
    }
}

impl From<CloudError> for DirectorError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::Agent { .. } => DirectorError::Agent(e.to_string()),
            other => DirectorError::Cpi(other.to_string()),
        }
    }
}
