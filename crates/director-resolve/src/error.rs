use director_core::{codes, DirectorError};
use director_state::StateError;
use thiserror::Error;

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailureKind {
    Missing,
    Ambiguous,
    TypeMismatch,
}

/// Why one consumer could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailure {
    pub kind: LinkFailureKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid placeholder '(({0}))'")]
    InvalidPlaceholder(String),

    #[error("Failed to find variable '{0}'")]
    VariableNotFound(String),

    #[error("Expected variable '{name}' to be already versioned in deployment '{deployment}'")]
    NotVersioned { name: String, deployment: String },

    #[error("Variable '{name}' has unsupported type '{kind}'")]
    UnsupportedType { name: String, kind: String },

    #[error("Placeholder '(({0}))' embedded in a string must resolve to a string, number or boolean")]
    NonScalarInterpolation(String),

    #[error("{}", render_failures(.0))]
    Links(Vec<LinkFailure>),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

fn render_failures(failures: &[LinkFailure]) -> String {
    failures
        .iter()
        .map(|f| f.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

impl From<ResolveError> for DirectorError {
    fn from(e: ResolveError) -> Self {
        match &e {
            ResolveError::InvalidPlaceholder(_)
            | ResolveError::UnsupportedType { .. }
            | ResolveError::NonScalarInterpolation(_) => {
                DirectorError::validation(codes::VALIDATION_INVALID_VALUE, e.to_string())
            }
            ResolveError::VariableNotFound(_) => DirectorError::validation(codes::CONFIG_SERVER_MISSING_NAME, e.to_string()),
            ResolveError::NotVersioned { .. } => {
                DirectorError::validation(codes::CONFIG_SERVER_INCONSISTENT_VARIABLE_STATE, e.to_string())
            }
            ResolveError::Links(failures) => {
                let code = if failures.iter().any(|f| f.kind == LinkFailureKind::Missing) {
                    codes::JOB_MISSING_LINK
                } else {
                    codes::DEPLOYMENT_INVALID_LINK
                };
                DirectorError::link(code, e.to_string())
            }
            ResolveError::State(_) => DirectorError::Internal(e.to_string()),
        }
    }
}
