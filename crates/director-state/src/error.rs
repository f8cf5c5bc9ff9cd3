//! Error types for the director state store.

use director_core::{codes, DirectorError};
use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// redb failed at `op` (open, transaction, open table, read, write).
    #[error("storage error during {op}: {message}")]
    Storage { op: &'static str, message: String },

    /// A stored row does not match its record type.
    #[error("record encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule would be broken by the write.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StateError> for DirectorError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => DirectorError::not_found(codes::RESOURCE_NOT_FOUND, format!("{what} not found")),
            other => DirectorError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rows_surface_as_not_found() {
        let err: DirectorError = StateError::NotFound("disk disk-1".into()).into();
        assert_eq!(err.code(), codes::RESOURCE_NOT_FOUND);
        assert_eq!(err.to_string(), "disk disk-1 not found");
    }

    #[test]
    fn undecodable_rows_are_internal_errors() {
        let codec = serde_json::from_slice::<u64>(b"{").unwrap_err();
        let err: DirectorError = StateError::from(codec).into();
        assert_eq!(err.code(), codes::SYSTEM_ERROR);
        assert!(err.to_string().starts_with("record encoding error"));
    }
}
