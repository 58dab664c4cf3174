use thiserror::Error;

use crate::exception::PyErrorSnapshot;

pub type InteropResult<T> = Result<T, InteropError>;

#[derive(Debug, Error)]
pub enum InteropError {
    #[error("resolution error: {0}")]
    Resolution(String),
    #[error("error in Python: {0}")]
    Call(PyErrorSnapshot),
    #[error("failed to access attribute '{name}': {error}")]
    Attribute {
        name: String,
        error: PyErrorSnapshot,
    },
    #[error("object is not iterable: {0}")]
    NotIterable(PyErrorSnapshot),
    #[error("operation on an empty Python object handle")]
    EmptyHandle,
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl InteropError {
    pub fn resolution(message: impl Into<String>) -> Self {
        InteropError::Resolution(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        InteropError::Internal(message.into())
    }
}
