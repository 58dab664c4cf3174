use datafusion_common::DataFusionError;
use pyo3::prelude::*;
use pytable_interop::error::InteropError;
use pytable_interop::exception::PyErrorSnapshot;
use thiserror::Error;

pub type PyUdfResult<T> = Result<T, PyUdfError>;

#[derive(Debug, Error)]
pub enum PyUdfError {
    #[error(transparent)]
    Interop(#[from] InteropError),
    #[error("schema negotiation failed: {0}")]
    SchemaNegotiation(String),
    #[error("row shape mismatch: {0}")]
    RowShape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    DataFusion(#[from] DataFusionError),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl PyUdfError {
    pub fn negotiation(message: impl Into<String>) -> Self {
        PyUdfError::SchemaNegotiation(message.into())
    }

    pub fn row_shape(message: impl Into<String>) -> Self {
        PyUdfError::RowShape(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PyUdfError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PyUdfError::InternalError(message.into())
    }
}

impl From<PyUdfError> for DataFusionError {
    fn from(error: PyUdfError) -> Self {
        match error {
            PyUdfError::Interop(e @ InteropError::Resolution(_)) => {
                DataFusionError::Plan(e.to_string())
            }
            PyUdfError::Interop(e) => DataFusionError::External(Box::new(e)),
            PyUdfError::SchemaNegotiation(message) => DataFusionError::Plan(message),
            PyUdfError::RowShape(message) => DataFusionError::Execution(message),
            PyUdfError::InvalidArgument(message) => DataFusionError::Plan(message),
            PyUdfError::DataFusion(e) => e,
            PyUdfError::InternalError(message) => DataFusionError::Internal(message),
        }
    }
}

/// Captures a Python exception raised through the pyo3 boundary as a call
/// failure.
pub(crate) fn py_err(py: Python<'_>, err: PyErr) -> PyUdfError {
    PyUdfError::Interop(InteropError::Call(PyErrorSnapshot::from_err(py, &err)))
}
