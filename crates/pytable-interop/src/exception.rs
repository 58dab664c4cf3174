use std::fmt;

use pyo3::prelude::*;
use pyo3::types::{PyTracebackMethods, PyTypeMethods};

use crate::error::{InteropError, InteropResult};

/// Snapshot of a raised Python error: the rendered type name, message, and
/// traceback. It holds no Python references, so it can outlive the GIL and
/// travel through engine error types.
#[derive(Debug, Clone)]
pub struct PyErrorSnapshot {
    type_name: String,
    message: String,
    traceback: String,
}

impl PyErrorSnapshot {
    /// Takes the pending error from the Python thread state and renders it.
    /// The error indicator is fetched and cleared in one step; calling this
    /// without a pending error is a precondition violation and gathers
    /// nothing.
    pub fn gather(py: Python<'_>) -> InteropResult<Self> {
        match PyErr::take(py) {
            Some(err) => Ok(Self::from_err(py, &err)),
            None => Err(InteropError::internal(
                "no Python error is pending; nothing to gather",
            )),
        }
    }

    /// Renders an error that PyO3 already detached from the thread state.
    pub fn from_err(py: Python<'_>, err: &PyErr) -> Self {
        let type_name = err
            .get_type(py)
            .qualname()
            .map(|name| name.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let message = err
            .value(py)
            .str()
            .map(|text| text.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unprintable>".to_string());
        let traceback = err
            .traceback(py)
            .and_then(|traceback| traceback.format().ok())
            .unwrap_or_default();
        Self {
            type_name,
            message,
            traceback,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn traceback(&self) -> &str {
        &self.traceback
    }
}

impl fmt::Display for PyErrorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        if !self.traceback.is_empty() {
            write!(f, "\n{}", self.traceback)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pyo3::exceptions::PyValueError;
    use pyo3::prelude::*;

    use super::PyErrorSnapshot;

    #[test]
    fn test_gather_takes_the_pending_error_once() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            PyErr::new::<PyValueError, _>("boom").restore(py);
            let snapshot = PyErrorSnapshot::gather(py).unwrap();
            assert_eq!(snapshot.type_name(), "ValueError");
            assert_eq!(snapshot.message(), "boom");
            assert_eq!(snapshot.traceback(), "");
            // the indicator was cleared, so there is nothing left to gather
            assert!(PyErrorSnapshot::gather(py).is_err());
        });
    }

    #[test]
    fn test_from_err_renders_the_traceback() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let err = py
                .run(c"raise RuntimeError('from Python')", None, None)
                .unwrap_err();
            let snapshot = PyErrorSnapshot::from_err(py, &err);
            assert_eq!(snapshot.type_name(), "RuntimeError");
            assert_eq!(snapshot.message(), "from Python");
            assert!(snapshot.traceback().contains("Traceback"));
            let rendered = snapshot.to_string();
            assert!(rendered.starts_with("RuntimeError: from Python"));
            assert!(rendered.contains("Traceback"));
        });
    }
}
