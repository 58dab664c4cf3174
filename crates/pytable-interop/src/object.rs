use std::fmt;

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyInt, PyIterator, PyTuple};

use crate::config::InteropConfig;
use crate::error::{InteropError, InteropResult};
use crate::exception::PyErrorSnapshot;

/// Owned handle to a Python object, or the empty handle.
///
/// The handle stores a GIL-independent reference, so it is `Send` and
/// `Sync`; every operation that touches the interpreter takes a `Python`
/// token. Dropping a non-empty handle releases the reference exactly once,
/// unless release is suppressed through [`InteropConfig::disable_release`]
/// or [`PyHandle::leak_on_drop`].
pub struct PyHandle {
    object: Option<Py<PyAny>>,
    config: InteropConfig,
    suppress_release: bool,
}

impl PyHandle {
    /// Assumes ownership of an already-owned reference.
    pub fn adopt(object: Py<PyAny>, config: InteropConfig) -> Self {
        let handle = Self {
            object: Some(object),
            config,
            suppress_release: false,
        };
        handle.trace("adopt");
        handle
    }

    /// Assumes ownership of a bound reference.
    pub fn adopt_bound(object: Bound<'_, PyAny>, config: InteropConfig) -> Self {
        Self::adopt(object.unbind(), config)
    }

    /// Retains a borrowed reference, incrementing its refcount.
    pub fn retain(object: &Bound<'_, PyAny>, config: InteropConfig) -> Self {
        Self::adopt(object.clone().unbind(), config)
    }

    pub fn empty(config: InteropConfig) -> Self {
        Self {
            object: None,
            config,
            suppress_release: false,
        }
    }

    /// Explicit duplicate; retains the referent and copies the release
    /// policy.
    pub fn clone_ref(&self, py: Python<'_>) -> Self {
        let handle = Self {
            object: self.object.as_ref().map(|object| object.clone_ref(py)),
            config: self.config,
            suppress_release: self.suppress_release,
        };
        handle.trace("clone");
        handle
    }

    /// Marks this handle to leak its reference on drop. Diagnostic only;
    /// never load-bearing for correctness.
    pub fn leak_on_drop(&mut self) {
        self.suppress_release = true;
    }

    pub fn config(&self) -> InteropConfig {
        self.config
    }

    pub fn is_empty(&self) -> bool {
        self.object.is_none()
    }

    pub fn is_callable(&self, py: Python<'_>) -> bool {
        match &self.object {
            Some(object) => object.bind(py).is_callable(),
            None => false,
        }
    }

    pub fn is_none(&self, py: Python<'_>) -> bool {
        match &self.object {
            Some(object) => object.bind(py).is_none(),
            None => false,
        }
    }

    /// Borrows the underlying object bound to the GIL token.
    pub fn bind<'py>(&self, py: Python<'py>) -> InteropResult<&Bound<'py, PyAny>> {
        match &self.object {
            Some(object) => Ok(object.bind(py)),
            None => Err(InteropError::EmptyHandle),
        }
    }

    /// Attribute access by name. An absent attribute surfaces the Python
    /// `AttributeError` in the returned error.
    pub fn attr(&self, py: Python<'_>, name: &str) -> InteropResult<PyHandle> {
        let attr = self
            .bind(py)?
            .getattr(name)
            .map_err(|e| InteropError::Attribute {
                name: name.to_string(),
                error: PyErrorSnapshot::from_err(py, &e),
            })?;
        Ok(Self::adopt_bound(attr, self.config))
    }

    /// Probes for an attribute without raising on absence.
    pub fn has_attr(&self, py: Python<'_>, name: &str) -> InteropResult<bool> {
        self.bind(py)?
            .hasattr(name)
            .map_err(|e| call_error(py, e))
    }

    pub fn is_instance(&self, py: Python<'_>, class: &PyHandle) -> InteropResult<bool> {
        self.bind(py)?
            .is_instance(class.bind(py)?)
            .map_err(|e| call_error(py, e))
    }

    pub fn call0(&self, py: Python<'_>) -> InteropResult<PyHandle> {
        let result = self.bind(py)?.call0().map_err(|e| call_error(py, e))?;
        Ok(Self::adopt_bound(result, self.config))
    }

    /// Calls with positional arguments; `args` must hold a Python tuple.
    pub fn call(&self, py: Python<'_>, args: &PyHandle) -> InteropResult<PyHandle> {
        let args = tuple_args(py, args)?;
        let result = self
            .bind(py)?
            .call1(args)
            .map_err(|e| call_error(py, e))?;
        Ok(Self::adopt_bound(result, self.config))
    }

    /// Calls with positional and keyword arguments; `args` must hold a
    /// Python tuple and `kwargs` a Python dict.
    pub fn call_with(
        &self,
        py: Python<'_>,
        args: &PyHandle,
        kwargs: &PyHandle,
    ) -> InteropResult<PyHandle> {
        let args = tuple_args(py, args)?;
        let kwargs = dict_kwargs(py, kwargs)?;
        let result = self
            .bind(py)?
            .call(args, Some(&kwargs))
            .map_err(|e| call_error(py, e))?;
        Ok(Self::adopt_bound(result, self.config))
    }

    pub fn call_attr0(&self, py: Python<'_>, name: &str) -> InteropResult<PyHandle> {
        self.attr(py, name)?.call0(py)
    }

    pub fn call_attr(&self, py: Python<'_>, name: &str, args: &PyHandle) -> InteropResult<PyHandle> {
        self.attr(py, name)?.call(py, args)
    }

    /// Obtains an iterator from an iterable object.
    pub fn try_iter(&self, py: Python<'_>) -> InteropResult<PyHandle> {
        let iterator = self
            .bind(py)?
            .try_iter()
            .map_err(|e| InteropError::NotIterable(PyErrorSnapshot::from_err(py, &e)))?;
        Ok(Self::adopt_bound(iterator.into_any(), self.config))
    }

    /// Advances this handle as an iterator. Returns `Ok(None)` on
    /// exhaustion. An error raised while resuming the iterator (lazy
    /// generators do arbitrary work here) surfaces as a call error.
    pub fn next_item(&self, py: Python<'_>) -> InteropResult<Option<PyHandle>> {
        let mut iterator = self
            .bind(py)?
            .clone()
            .downcast_into::<PyIterator>()
            .map_err(|_| InteropError::internal("next_item() requires an iterator"))?;
        match iterator.next() {
            None => Ok(None),
            Some(Ok(item)) => Ok(Some(Self::adopt_bound(item, self.config))),
            Some(Err(e)) => Err(call_error(py, e)),
        }
    }

    pub fn str_value(&self, py: Python<'_>) -> InteropResult<String> {
        let text = self.bind(py)?.str().map_err(|e| call_error(py, e))?;
        Ok(text.to_string_lossy().into_owned())
    }

    pub fn as_i64(&self, py: Python<'_>) -> InteropResult<i64> {
        let value = self
            .bind(py)?
            .downcast::<PyInt>()
            .map_err(|_| InteropError::internal("expected a Python int"))?;
        value.extract::<i64>().map_err(|e| call_error(py, e))
    }

    /// Identity-based debug string; does not call into Python.
    pub fn debug_repr(&self) -> String {
        match &self.object {
            Some(object) => format!("<object at {:p}>", object.as_ptr()),
            None => "<empty>".to_string(),
        }
    }

    fn trace(&self, action: &str) {
        if self.config.log_refcounts {
            log::trace!("python handle {}: {}", action, self.debug_repr());
        }
    }
}

fn call_error(py: Python<'_>, err: PyErr) -> InteropError {
    InteropError::Call(PyErrorSnapshot::from_err(py, &err))
}

fn tuple_args<'py>(py: Python<'py>, args: &PyHandle) -> InteropResult<Bound<'py, PyTuple>> {
    args.bind(py)?
        .downcast::<PyTuple>()
        .map(|args| args.clone())
        .map_err(|_| InteropError::internal("positional arguments must be a Python tuple"))
}

fn dict_kwargs<'py>(py: Python<'py>, kwargs: &PyHandle) -> InteropResult<Bound<'py, PyDict>> {
    kwargs
        .bind(py)?
        .downcast::<PyDict>()
        .map(|kwargs| kwargs.clone())
        .map_err(|_| InteropError::internal("keyword arguments must be a Python dict"))
}

impl fmt::Debug for PyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PyHandle").field(&self.debug_repr()).finish()
    }
}

impl Drop for PyHandle {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        if self.config.disable_release || self.suppress_release {
            if self.config.log_refcounts {
                log::trace!("python handle leak: <object at {:p}>", object.as_ptr());
            }
            std::mem::forget(object);
        } else {
            if self.config.log_refcounts {
                log::trace!("python handle release: <object at {:p}>", object.as_ptr());
            }
            drop(object);
        }
    }
}
