use pyo3::prelude::*;

use crate::config::InteropConfig;
use crate::error::{InteropError, InteropResult};
use crate::exception::PyErrorSnapshot;
use crate::object::PyHandle;

/// Parses a `"module:function"` specifier. Exactly one colon is required,
/// with a non-empty module and function on either side.
pub fn parse_specifier(specifier: &str) -> InteropResult<(&str, &str)> {
    let mut parts = specifier.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(module), Some(function), None) if !module.is_empty() && !function.is_empty() => {
            Ok((module, function))
        }
        _ => Err(InteropError::resolution(format!(
            "function specifier '{specifier}' must have the form 'module:function'"
        ))),
    }
}

/// A resolved module-level Python callable.
#[derive(Debug)]
pub struct PyFunctionRef {
    module_name: String,
    function_name: String,
    callable: PyHandle,
}

impl PyFunctionRef {
    /// Imports `module` and resolves `function` inside it. The attribute
    /// must exist and be callable.
    pub fn resolve(
        py: Python<'_>,
        module: &str,
        function: &str,
        config: InteropConfig,
    ) -> InteropResult<Self> {
        let module_object = py.import(module).map_err(|e| {
            let snapshot = PyErrorSnapshot::from_err(py, &e);
            InteropError::resolution(format!(
                "failed to import module '{module}': {}: {}",
                snapshot.type_name(),
                snapshot.message()
            ))
        })?;
        let has_function = module_object
            .hasattr(function)
            .map_err(|e| InteropError::Call(PyErrorSnapshot::from_err(py, &e)))?;
        if !has_function {
            return Err(InteropError::resolution(format!(
                "module '{module}' has no function '{function}'"
            )));
        }
        let callable = module_object
            .getattr(function)
            .map_err(|e| InteropError::Call(PyErrorSnapshot::from_err(py, &e)))?;
        if !callable.is_callable() {
            return Err(InteropError::resolution(format!(
                "'{module}:{function}' is not callable"
            )));
        }
        Ok(Self {
            module_name: module.to_string(),
            function_name: function.to_string(),
            callable: PyHandle::adopt_bound(callable, config),
        })
    }

    pub fn from_specifier(
        py: Python<'_>,
        specifier: &str,
        config: InteropConfig,
    ) -> InteropResult<Self> {
        let (module, function) = parse_specifier(specifier)?;
        Self::resolve(py, module, function, config)
    }

    /// Wraps an already-resolved callable under the given names.
    pub fn from_parts(
        module_name: impl Into<String>,
        function_name: impl Into<String>,
        callable: PyHandle,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            function_name: function_name.into(),
            callable,
        }
    }

    /// Replaces the callable, keeping the resolved names.
    pub fn with_callable(self, callable: PyHandle) -> Self {
        Self { callable, ..self }
    }

    pub fn call(
        &self,
        py: Python<'_>,
        args: &PyHandle,
        kwargs: Option<&PyHandle>,
    ) -> InteropResult<PyHandle> {
        match kwargs {
            Some(kwargs) => self.callable.call_with(py, args, kwargs),
            None => self.callable.call(py, args),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.module_name, self.function_name)
    }

    pub fn callable(&self) -> &PyHandle {
        &self.callable
    }
}

#[cfg(test)]
mod tests {
    use pyo3::prelude::*;
    use pyo3::types::PyTuple;

    use super::{parse_specifier, PyFunctionRef};
    use crate::config::InteropConfig;
    use crate::error::InteropError;
    use crate::object::PyHandle;

    fn config() -> InteropConfig {
        InteropConfig::default()
    }

    #[test]
    fn test_parse_specifier() {
        assert_eq!(parse_specifier("mymod:myfunc").unwrap(), ("mymod", "myfunc"));
        assert_eq!(parse_specifier("pkg.sub:f").unwrap(), ("pkg.sub", "f"));
        assert!(parse_specifier("mymod").is_err());
        assert!(parse_specifier("a:b:c").is_err());
        assert!(parse_specifier(":f").is_err());
        assert!(parse_specifier("m:").is_err());
        assert!(parse_specifier("").is_err());
    }

    #[test]
    fn test_resolve_and_call() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let function = PyFunctionRef::from_specifier(py, "math:pow", config()).unwrap();
            assert_eq!(function.module_name(), "math");
            assert_eq!(function.function_name(), "pow");
            assert_eq!(function.qualified_name(), "math:pow");

            let args = PyTuple::new(py, [2.0_f64, 10.0]).unwrap().into_any();
            let args = PyHandle::adopt_bound(args, config());
            let result = function.call(py, &args, None).unwrap();
            assert_eq!(result.str_value(py).unwrap(), "1024.0");
        });
    }

    #[test]
    fn test_from_parts_and_replacement() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let sqrt = PyFunctionRef::from_specifier(py, "math:sqrt", config()).unwrap();
            let replacement = py.import("math").unwrap().getattr("floor").unwrap();
            let replacement = PyHandle::adopt_bound(replacement, config());

            let function = PyFunctionRef::from_parts("math", "floor", replacement.clone_ref(py));
            assert_eq!(function.qualified_name(), "math:floor");

            // with_callable keeps the resolved names
            let swapped = sqrt.with_callable(replacement);
            assert_eq!(swapped.qualified_name(), "math:sqrt");
            let args = PyTuple::new(py, [2.5_f64]).unwrap().into_any();
            let args = PyHandle::adopt_bound(args, config());
            let result = swapped.call(py, &args, None).unwrap();
            assert_eq!(result.as_i64(py).unwrap(), 2);
        });
    }

    #[test]
    fn test_resolution_failures() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            // missing module
            assert!(matches!(
                PyFunctionRef::from_specifier(py, "no_such_module_pytable:f", config()),
                Err(InteropError::Resolution(_))
            ));
            // missing function
            assert!(matches!(
                PyFunctionRef::resolve(py, "math", "no_such_function", config()),
                Err(InteropError::Resolution(_))
            ));
            // not callable
            match PyFunctionRef::resolve(py, "math", "pi", config()) {
                Err(InteropError::Resolution(message)) => {
                    assert!(message.contains("not callable"))
                }
                other => panic!("expected a resolution error, got {other:?}"),
            }
        });
    }
}
