use std::sync::Arc;

use datafusion::arrow::array::Array;
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::catalog::TableFunctionImpl;
use datafusion::datasource::TableProvider;
use datafusion::error::Result;
use datafusion_common::ScalarValue;
use datafusion_expr::expr::Alias;
use datafusion_expr::Expr;
use pyo3::exceptions::PyImportError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};
use pytable_interop::config::InteropConfig;
use pytable_interop::error::InteropError;
use pytable_interop::function::PyFunctionRef;
use pytable_interop::object::PyHandle;

use crate::convert::PyValueConverter;
use crate::error::{py_err, PyUdfError, PyUdfResult};
use crate::provider::{PyTableBindState, PyTableProvider};
use crate::types::parse_type_str;

/// Helper module probed at bind time. Its schema-annotation decorator
/// exposes `column_names` and `column_types` on wrapped callables.
const HELPER_MODULE: &str = "pytables";
const HELPER_CLASS: &str = "TableSchemaWrapper";

/// The `pytable` table function. Binding resolves a Python callable,
/// negotiates the output schema, and invokes the callable exactly once;
/// scans stream the retained result iterator.
#[derive(Debug)]
pub struct PyTableFunction {
    config: InteropConfig,
}

impl PyTableFunction {
    pub fn new(config: InteropConfig) -> Self {
        Self { config }
    }

    fn bind(&self, py: Python<'_>, args: BindArgs) -> PyUdfResult<PyTableProvider> {
        let converter = PyValueConverter::new(self.config);
        let BindArgs {
            mut positional,
            module,
            func,
            columns,
            kwargs,
        } = args;

        let function = match (module, func) {
            (Some(module), Some(func)) => {
                let module = string_param(&module, "module")?;
                let func = string_param(&func, "func")?;
                PyFunctionRef::resolve(py, &module, &func, self.config)?
            }
            (None, None) => {
                if positional.is_empty() {
                    return Err(PyUdfError::invalid(
                        "pytable requires a 'module:function' specifier as its first argument",
                    ));
                }
                match positional.remove(0) {
                    ScalarValue::Utf8(Some(specifier))
                    | ScalarValue::LargeUtf8(Some(specifier)) => {
                        PyFunctionRef::from_specifier(py, &specifier, self.config)?
                    }
                    other => {
                        return Err(PyUdfError::invalid(format!(
                            "the function specifier must be a string, got {}",
                            other.data_type()
                        )))
                    }
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(PyUdfError::invalid(
                    "the 'module' and 'func' parameters must be specified together",
                ))
            }
        };
        let function = wrap_with_schema_helper(py, function, self.config)?;

        let arguments = converter.to_py_tuple(py, &positional)?;
        let keyword_arguments = match &kwargs {
            Some(value) if !value.is_null() => converter.to_py_dict(py, value)?,
            _ => PyHandle::adopt_bound(PyDict::new(py).into_any(), self.config),
        };

        let schema = match &columns {
            Some(value) if !value.is_null() => declared_schema(value)?,
            _ => introspected_schema(py, &function, &arguments, &keyword_arguments)?,
        };

        // One invocation per bind; every scan shares the iterator
        // obtained here.
        let result = function.call(py, &arguments, Some(&keyword_arguments))?;
        let iterator = result.try_iter(py).map_err(|e| match e {
            InteropError::NotIterable(snapshot) => PyUdfError::invalid(format!(
                "function '{}' did not return an iterable result ({})",
                function.qualified_name(),
                snapshot.message()
            )),
            other => PyUdfError::from(other),
        })?;

        let state = PyTableBindState {
            function,
            arguments,
            keyword_arguments,
            iterator,
        };
        Ok(PyTableProvider::new(Arc::new(schema), state))
    }
}

impl TableFunctionImpl for PyTableFunction {
    fn call(&self, args: &[Expr]) -> Result<Arc<dyn TableProvider>> {
        let args = BindArgs::try_from_exprs(args)?;
        let provider = Python::with_gil(|py| self.bind(py, args))?;
        Ok(Arc::new(provider))
    }
}

/// Arguments of the table function call, separated into positional
/// literals and the recognized named parameters.
struct BindArgs {
    positional: Vec<ScalarValue>,
    module: Option<ScalarValue>,
    func: Option<ScalarValue>,
    columns: Option<ScalarValue>,
    kwargs: Option<ScalarValue>,
}

impl BindArgs {
    fn try_from_exprs(exprs: &[Expr]) -> PyUdfResult<Self> {
        let mut args = Self {
            positional: Vec::new(),
            module: None,
            func: None,
            columns: None,
            kwargs: None,
        };
        for expr in exprs {
            match expr {
                Expr::Literal(value) => args.positional.push(value.clone()),
                Expr::Alias(Alias { expr, name, .. }) => {
                    let Expr::Literal(value) = expr.as_ref() else {
                        return Err(PyUdfError::invalid(format!(
                            "only literal arguments are supported, got: {expr}"
                        )));
                    };
                    let slot = match name.as_str() {
                        "module" => &mut args.module,
                        "func" => &mut args.func,
                        "columns" => &mut args.columns,
                        "kwargs" => &mut args.kwargs,
                        other => {
                            return Err(PyUdfError::invalid(format!(
                                "unknown named parameter '{other}'"
                            )))
                        }
                    };
                    if slot.is_some() {
                        return Err(PyUdfError::invalid(format!(
                            "named parameter '{name}' given more than once"
                        )));
                    }
                    *slot = Some(value.clone());
                }
                other => {
                    return Err(PyUdfError::invalid(format!(
                        "only literal arguments are supported, got: {other}"
                    )))
                }
            }
        }
        Ok(args)
    }
}

fn string_param(value: &ScalarValue, name: &str) -> PyUdfResult<String> {
    match value {
        ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => Ok(s.clone()),
        other => Err(PyUdfError::invalid(format!(
            "the '{name}' parameter must be a string, got {}",
            other.data_type()
        ))),
    }
}

/// Wraps the callable with the schema-annotation decorator when the
/// helper module is importable and the callable is not already wrapped.
fn wrap_with_schema_helper(
    py: Python<'_>,
    function: PyFunctionRef,
    config: InteropConfig,
) -> PyUdfResult<PyFunctionRef> {
    let helper = match py.import(HELPER_MODULE) {
        Ok(module) => module,
        Err(e) if e.is_instance_of::<PyImportError>(py) => {
            log::debug!("helper module '{HELPER_MODULE}' is not importable; continuing without it");
            return Ok(function);
        }
        Err(e) => return Err(py_err(py, e)),
    };
    let class = helper.getattr(HELPER_CLASS).map_err(|e| py_err(py, e))?;
    let class = PyHandle::adopt_bound(class, config);
    if function.callable().is_instance(py, &class)? {
        return Ok(function);
    }
    let args = PyTuple::new(py, [function.callable().bind(py)?]).map_err(|e| py_err(py, e))?;
    let args = PyHandle::adopt_bound(args.into_any(), config);
    let wrapped = class.call(py, &args)?;
    Ok(function.with_callable(wrapped))
}

/// Schema from an explicit `columns` struct mapping names to SQL type
/// strings.
fn declared_schema(value: &ScalarValue) -> PyUdfResult<Schema> {
    let ScalarValue::Struct(array) = value else {
        return Err(PyUdfError::invalid(
            "the 'columns' parameter must be a struct mapping column names to type strings",
        ));
    };
    let DataType::Struct(fields) = array.data_type() else {
        return Err(PyUdfError::internal("struct scalar without a struct type"));
    };
    let mut schema_fields = Vec::with_capacity(fields.len());
    for (field, column) in fields.iter().zip(array.columns()) {
        let type_str = match ScalarValue::try_from_array(column, 0)? {
            ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => s,
            _ => {
                return Err(PyUdfError::invalid(format!(
                    "the type of column '{}' must be specified as a string",
                    field.name()
                )))
            }
        };
        schema_fields.push(Field::new(field.name(), parse_type_str(&type_str)?, true));
    }
    if schema_fields.is_empty() {
        return Err(PyUdfError::invalid("at least one column must be specified"));
    }
    Ok(Schema::new(schema_fields))
}

/// Schema negotiation through the callable's `column_names` and
/// `column_types` hooks, invoked with the bound arguments.
fn introspected_schema(
    py: Python<'_>,
    function: &PyFunctionRef,
    args: &PyHandle,
    kwargs: &PyHandle,
) -> PyUdfResult<Schema> {
    let Some(types) = introspected_types(py, function, args, kwargs)? else {
        return Err(PyUdfError::negotiation(format!(
            "no 'columns' argument was given and function '{}' does not expose column type \
             annotations; pass columns explicitly or annotate the function",
            function.qualified_name()
        )));
    };
    let names = introspected_names(py, function, args, kwargs)?.unwrap_or_default();
    if names.len() != types.len() {
        return Err(PyUdfError::negotiation(format!(
            "function '{}' reported {} column names but {} column types",
            function.qualified_name(),
            names.len(),
            types.len()
        )));
    }
    if types.is_empty() {
        return Err(PyUdfError::negotiation(format!(
            "function '{}' reported zero columns",
            function.qualified_name()
        )));
    }
    let fields = names
        .into_iter()
        .zip(types)
        .map(|(name, data_type)| Field::new(name, data_type, true))
        .collect::<Vec<_>>();
    Ok(Schema::new(fields))
}

fn introspected_types(
    py: Python<'_>,
    function: &PyFunctionRef,
    args: &PyHandle,
    kwargs: &PyHandle,
) -> PyUdfResult<Option<Vec<DataType>>> {
    let callable = function.callable();
    if !callable.has_attr(py, "column_types")? {
        return Ok(None);
    }
    let result = callable
        .attr(py, "column_types")?
        .call_with(py, args, kwargs)?;
    if result.is_none(py) {
        return Ok(None);
    }
    let iterator = result.try_iter(py).map_err(|_| {
        PyUdfError::negotiation(format!(
            "column_types() of function '{}' must return a sequence of types",
            function.qualified_name()
        ))
    })?;
    let mut types = Vec::new();
    while let Some(item) = iterator.next_item(py)? {
        match PyValueConverter::infer_type(py, &item)? {
            Some(data_type) => types.push(data_type),
            None => {
                return Err(PyUdfError::negotiation(format!(
                    "column_types() entry {} of function '{}' is not a supported type; \
                     supported annotations are str, int, and float",
                    types.len(),
                    function.qualified_name()
                )))
            }
        }
    }
    Ok(Some(types))
}

fn introspected_names(
    py: Python<'_>,
    function: &PyFunctionRef,
    args: &PyHandle,
    kwargs: &PyHandle,
) -> PyUdfResult<Option<Vec<String>>> {
    let callable = function.callable();
    if !callable.has_attr(py, "column_names")? {
        return Ok(None);
    }
    let result = callable
        .attr(py, "column_names")?
        .call_with(py, args, kwargs)?;
    if result.is_none(py) {
        return Ok(None);
    }
    let iterator = result.try_iter(py).map_err(|_| {
        PyUdfError::negotiation(format!(
            "column_names() of function '{}' must return a sequence of strings",
            function.qualified_name()
        ))
    })?;
    let mut names = Vec::new();
    while let Some(item) = iterator.next_item(py)? {
        let name = item.bind(py)?.extract::<String>().map_err(|_| {
            PyUdfError::negotiation(format!(
                "column_names() of function '{}' must return strings",
                function.qualified_name()
            ))
        })?;
        names.push(name);
    }
    Ok(Some(names))
}
