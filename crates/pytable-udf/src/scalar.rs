use std::any::Any;

use datafusion::arrow::array::{new_empty_array, ArrayRef};
use datafusion::arrow::datatypes::DataType;
use datafusion::error::Result;
use datafusion_common::ScalarValue;
use datafusion_expr::{ColumnarValue, ScalarFunctionArgs, ScalarUDFImpl, Signature, Volatility};
use pyo3::prelude::*;
use pytable_interop::config::InteropConfig;
use pytable_interop::function::PyFunctionRef;

use crate::convert::PyValueConverter;
use crate::error::{PyUdfError, PyUdfResult};

/// The `pycall` scalar function: `pycall('module:function', args...)`.
/// The Python result is rendered as a string column; a non-string result
/// becomes null.
#[derive(Debug)]
pub struct PyScalarUdf {
    signature: Signature,
    config: InteropConfig,
}

impl PyScalarUdf {
    pub fn new(config: InteropConfig) -> Self {
        Self {
            signature: Signature::variadic_any(Volatility::Volatile),
            config,
        }
    }

    /// The specifier is resolved per row, so a column of specifiers
    /// dispatches to different functions across the batch.
    fn invoke_rows(
        &self,
        py: Python<'_>,
        columns: &[ArrayRef],
        row_count: usize,
    ) -> PyUdfResult<ArrayRef> {
        let converter = PyValueConverter::new(self.config);
        let mut results = Vec::with_capacity(row_count);
        for row in 0..row_count {
            let specifier = match ScalarValue::try_from_array(&columns[0], row)? {
                ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => s,
                other if other.is_null() => {
                    return Err(PyUdfError::invalid(
                        "the first argument of pycall must not be null",
                    ))
                }
                other => {
                    return Err(PyUdfError::invalid(format!(
                        "the first argument of pycall must be a 'module:function' string, got {}",
                        other.data_type()
                    )))
                }
            };
            let function = PyFunctionRef::from_specifier(py, &specifier, self.config)?;
            let mut arguments = Vec::with_capacity(columns.len() - 1);
            for column in &columns[1..] {
                arguments.push(ScalarValue::try_from_array(column, row)?);
            }
            let args = converter.to_py_tuple(py, &arguments)?;
            let result = function.call(py, &args, None)?;
            results.push(converter.from_py(py, result.bind(py)?, &DataType::Utf8)?);
        }
        if results.is_empty() {
            return Ok(new_empty_array(&DataType::Utf8));
        }
        Ok(ScalarValue::iter_to_array(results)?)
    }
}

impl ScalarUDFImpl for PyScalarUdf {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        "pycall"
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn return_type(&self, _arg_types: &[DataType]) -> Result<DataType> {
        Ok(DataType::Utf8)
    }

    fn invoke_with_args(&self, args: ScalarFunctionArgs) -> Result<ColumnarValue> {
        if args.args.is_empty() {
            return Err(PyUdfError::invalid(
                "pycall requires at least the function specifier argument",
            )
            .into());
        }
        let row_count = args.number_rows;
        let columns = args
            .args
            .iter()
            .map(|arg| arg.to_array(row_count))
            .collect::<Result<Vec<_>>>()?;
        let array = Python::with_gil(|py| self.invoke_rows(py, &columns, row_count))?;
        Ok(ColumnarValue::Array(array))
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::sync::Arc;

    use datafusion::arrow::array::{Int64Array, StringArray};
    use pyo3::types::PyModule;

    use super::*;

    const FIXTURE_CODE: &str = r#"
def greet(name):
    return "hello " + name

def answer():
    return 42

def boom():
    raise RuntimeError("scalar failure")
"#;

    fn register_fixtures(py: Python<'_>) {
        let sys_modules = py.import("sys").unwrap().getattr("modules").unwrap();
        if sys_modules.contains("pyscalar_fixtures").unwrap() {
            return;
        }
        let code = CString::new(FIXTURE_CODE).unwrap();
        let module = PyModule::from_code(
            py,
            code.as_c_str(),
            c"pyscalar_fixtures.py",
            c"pyscalar_fixtures",
        )
        .unwrap();
        sys_modules.set_item("pyscalar_fixtures", module).unwrap();
    }

    fn invoke(args: Vec<ColumnarValue>, number_rows: usize) -> Result<ColumnarValue> {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(register_fixtures);
        let return_type = DataType::Utf8;
        PyScalarUdf::new(InteropConfig::default()).invoke_with_args(ScalarFunctionArgs {
            args,
            number_rows,
            return_type: &return_type,
        })
    }

    fn string_result(value: ColumnarValue) -> Vec<Option<String>> {
        let ColumnarValue::Array(array) = value else {
            panic!("expected an array result");
        };
        array
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .iter()
            .map(|v| v.map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn test_pycall_over_a_column() {
        let specifiers = Arc::new(StringArray::from(vec![
            "pyscalar_fixtures:greet",
            "pyscalar_fixtures:greet",
        ]));
        let names = Arc::new(StringArray::from(vec!["ada", "grace"]));
        let result = invoke(
            vec![
                ColumnarValue::Array(specifiers),
                ColumnarValue::Array(names),
            ],
            2,
        )
        .unwrap();
        assert_eq!(
            string_result(result),
            vec![
                Some("hello ada".to_string()),
                Some("hello grace".to_string())
            ]
        );
    }

    #[test]
    fn test_pycall_broadcasts_scalar_arguments() {
        let result = invoke(
            vec![
                ColumnarValue::Scalar(ScalarValue::Utf8(Some(
                    "pyscalar_fixtures:greet".to_string(),
                ))),
                ColumnarValue::Scalar(ScalarValue::Utf8(Some("world".to_string()))),
            ],
            3,
        )
        .unwrap();
        assert_eq!(
            string_result(result),
            vec![Some("hello world".to_string()); 3]
        );
    }

    #[test]
    fn test_pycall_non_string_result_becomes_null() {
        let result = invoke(
            vec![ColumnarValue::Scalar(ScalarValue::Utf8(Some(
                "pyscalar_fixtures:answer".to_string(),
            )))],
            1,
        )
        .unwrap();
        assert_eq!(string_result(result), vec![None]);
    }

    #[test]
    fn test_pycall_python_error_fails_the_call() {
        let error = invoke(
            vec![ColumnarValue::Scalar(ScalarValue::Utf8(Some(
                "pyscalar_fixtures:boom".to_string(),
            )))],
            1,
        )
        .unwrap_err()
        .to_string();
        assert!(error.contains("scalar failure"), "{error}");
    }

    #[test]
    fn test_pycall_argument_validation() {
        let error = invoke(vec![], 1).unwrap_err().to_string();
        assert!(error.contains("requires at least"), "{error}");

        let error = invoke(
            vec![ColumnarValue::Array(Arc::new(Int64Array::from(vec![5])))],
            1,
        )
        .unwrap_err()
        .to_string();
        assert!(error.contains("must be a 'module:function' string"), "{error}");

        let error = invoke(
            vec![ColumnarValue::Scalar(ScalarValue::Utf8(None))],
            1,
        )
        .unwrap_err()
        .to_string();
        assert!(error.contains("must not be null"), "{error}");

        let error = invoke(
            vec![ColumnarValue::Scalar(ScalarValue::Utf8(Some(
                "no-colon".to_string(),
            )))],
            1,
        )
        .unwrap_err()
        .to_string();
        assert!(error.contains("module:function"), "{error}");
    }
}
