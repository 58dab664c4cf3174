mod temporal;

use std::fmt;
use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef, StructArray};
use datafusion::arrow::datatypes::{DataType, Fields, TimeUnit};
use datafusion_common::{DataFusionError, ScalarValue};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyInt, PyString, PyTuple};
use pyo3::IntoPyObjectExt;
use pytable_interop::config::InteropConfig;
use pytable_interop::object::PyHandle;

use crate::convert::temporal::PyTemporal;
use crate::error::{py_err, PyUdfError, PyUdfResult};

/// Why a Python value did not convert to its declared column type. These
/// failures collapse to typed nulls at the cell boundary; only row and
/// struct shape violations are fatal.
#[derive(Debug)]
struct ConversionFailure {
    target: DataType,
    detail: String,
}

impl ConversionFailure {
    fn new(target: &DataType, detail: impl Into<String>) -> Self {
        Self {
            target: target.clone(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} does not convert to {}", self.detail, self.target)
    }
}

/// Type-directed value conversion between engine scalars and Python
/// objects.
///
/// Engine to Python is total: nulls become `None`, and engine types
/// outside the supported set degrade to `None` with a debug log. Python
/// to engine validates against the declared type and produces a typed
/// null on mismatch instead of failing the query.
#[derive(Debug, Clone, Copy)]
pub struct PyValueConverter {
    config: InteropConfig,
}

impl PyValueConverter {
    pub fn new(config: InteropConfig) -> Self {
        Self { config }
    }

    pub fn to_py(&self, py: Python<'_>, value: &ScalarValue) -> PyUdfResult<PyHandle> {
        if value.is_null() {
            return Ok(PyHandle::adopt(py.None(), self.config));
        }
        let object: Bound<'_, PyAny> = match value {
            ScalarValue::Boolean(Some(v)) => PyBool::new(py, *v).to_owned().into_any(),
            ScalarValue::Int8(Some(v)) => int_object(py, i64::from(*v))?,
            ScalarValue::Int16(Some(v)) => int_object(py, i64::from(*v))?,
            ScalarValue::Int32(Some(v)) => int_object(py, i64::from(*v))?,
            ScalarValue::Int64(Some(v)) => int_object(py, *v)?,
            ScalarValue::Float32(Some(v)) => PyFloat::new(py, f64::from(*v)).into_any(),
            ScalarValue::Float64(Some(v)) => PyFloat::new(py, *v).into_any(),
            ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) => {
                PyString::new(py, v).into_any()
            }
            ScalarValue::Struct(array) => self.struct_to_dict(py, array)?,
            other => {
                log::debug!(
                    "no Python representation for values of type {}; passing None",
                    other.data_type()
                );
                py.None().into_bound(py)
            }
        };
        Ok(PyHandle::adopt_bound(object, self.config))
    }

    /// Builds the positional argument tuple for a Python call.
    pub fn to_py_tuple(&self, py: Python<'_>, values: &[ScalarValue]) -> PyUdfResult<PyHandle> {
        let objects = values
            .iter()
            .map(|value| self.to_py(py, value))
            .collect::<PyUdfResult<Vec<_>>>()?;
        let elements = objects
            .iter()
            .map(|object| object.bind(py))
            .collect::<Result<Vec<_>, _>>()?;
        let tuple = PyTuple::new(py, elements).map_err(|e| py_err(py, e))?;
        Ok(PyHandle::adopt_bound(tuple.into_any(), self.config))
    }

    /// Builds a keyword argument dict from a struct scalar.
    pub fn to_py_dict(&self, py: Python<'_>, value: &ScalarValue) -> PyUdfResult<PyHandle> {
        let ScalarValue::Struct(array) = value else {
            return Err(PyUdfError::invalid(
                "keyword arguments must be passed as a struct",
            ));
        };
        let dict = self.struct_to_dict(py, array)?;
        Ok(PyHandle::adopt_bound(dict, self.config))
    }

    fn struct_to_dict<'py>(
        &self,
        py: Python<'py>,
        array: &StructArray,
    ) -> PyUdfResult<Bound<'py, PyAny>> {
        let DataType::Struct(fields) = array.data_type() else {
            return Err(PyUdfError::internal("struct scalar without a struct type"));
        };
        let dict = PyDict::new(py);
        for (field, column) in fields.iter().zip(array.columns()) {
            let child = ScalarValue::try_from_array(column, 0)?;
            let value = self.to_py(py, &child)?;
            dict.set_item(field.name(), value.bind(py)?)
                .map_err(|e| py_err(py, e))?;
        }
        Ok(dict.into_any())
    }

    /// Converts a Python value to an engine scalar of the declared type.
    pub fn from_py(
        &self,
        py: Python<'_>,
        value: &Bound<'_, PyAny>,
        target: &DataType,
    ) -> PyUdfResult<ScalarValue> {
        match self.checked_from_py(py, value, target)? {
            Ok(converted) => Ok(converted),
            Err(failure) => {
                log::debug!("converting Python value to null: {failure}");
                null_of(target)
            }
        }
    }

    fn checked_from_py(
        &self,
        py: Python<'_>,
        value: &Bound<'_, PyAny>,
        target: &DataType,
    ) -> PyUdfResult<Result<ScalarValue, ConversionFailure>> {
        if value.is_none() {
            return null_of(target).map(Ok);
        }
        let converted = match target {
            DataType::Boolean => match value.downcast::<PyBool>() {
                Ok(v) => Ok(ScalarValue::Boolean(Some(v.is_true()))),
                Err(_) => Err(mismatch(value, target)),
            },
            DataType::Int8 => int_value::<i8>(value, target).map(|v| ScalarValue::Int8(Some(v))),
            DataType::Int16 => {
                int_value::<i16>(value, target).map(|v| ScalarValue::Int16(Some(v)))
            }
            DataType::Int32 => {
                int_value::<i32>(value, target).map(|v| ScalarValue::Int32(Some(v)))
            }
            DataType::Float32 => {
                float_value(value, target).map(|v| ScalarValue::Float32(Some(v as f32)))
            }
            DataType::Float64 => float_value(value, target).map(|v| ScalarValue::Float64(Some(v))),
            DataType::Utf8 => match value.downcast::<PyString>() {
                Ok(v) => Ok(ScalarValue::Utf8(Some(v.to_string_lossy().into_owned()))),
                Err(_) => Err(mismatch(value, target)),
            },
            DataType::Time64(TimeUnit::Microsecond) => {
                let handle = PyHandle::retain(value, self.config);
                match PyTemporal::time_micros(py, &handle)? {
                    Some(micros) => Ok(ScalarValue::Time64Microsecond(Some(micros))),
                    None => Err(mismatch(value, target)),
                }
            }
            DataType::Date32 => {
                let handle = PyHandle::retain(value, self.config);
                match PyTemporal::date_days(py, &handle)? {
                    Some(days) => Ok(ScalarValue::Date32(Some(days))),
                    None => Err(mismatch(value, target)),
                }
            }
            DataType::Timestamp(TimeUnit::Microsecond, Some(tz)) => {
                let handle = PyHandle::retain(value, self.config);
                match PyTemporal::timestamp_utc_micros(py, &handle)? {
                    Some(micros) => {
                        Ok(ScalarValue::TimestampMicrosecond(Some(micros), Some(tz.clone())))
                    }
                    None => Err(mismatch(value, target)),
                }
            }
            DataType::Struct(fields) => return self.struct_from_py(py, value, fields),
            other => Err(ConversionFailure::new(other, "unsupported target type")),
        };
        Ok(converted)
    }

    /// A non-mapping value becomes a null struct. A mapping that lacks a
    /// declared key is a fatal shape error; extra keys are ignored.
    fn struct_from_py(
        &self,
        py: Python<'_>,
        value: &Bound<'_, PyAny>,
        fields: &Fields,
    ) -> PyUdfResult<Result<ScalarValue, ConversionFailure>> {
        let Ok(mapping) = value.downcast::<PyDict>() else {
            let target = DataType::Struct(fields.clone());
            return Ok(Err(mismatch(value, &target)));
        };
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(fields.len());
        for field in fields {
            let item = mapping
                .get_item(field.name())
                .map_err(|e| py_err(py, e))?
                .ok_or_else(|| {
                    PyUdfError::row_shape(format!(
                        "missing struct key '{}' in Python mapping",
                        field.name()
                    ))
                })?;
            let child = self.from_py(py, &item, field.data_type())?;
            arrays.push(child.to_array()?);
        }
        let array =
            StructArray::try_new(fields.clone(), arrays, None).map_err(DataFusionError::from)?;
        Ok(Ok(ScalarValue::Struct(Arc::new(array))))
    }

    /// Converts one row object, any Python iterable, against the declared
    /// column types. Cardinality violations are fatal: an excess element
    /// fails as soon as it is seen, missing elements fail on exhaustion.
    pub fn row_to_values(
        &self,
        py: Python<'_>,
        row: &PyHandle,
        types: &[DataType],
    ) -> PyUdfResult<Vec<ScalarValue>> {
        let iterator = row.try_iter(py)?;
        let mut values = Vec::with_capacity(types.len());
        while let Some(item) = iterator.next_item(py)? {
            if values.len() == types.len() {
                return Err(PyUdfError::row_shape(format!(
                    "row with more than {} values was produced though {} columns were declared",
                    types.len(),
                    types.len()
                )));
            }
            values.push(self.from_py(py, item.bind(py)?, &types[values.len()])?);
        }
        if values.len() != types.len() {
            return Err(PyUdfError::row_shape(format!(
                "row with {} values was produced though {} columns were declared",
                values.len(),
                types.len()
            )));
        }
        Ok(values)
    }

    /// Maps a Python type object to a column type by identity. The
    /// supported annotations are `str`, `int`, and `float`.
    pub fn infer_type(py: Python<'_>, type_object: &PyHandle) -> PyUdfResult<Option<DataType>> {
        let bound = type_object.bind(py)?;
        let inferred = if bound.as_ptr() == py.get_type::<PyString>().as_ptr() {
            Some(DataType::Utf8)
        } else if bound.as_ptr() == py.get_type::<PyInt>().as_ptr() {
            Some(DataType::Int32)
        } else if bound.as_ptr() == py.get_type::<PyFloat>().as_ptr() {
            Some(DataType::Float64)
        } else {
            None
        };
        Ok(inferred)
    }
}

fn int_object(py: Python<'_>, value: i64) -> PyUdfResult<Bound<'_, PyAny>> {
    value.into_bound_py_any(py).map_err(|e| py_err(py, e))
}

fn int_value<'py, T: FromPyObject<'py>>(
    value: &Bound<'py, PyAny>,
    target: &DataType,
) -> Result<T, ConversionFailure> {
    let int = value
        .downcast::<PyInt>()
        .map_err(|_| mismatch(value, target))?;
    int.extract::<T>()
        .map_err(|_| ConversionFailure::new(target, "out-of-range int"))
}

fn float_value(value: &Bound<'_, PyAny>, target: &DataType) -> Result<f64, ConversionFailure> {
    let float = value
        .downcast::<PyFloat>()
        .map_err(|_| mismatch(value, target))?;
    float
        .extract::<f64>()
        .map_err(|_| ConversionFailure::new(target, "unreadable float"))
}

fn mismatch(value: &Bound<'_, PyAny>, target: &DataType) -> ConversionFailure {
    let kind = value
        .get_type()
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    ConversionFailure::new(target, format!("Python {kind} value"))
}

/// Typed null of the target type.
fn null_of(target: &DataType) -> PyUdfResult<ScalarValue> {
    let value = match target {
        DataType::Boolean => ScalarValue::Boolean(None),
        DataType::Int8 => ScalarValue::Int8(None),
        DataType::Int16 => ScalarValue::Int16(None),
        DataType::Int32 => ScalarValue::Int32(None),
        DataType::Float32 => ScalarValue::Float32(None),
        DataType::Float64 => ScalarValue::Float64(None),
        DataType::Utf8 => ScalarValue::Utf8(None),
        DataType::Time64(TimeUnit::Microsecond) => ScalarValue::Time64Microsecond(None),
        DataType::Date32 => ScalarValue::Date32(None),
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            ScalarValue::TimestampMicrosecond(None, tz.clone())
        }
        DataType::Struct(fields) => {
            ScalarValue::Struct(Arc::new(StructArray::new_null(fields.clone(), 1)))
        }
        other => ScalarValue::try_from(other)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::array::{Int32Array, StringArray};
    use datafusion::arrow::datatypes::Field;
    use pyo3::types::PyList;

    use super::*;

    fn converter() -> PyValueConverter {
        PyValueConverter::new(InteropConfig::default())
    }

    fn from_py_value<'py>(
        py: Python<'py>,
        value: impl IntoPyObjectExt<'py>,
        target: &DataType,
    ) -> ScalarValue {
        let bound = value.into_bound_py_any(py).unwrap();
        converter().from_py(py, &bound, target).unwrap()
    }

    fn struct_fields() -> Fields {
        Fields::from(vec![
            Field::new("x", DataType::Int32, true),
            Field::new("y", DataType::Utf8, true),
        ])
    }

    fn struct_scalar(x: i32, y: &str) -> ScalarValue {
        let arrays: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![x])),
            Arc::new(StringArray::from(vec![y])),
        ];
        ScalarValue::Struct(Arc::new(StructArray::new(struct_fields(), arrays, None)))
    }

    #[test]
    fn test_round_trip_primitives() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let cases = [
                ScalarValue::Boolean(Some(true)),
                ScalarValue::Int8(Some(-5)),
                ScalarValue::Int16(Some(300)),
                ScalarValue::Int32(Some(7)),
                ScalarValue::Float32(Some(1.5)),
                ScalarValue::Float64(Some(2.25)),
                ScalarValue::Utf8(Some("hi".to_string())),
            ];
            for value in cases {
                let object = converter().to_py(py, &value).unwrap();
                let back = converter()
                    .from_py(py, object.bind(py).unwrap(), &value.data_type())
                    .unwrap();
                assert_eq!(back, value);
            }
        });
    }

    #[test]
    fn test_none_becomes_typed_null() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let none = py.None().into_bound(py);
            assert_eq!(
                converter().from_py(py, &none, &DataType::Utf8).unwrap(),
                ScalarValue::Utf8(None)
            );
            assert_eq!(
                converter().from_py(py, &none, &DataType::Int32).unwrap(),
                ScalarValue::Int32(None)
            );
        });
    }

    #[test]
    fn test_mismatched_values_become_null() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            assert_eq!(
                from_py_value(py, 1_i64, &DataType::Boolean),
                ScalarValue::Boolean(None)
            );
            assert_eq!(
                from_py_value(py, 2.5_f64, &DataType::Int32),
                ScalarValue::Int32(None)
            );
            assert_eq!(
                from_py_value(py, 3_i64, &DataType::Float64),
                ScalarValue::Float64(None)
            );
            assert_eq!(
                from_py_value(py, "abc", &DataType::Int32),
                ScalarValue::Int32(None)
            );
            assert_eq!(
                from_py_value(py, 5_i64, &DataType::Utf8),
                ScalarValue::Utf8(None)
            );
        });
    }

    #[test]
    fn test_bool_converts_to_int_targets() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            assert_eq!(
                from_py_value(py, true, &DataType::Int32),
                ScalarValue::Int32(Some(1))
            );
            assert_eq!(
                from_py_value(py, true, &DataType::Boolean),
                ScalarValue::Boolean(Some(true))
            );
        });
    }

    #[test]
    fn test_out_of_range_int_becomes_null() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            assert_eq!(
                from_py_value(py, 300_i64, &DataType::Int8),
                ScalarValue::Int8(None)
            );
            assert_eq!(
                from_py_value(py, 300_i64, &DataType::Int16),
                ScalarValue::Int16(Some(300))
            );
        });
    }

    #[test]
    fn test_unsupported_target_becomes_null() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            assert_eq!(
                from_py_value(py, 5_i64, &DataType::Int64),
                ScalarValue::Int64(None)
            );
        });
    }

    #[test]
    fn test_unsupported_engine_value_passes_as_none() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let object = converter()
                .to_py(py, &ScalarValue::Date32(Some(1)))
                .unwrap();
            assert!(object.is_none(py));
        });
    }

    #[test]
    fn test_struct_round_trip() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let value = struct_scalar(1, "a");
            let object = converter().to_py(py, &value).unwrap();
            let dict = object.bind(py).unwrap();
            assert_eq!(
                dict.get_item("x").unwrap().extract::<i32>().unwrap(),
                1
            );
            assert_eq!(
                dict.get_item("y").unwrap().extract::<String>().unwrap(),
                "a"
            );

            let target = DataType::Struct(struct_fields());
            let back = converter().from_py(py, dict, &target).unwrap();
            assert_eq!(back, value);
        });
    }

    #[test]
    fn test_non_mapping_becomes_null_struct() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let target = DataType::Struct(struct_fields());
            let value = from_py_value(py, 5_i64, &target);
            assert!(value.is_null());
            assert_eq!(value.data_type(), target);
        });
    }

    #[test]
    fn test_missing_struct_key_is_fatal() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let dict = PyDict::new(py);
            dict.set_item("x", 1_i64).unwrap();
            let target = DataType::Struct(struct_fields());
            let error = converter()
                .from_py(py, dict.as_any(), &target)
                .unwrap_err()
                .to_string();
            assert!(error.contains("missing struct key 'y'"), "{error}");
        });
    }

    #[test]
    fn test_extra_struct_keys_are_ignored() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let dict = PyDict::new(py);
            dict.set_item("x", 1_i64).unwrap();
            dict.set_item("y", "a").unwrap();
            dict.set_item("extra", 9_i64).unwrap();
            let target = DataType::Struct(struct_fields());
            let value = converter().from_py(py, dict.as_any(), &target).unwrap();
            assert_eq!(value, struct_scalar(1, "a"));
        });
    }

    #[test]
    fn test_row_to_values() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let types = [DataType::Int32, DataType::Utf8];
            let row = PyTuple::new(py, [1_i64.into_pyobject(py).unwrap().into_any()])
                .unwrap()
                .into_any();
            let row = PyHandle::adopt_bound(row, InteropConfig::default());
            let error = converter()
                .row_to_values(py, &row, &types)
                .unwrap_err()
                .to_string();
            assert!(error.contains("row with 1 values"), "{error}");

            let full = PyList::new(py, [(1_i64, "a"), (2, "b")]).unwrap();
            let row = PyHandle::retain(full.get_item(0).unwrap().as_any(), InteropConfig::default());
            let values = converter().row_to_values(py, &row, &types).unwrap();
            assert_eq!(
                values,
                vec![
                    ScalarValue::Int32(Some(1)),
                    ScalarValue::Utf8(Some("a".to_string()))
                ]
            );
        });
    }

    #[test]
    fn test_row_with_excess_values_fails_fast() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let types = [DataType::Int32];
            let row = (1_i64, 2_i64, 3_i64).into_pyobject(py).unwrap().into_any();
            let row = PyHandle::adopt_bound(row, InteropConfig::default());
            let error = converter()
                .row_to_values(py, &row, &types)
                .unwrap_err()
                .to_string();
            assert!(error.contains("more than 1 values"), "{error}");
        });
    }

    #[test]
    fn test_non_iterable_row_is_fatal() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let row = 5_i64.into_pyobject(py).unwrap().into_any();
            let row = PyHandle::adopt_bound(row, InteropConfig::default());
            assert!(converter()
                .row_to_values(py, &row, &[DataType::Int32])
                .is_err());
        });
    }

    #[test]
    fn test_infer_type() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let cases = [
                (py.get_type::<PyString>(), Some(DataType::Utf8)),
                (py.get_type::<PyInt>(), Some(DataType::Int32)),
                (py.get_type::<PyFloat>(), Some(DataType::Float64)),
                (py.get_type::<PyList>(), None),
            ];
            for (type_object, expected) in cases {
                let handle = PyHandle::retain(type_object.as_any(), InteropConfig::default());
                assert_eq!(PyValueConverter::infer_type(py, &handle).unwrap(), expected);
            }
        });
    }

    #[test]
    fn test_temporal_values_through_from_py() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let date = py
                .import("datetime")
                .unwrap()
                .getattr("date")
                .unwrap()
                .call1((1970, 1, 2))
                .unwrap();
            assert_eq!(
                converter().from_py(py, &date, &DataType::Date32).unwrap(),
                ScalarValue::Date32(Some(1))
            );
            assert_eq!(
                converter()
                    .from_py(
                        py,
                        &5_i64.into_pyobject(py).unwrap().into_any(),
                        &DataType::Time64(TimeUnit::Microsecond)
                    )
                    .unwrap(),
                ScalarValue::Time64Microsecond(None)
            );
        });
    }
}
