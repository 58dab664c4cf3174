use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use datafusion::arrow::array::{RecordBatch, RecordBatchOptions};
use datafusion::arrow::datatypes::{DataType, SchemaRef};
use datafusion::error::Result;
use datafusion::execution::TaskContext;
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties, RecordBatchStream,
    SendableRecordBatchStream,
};
use datafusion_common::{internal_err, DataFusionError, ScalarValue};
use futures::Stream;
use pyo3::prelude::*;

use crate::convert::PyValueConverter;
use crate::error::PyUdfResult;
use crate::provider::PyTableBindState;

/// Single-partition scan over the result iterator retained at bind time.
#[derive(Debug)]
pub struct PyTableExec {
    schema: SchemaRef,
    row_types: Vec<DataType>,
    projection: Option<Vec<usize>>,
    state: Arc<PyTableBindState>,
    properties: PlanProperties,
}

impl PyTableExec {
    /// `schema` is the (possibly projected) output schema; `full_schema`
    /// carries the declared types every produced row is converted
    /// against.
    pub fn new(
        schema: SchemaRef,
        full_schema: SchemaRef,
        projection: Option<Vec<usize>>,
        state: Arc<PyTableBindState>,
    ) -> Self {
        let properties = PlanProperties::new(
            EquivalenceProperties::new(schema.clone()),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );
        let row_types = full_schema
            .fields()
            .iter()
            .map(|field| field.data_type().clone())
            .collect();
        Self {
            schema,
            row_types,
            projection,
            state,
            properties,
        }
    }
}

impl DisplayAs for PyTableExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PyTableExec: function={}",
            self.state.function.qualified_name()
        )
    }
}

impl ExecutionPlan for PyTableExec {
    fn name(&self) -> &str {
        "PyTableExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> Result<SendableRecordBatchStream> {
        if partition != 0 {
            return internal_err!("PyTableExec supports one partition, got partition {partition}");
        }
        let batch_size = context.session_config().batch_size();
        Ok(Box::pin(PyTableStream {
            schema: self.schema.clone(),
            row_types: self.row_types.clone(),
            projection: self.projection.clone(),
            state: self.state.clone(),
            batch_size,
            done: false,
        }))
    }
}

/// Pulls rows from the shared Python iterator in engine-sized batches.
/// The stream latches into a terminal state on exhaustion and on the
/// first error.
struct PyTableStream {
    schema: SchemaRef,
    row_types: Vec<DataType>,
    projection: Option<Vec<usize>>,
    state: Arc<PyTableBindState>,
    batch_size: usize,
    done: bool,
}

impl PyTableStream {
    /// Converts up to `batch_size` rows under one GIL acquisition.
    /// `Ok(None)` means the iterator was already exhausted.
    fn next_batch(&mut self, py: Python<'_>) -> PyUdfResult<Option<RecordBatch>> {
        let converter = PyValueConverter::new(self.state.iterator.config());
        let mut rows: Vec<Vec<ScalarValue>> = Vec::new();
        while rows.len() < self.batch_size {
            match self.state.iterator.next_item(py)? {
                Some(row) => rows.push(converter.row_to_values(py, &row, &self.row_types)?),
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }
        self.build_batch(rows).map(Some)
    }

    fn build_batch(&self, rows: Vec<Vec<ScalarValue>>) -> PyUdfResult<RecordBatch> {
        let row_count = rows.len();
        let mut columns: Vec<Vec<ScalarValue>> =
            vec![Vec::with_capacity(row_count); self.row_types.len()];
        for row in rows {
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        let mut arrays = columns
            .into_iter()
            .map(ScalarValue::iter_to_array)
            .collect::<Result<Vec<_>>>()?;
        if let Some(projection) = &self.projection {
            arrays = projection.iter().map(|index| arrays[*index].clone()).collect();
        }
        let options = RecordBatchOptions::new().with_row_count(Some(row_count));
        RecordBatch::try_new_with_options(self.schema.clone(), arrays, &options)
            .map_err(|e| DataFusionError::from(e).into())
    }
}

impl Stream for PyTableStream {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Python::with_gil(|py| this.next_batch(py)) {
            Ok(Some(batch)) => Poll::Ready(Some(Ok(batch))),
            Ok(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Err(e) => {
                this.done = true;
                Poll::Ready(Some(Err(e.into())))
            }
        }
    }
}

impl RecordBatchStream for PyTableStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}
