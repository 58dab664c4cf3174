use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::{Session, TableProvider};
use datafusion::error::Result;
use datafusion::physical_plan::ExecutionPlan;
use datafusion_expr::{Expr, TableType};
use pytable_interop::function::PyFunctionRef;
use pytable_interop::object::PyHandle;

use crate::exec::PyTableExec;

/// State produced by a successful bind: the resolved function, the
/// retained call arguments, and the result iterator every scan shares.
#[derive(Debug)]
pub struct PyTableBindState {
    pub function: PyFunctionRef,
    pub arguments: PyHandle,
    pub keyword_arguments: PyHandle,
    pub iterator: PyHandle,
}

/// Table provider over a bound Python table function.
#[derive(Debug)]
pub struct PyTableProvider {
    schema: SchemaRef,
    state: Arc<PyTableBindState>,
}

impl PyTableProvider {
    pub fn new(schema: SchemaRef, state: PyTableBindState) -> Self {
        Self {
            schema,
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl TableProvider for PyTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        _limit: Option<usize>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        let schema = match projection {
            Some(indices) => Arc::new(self.schema.project(indices)?),
            None => self.schema.clone(),
        };
        Ok(Arc::new(PyTableExec::new(
            schema,
            self.schema.clone(),
            projection.cloned(),
            self.state.clone(),
        )))
    }
}
