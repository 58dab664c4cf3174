pub mod convert;
pub mod error;
pub mod exec;
pub mod provider;
pub mod scalar;
pub mod types;
pub mod udtf;

use std::sync::Arc;

use datafusion::prelude::SessionContext;
use datafusion_expr::ScalarUDF;
use pytable_interop::config::InteropConfig;

pub use error::{PyUdfError, PyUdfResult};
pub use provider::PyTableProvider;
pub use scalar::PyScalarUdf;
pub use udtf::PyTableFunction;

/// Registers the `pytable` table function and the `pycall` scalar
/// function on a session context.
pub fn register_python_functions(ctx: &SessionContext, config: InteropConfig) {
    ctx.register_udtf("pytable", Arc::new(PyTableFunction::new(config)));
    ctx.register_udf(ScalarUDF::from(PyScalarUdf::new(config)));
}
