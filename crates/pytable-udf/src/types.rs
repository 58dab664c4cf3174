use datafusion::arrow::datatypes::{DataType, Field, Fields, TimeUnit};
use datafusion::sql::sqlparser::ast;
use datafusion::sql::sqlparser::ast::TimezoneInfo;
use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::parser::Parser;
use datafusion::sql::sqlparser::tokenizer::Token;

use crate::error::{PyUdfError, PyUdfResult};

/// Timezone attached to `TIMESTAMPTZ` columns. Aware instants are
/// normalized to UTC during conversion, so the stored values are always
/// in this zone.
pub const TIMESTAMP_TIMEZONE: &str = "UTC";

/// Parses a SQL type string such as `INTEGER` or `STRUCT<a VARCHAR>` into
/// an Arrow data type. Only the closed set of column types understood by
/// the value converter is accepted.
pub fn parse_type_str(type_str: &str) -> PyUdfResult<DataType> {
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(type_str)
        .map_err(|e| unsupported(type_str, Some(e.to_string())))?;
    let parsed = parser
        .parse_data_type()
        .map_err(|e| unsupported(type_str, Some(e.to_string())))?;
    if parser.peek_token().token != Token::EOF {
        return Err(unsupported(type_str, Some("trailing input".to_string())));
    }
    map_type(type_str, &parsed)
}

fn map_type(type_str: &str, parsed: &ast::DataType) -> PyUdfResult<DataType> {
    use ast::DataType as SqlType;

    let mapped = match parsed {
        SqlType::Boolean | SqlType::Bool => DataType::Boolean,
        SqlType::TinyInt(_) => DataType::Int8,
        SqlType::SmallInt(_) => DataType::Int16,
        SqlType::Int(_) | SqlType::Integer(_) => DataType::Int32,
        SqlType::Float(_) | SqlType::Real => DataType::Float32,
        SqlType::Double { .. } | SqlType::DoublePrecision => DataType::Float64,
        SqlType::Varchar(_) | SqlType::Text | SqlType::String(_) => DataType::Utf8,
        SqlType::Time(None, TimezoneInfo::None) => DataType::Time64(TimeUnit::Microsecond),
        SqlType::Date => DataType::Date32,
        SqlType::Timestamp(None, TimezoneInfo::Tz | TimezoneInfo::WithTimeZone) => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TIMEZONE.into()))
        }
        SqlType::Struct(fields, _) => {
            let fields = fields
                .iter()
                .map(|field| {
                    let name = field.field_name.as_ref().ok_or_else(|| {
                        unsupported(type_str, Some("struct fields must be named".to_string()))
                    })?;
                    let child = map_type(type_str, &field.field_type)?;
                    Ok(Field::new(name.value.clone(), child, true))
                })
                .collect::<PyUdfResult<Vec<_>>>()?;
            DataType::Struct(Fields::from(fields))
        }
        _ => return Err(unsupported(type_str, None)),
    };
    Ok(mapped)
}

fn unsupported(type_str: &str, detail: Option<String>) -> PyUdfError {
    match detail {
        Some(detail) => {
            PyUdfError::negotiation(format!("unsupported column type '{type_str}': {detail}"))
        }
        None => PyUdfError::negotiation(format!("unsupported column type '{type_str}'")),
    }
}
