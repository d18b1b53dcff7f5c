use serde_json::{Number, Value};

use crate::models::{FilterColumn, FilterOp, FilterValueType};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

/// Request values that mean "no filter": null, empty string, empty list.
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub(crate) fn render_filter_expr(column: &FilterColumn, value: &Value) -> SqlExpr {
    let base_expr = SqlExpr::Raw(column.column.clone());
    if let Value::Array(items) = value {
        return SqlExpr::InList {
            expr: Box::new(base_expr),
            list: items
                .iter()
                .map(|v| SqlExpr::Literal(coerce(column.value_type, v)))
                .collect(),
        };
    }
    let op = match column.op.unwrap_or(FilterOp::Eq) {
        FilterOp::Eq => SqlBinaryOperator::Eq,
        FilterOp::Neq => SqlBinaryOperator::Neq,
        FilterOp::Gt => SqlBinaryOperator::Gt,
        FilterOp::Gte => SqlBinaryOperator::Gte,
        FilterOp::Lt => SqlBinaryOperator::Lt,
        FilterOp::Lte => SqlBinaryOperator::Lte,
        FilterOp::Like => SqlBinaryOperator::Like,
    };
    SqlExpr::BinaryOp {
        op,
        left: Box::new(base_expr),
        right: Box::new(SqlExpr::Literal(coerce(column.value_type, value))),
    }
}

/// Coerce a request value to the column's declared type. Values that do not
/// convert are passed through and rendered as-is.
fn coerce(value_type: Option<FilterValueType>, value: &Value) -> Value {
    match (value_type, value) {
        (Some(FilterValueType::Number), Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::Number(i.into())
            } else if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
                Value::Number(n)
            } else {
                value.clone()
            }
        }
        (Some(FilterValueType::Boolean), Value::String(s)) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" => Value::Bool(false),
                _ => value.clone(),
            }
        }
        (Some(FilterValueType::Boolean), Value::Number(n)) => {
            Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))
        }
        (Some(FilterValueType::String | FilterValueType::Date), Value::Number(_))
        | (Some(FilterValueType::String | FilterValueType::Date), Value::Bool(_)) => {
            Value::String(value.to_string())
        }
        _ => value.clone(),
    }
}
