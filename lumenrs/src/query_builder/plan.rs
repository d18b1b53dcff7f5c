//! Post-execution plan: maps positional SQL aliases back to request keys and
//! evaluates calculated measures over each row.

use serde_json::{Map, Value};

use crate::executor::{float_to_json, value_as_f64};
use crate::expr_parser::CalcExpr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    /// Alias emitted in SQL, e.g. `dim_0`.
    pub sql_alias: String,
    /// Key the caller sees, e.g. `region`.
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct CalculatedField {
    pub key: String,
    pub expression: String,
    pub parsed: Option<CalcExpr>,
}

#[derive(Debug, Clone, Default)]
pub struct ResultPlan {
    pub outputs: Vec<OutputColumn>,
    pub calculated: Vec<CalculatedField>,
}

impl ResultPlan {
    pub fn shape_rows(&self, rows: Vec<Map<String, Value>>) -> Vec<Map<String, Value>> {
        rows.into_iter().map(|row| self.shape_row(row)).collect()
    }

    fn shape_row(&self, mut row: Map<String, Value>) -> Map<String, Value> {
        let mut shaped = Map::with_capacity(self.outputs.len() + self.calculated.len());
        for output in &self.outputs {
            let value = row.remove(&output.sql_alias).unwrap_or(Value::Null);
            shaped.insert(output.key.clone(), value);
        }
        for field in &self.calculated {
            let value = evaluate(field, &shaped);
            shaped.insert(field.key.clone(), value);
        }
        shaped
    }
}

fn evaluate(field: &CalculatedField, row: &Map<String, Value>) -> Value {
    let Some(expr) = &field.parsed else {
        return Value::from(0);
    };
    let lookup = |name: &str| row.get(name).and_then(value_as_f64);
    match expr.eval(&lookup) {
        Some(v) if v.is_finite() => float_to_json(v),
        other => {
            tracing::debug!(
                field = %field.key,
                expression = %field.expression,
                result = ?other,
                "calculated measure defaulted to 0"
            );
            Value::from(0)
        }
    }
}
