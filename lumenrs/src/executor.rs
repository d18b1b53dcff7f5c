use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
}

/// Rows as JSON objects keyed by column name, plus the column order the
/// engine reported.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

impl QueryResult {
    /// Build a result from positional driver rows. Repeated column names
    /// (`SELECT a.id, b.id`) get numeric suffixes so no value is lost when
    /// rows become objects.
    pub fn from_positional(names: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let columns = dedupe_column_names(names);
        let rows = rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .map(|c| c.name.clone())
                    .zip(values.into_iter().chain(std::iter::repeat(Value::Null)))
                    .collect::<Map<String, Value>>()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First value of the first row under `column`, if any.
    pub fn scalar(&self, column: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(column))
    }
}

fn dedupe_column_names(names: Vec<String>) -> Vec<ColumnMeta> {
    let mut seen: HashSet<String> = HashSet::with_capacity(names.len());
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut suffix = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{name}_{suffix}");
                suffix += 1;
            }
            ColumnMeta { name: candidate }
        })
        .collect()
}

/// JSON number for finite floats; NaN and infinities have no JSON form.
pub(crate) fn float_to_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Exact decimal text (NUMERIC, DECIMAL, MONEY) as a JSON number when it
/// parses, else as the original string.
pub(crate) fn decimal_to_json(text: &str) -> Value {
    let text = text.trim();
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() => float_to_json(f),
        _ => Value::String(text.to_string()),
    }
}

/// Read a value as a number, accepting numeric strings. Drivers hand back
/// DECIMAL columns as strings to keep precision.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "yes" | "y"
        ),
        _ => false,
    }
}

pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duplicate_columns_get_suffixes() {
        let result = QueryResult::from_positional(
            vec!["id".into(), "id".into(), "name".into()],
            vec![vec![json!(1), json!(2), json!("a")]],
        );
        let names: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "id_1", "name"]);
        assert_eq!(result.rows[0]["id_1"], json!(2));
    }

    #[test]
    fn short_rows_are_padded_with_null() {
        let result = QueryResult::from_positional(vec!["a".into(), "b".into()], vec![vec![json!(1)]]);
        assert_eq!(result.rows[0]["b"], Value::Null);
    }

    #[test]
    fn numeric_strings_read_as_numbers() {
        assert_eq!(value_as_f64(&json!("12.50")), Some(12.5));
        assert_eq!(value_as_f64(&json!(null)), None);
        assert!(value_as_bool(&json!("YES")));
        assert!(!value_as_bool(&json!(0)));
        assert_eq!(float_to_json(f64::NAN), Value::Null);
    }

    #[test]
    fn decimals_become_numbers_when_representable() {
        assert_eq!(decimal_to_json("1500"), json!(1500));
        assert_eq!(decimal_to_json("12.50"), json!(12.5));
        assert_eq!(decimal_to_json("NaN"), json!("NaN"));
    }
}
