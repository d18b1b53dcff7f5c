use std::collections::BTreeMap;
use std::fmt;

use serde::{de, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A logical data source: one physical table or view plus the semantic
/// vocabulary (dimensions, measures, joins, filters) defined over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSchema {
    pub name: String,
    pub label: Option<String>,
    pub table: String,
    /// Alias the SQL fragments use for the base table, e.g. `o` in `o.region`.
    pub alias: Option<String>,
    /// Connection the source lives on; `None` means the default connection.
    pub connection_id: Option<String>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, Dimension>,
    #[serde(default)]
    pub measures: BTreeMap<String, Measure>,
    #[serde(default)]
    pub joins: BTreeMap<String, JoinDef>,
    #[serde(default)]
    pub filter_columns: BTreeMap<String, FilterColumn>,
    pub description: Option<String>,
}

impl SourceSchema {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dimension {
    pub expr: String,
    pub label: Option<String>,
    pub join: Option<String>,
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Dimension {
                expr: s,
                label: None,
                join: None,
            }),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    expr: String,
                    label: Option<String>,
                    join: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(Dimension {
                    expr: full.expr,
                    label: full.label,
                    join: full.join,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    pub expr: String,
    pub label: Option<String>,
    #[serde(default)]
    pub default_agg: Aggregation,
    pub join: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinDef {
    /// Complete join clause, e.g. `LEFT JOIN customers c ON c.id = o.customer_id`.
    pub sql: String,
    pub requires: Vec<String>,
}

impl<'de> Deserialize<'de> for JoinDef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(sql) => Ok(JoinDef {
                sql,
                requires: Vec::new(),
            }),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    sql: String,
                    #[serde(default)]
                    requires: Vec<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(JoinDef {
                    sql: full.sql,
                    requires: full.requires,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterColumn {
    pub column: String,
    #[serde(rename = "type")]
    pub value_type: Option<FilterValueType>,
    pub op: Option<FilterOp>,
    pub join: Option<String>,
}

impl<'de> Deserialize<'de> for FilterColumn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(column) => Ok(FilterColumn {
                column,
                value_type: None,
                op: None,
                join: None,
            }),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    column: String,
                    #[serde(rename = "type")]
                    value_type: Option<FilterValueType>,
                    op: Option<FilterOp>,
                    join: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(FilterColumn {
                    column: full.column,
                    value_type: full.value_type,
                    op: full.op,
                    join: full.join,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Sum,
    Count,
    CountDistinct,
    Avg,
    Min,
    Max,
}

impl Aggregation {
    /// Lenient lookup used for request payloads: anything unrecognized sums.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "count" => Aggregation::Count,
            "count_distinct" | "countdistinct" | "distinct_count" => Aggregation::CountDistinct,
            "avg" | "average" | "mean" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            _ => Aggregation::Sum,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::CountDistinct => "count_distinct",
            Aggregation::Avg => "avg",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "<>", alias = "neq")]
    Neq,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "like", alias = "LIKE")]
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterValueType {
    String,
    Number,
    Boolean,
    Date,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub source: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub measures: Vec<MeasureRequest>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    pub sort: Option<SortSpec>,
    pub limit: Option<u64>,
    /// Overrides the source's connection.
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasureRequest {
    pub field: Option<String>,
    pub expression: Option<String>,
    pub aggregation: Option<String>,
    pub alias: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MeasureKind,
}

impl MeasureRequest {
    pub fn field(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            ..Default::default()
        }
    }

    pub fn calculated(expression: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            alias: Some(alias.into()),
            kind: MeasureKind::Calculated,
            ..Default::default()
        }
    }

    pub fn with_aggregation(mut self, aggregation: impl Into<String>) -> Self {
        self.aggregation = Some(aggregation.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureKind {
    Calculated,
    #[default]
    #[serde(other)]
    Aggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => f.write_str("ASC"),
            SortDirection::Desc => f.write_str("DESC"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub data: Vec<Map<String, Value>>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMeta {
    pub total: usize,
}
