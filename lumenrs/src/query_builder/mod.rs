//! Compiles a [`QueryRequest`] against a [`SourceSchema`] into dialect SQL plus
//! the [`ResultPlan`] that turns raw rows into the response shape.

use std::collections::HashSet;

use crate::dialect::Dialect;
use crate::error::{LumenError, Result};
use crate::models::{QueryRequest, SortDirection, SourceSchema};
use crate::sql_ast::{OrderItem, SelectItem, SelectQuery, SqlExpr, SqlRenderer, TableRef};

mod filters;
mod joins;
mod measures;
mod plan;

pub use joins::{resolve_joins, ResolvedJoin};
pub use plan::{CalculatedField, OutputColumn, ResultPlan};

use measures::{resolve_measure, ResolvedMeasure};

/// Row caps applied to compiled queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub default_limit: u64,
    pub max_limit: u64,
    pub distinct_limit: u64,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 1_000,
            max_limit: 10_000,
            distinct_limit: 500,
        }
    }
}

impl QueryLimits {
    pub fn clamp(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
            .max(1)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub plan: ResultPlan,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryCompiler {
    limits: QueryLimits,
}

impl QueryCompiler {
    pub fn new(limits: QueryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    pub fn compile(
        &self,
        source: &SourceSchema,
        request: &QueryRequest,
        dialect: &dyn Dialect,
    ) -> Result<CompiledQuery> {
        if request.dimensions.is_empty() && request.measures.is_empty() {
            return Err(LumenError::Validation(
                "query needs at least one dimension or measure".to_string(),
            ));
        }

        let mut select = Vec::new();
        let mut group_by = Vec::new();
        let mut required_joins: Vec<&str> = Vec::new();
        let mut plan = ResultPlan::default();
        let mut output_keys: HashSet<String> = HashSet::new();

        for (i, key) in request.dimensions.iter().enumerate() {
            let dimension = source.dimensions.get(key).ok_or_else(|| {
                LumenError::InvalidField(format!(
                    "unknown dimension '{key}' on source '{}'",
                    source.name
                ))
            })?;
            claim_key(&mut output_keys, key)?;
            if let Some(join) = &dimension.join {
                required_joins.push(join);
            }
            let sql_alias = format!("dim_{i}");
            select.push(SelectItem {
                expr: SqlExpr::Raw(dimension.expr.clone()),
                alias: Some(sql_alias.clone()),
            });
            group_by.push(SqlExpr::Raw(dimension.expr.clone()));
            plan.outputs.push(OutputColumn {
                sql_alias,
                key: key.clone(),
            });
        }

        let mut first_measure_alias = None;
        let mut measure_index = 0;
        for request_measure in &request.measures {
            let resolved = resolve_measure(source, request_measure)?;
            claim_key(&mut output_keys, resolved.key())?;
            match resolved {
                ResolvedMeasure::Aggregate { key, measure, agg } => {
                    if let Some(join) = &measure.join {
                        required_joins.push(join);
                    }
                    let sql_alias = format!("measure_{measure_index}");
                    measure_index += 1;
                    select.push(SelectItem {
                        expr: SqlExpr::Aggregate {
                            agg,
                            expr: Box::new(SqlExpr::Raw(measure.expr.clone())),
                        },
                        alias: Some(sql_alias.clone()),
                    });
                    first_measure_alias.get_or_insert_with(|| sql_alias.clone());
                    plan.outputs.push(OutputColumn { sql_alias, key });
                }
                ResolvedMeasure::Calculated {
                    key,
                    expression,
                    parsed,
                } => plan.calculated.push(CalculatedField {
                    key,
                    expression,
                    parsed,
                }),
            }
        }

        if select.is_empty() {
            return Err(LumenError::Validation(
                "query needs at least one dimension or aggregate measure".to_string(),
            ));
        }

        let mut filters = Vec::new();
        for (key, value) in &request.filters {
            if filters::is_blank(value) {
                continue;
            }
            let Some(column) = source.filter_columns.get(key) else {
                tracing::debug!(source = %source.name, filter = %key, "dropping unknown filter");
                continue;
            };
            if let Some(join) = &column.join {
                required_joins.push(join);
            }
            filters.push(filters::render_filter_expr(column, value));
        }

        let order_by = match &request.sort {
            Some(sort) => {
                let output = plan
                    .outputs
                    .iter()
                    .find(|o| o.key == sort.field)
                    .ok_or_else(|| {
                        LumenError::Validation(format!(
                            "cannot sort by '{}': not a requested dimension or aggregate measure",
                            sort.field
                        ))
                    })?;
                vec![OrderItem {
                    expr: SqlExpr::Alias(output.sql_alias.clone()),
                    direction: sort.direction,
                }]
            }
            None => first_measure_alias
                .map(|alias| OrderItem {
                    expr: SqlExpr::Alias(alias),
                    direction: SortDirection::Desc,
                })
                .into_iter()
                .collect(),
        };

        let limit = self.limits.clamp(request.limit);
        let query = SelectQuery {
            distinct: false,
            select,
            from: table_ref(source),
            joins: join_clauses(source, required_joins),
            filters,
            group_by,
            order_by,
            limit: Some(limit),
        };
        let sql = SqlRenderer::new(dialect).render_select(&query);
        tracing::trace!(source = %source.name, dialect = %dialect.db_type(), %sql, "compiled query");
        Ok(CompiledQuery { sql, plan, limit })
    }

    /// `SELECT DISTINCT` over one dimension or filter column, nulls excluded,
    /// ascending, capped at the distinct-value limit.
    pub fn distinct_values(
        &self,
        source: &SourceSchema,
        field: &str,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let (expr, join) = if let Some(dimension) = source.dimensions.get(field) {
            (dimension.expr.clone(), dimension.join.as_deref())
        } else if let Some(column) = source.filter_columns.get(field) {
            (column.column.clone(), column.join.as_deref())
        } else {
            return Err(LumenError::InvalidField(format!(
                "unknown field '{field}' on source '{}'",
                source.name
            )));
        };
        let query = SelectQuery {
            distinct: true,
            select: vec![SelectItem {
                expr: SqlExpr::Raw(expr.clone()),
                alias: Some("value".to_string()),
            }],
            from: table_ref(source),
            joins: join_clauses(source, join),
            filters: vec![SqlExpr::IsNotNull(Box::new(SqlExpr::Raw(expr)))],
            group_by: Vec::new(),
            order_by: vec![OrderItem {
                expr: SqlExpr::Alias("value".to_string()),
                direction: SortDirection::Asc,
            }],
            limit: Some(self.limits.distinct_limit),
        };
        Ok(SqlRenderer::new(dialect).render_select(&query))
    }
}

fn claim_key(keys: &mut HashSet<String>, key: &str) -> Result<()> {
    if keys.insert(key.to_string()) {
        Ok(())
    } else {
        Err(LumenError::Validation(format!(
            "output key '{key}' is requested more than once; use an alias"
        )))
    }
}

fn table_ref(source: &SourceSchema) -> TableRef {
    TableRef {
        name: source.table.clone(),
        alias: source.alias.clone(),
    }
}

fn join_clauses<I, S>(source: &SourceSchema, required: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    resolve_joins(source, required)
        .into_iter()
        .map(|j| j.sql.to_string())
        .collect()
}
