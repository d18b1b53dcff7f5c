//! Minimal SELECT model for compiled queries and its dialect-aware printer.

use serde_json::Value;

use crate::dialect::{Dialect, LimitStyle};
use crate::models::{Aggregation, SortDirection};

/// Expression tree for compiled queries. `Raw` carries SQL fragments authored
/// in the source registry; request values only ever enter as `Literal`.
#[derive(Debug, Clone)]
pub enum SqlExpr {
    Raw(String),
    /// Reference to an output alias, quoted per dialect.
    Alias(String),
    Literal(Value),
    Aggregate {
        agg: Aggregation,
        expr: Box<SqlExpr>,
    },
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
    },
    IsNotNull(Box<SqlExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl SqlBinaryOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlBinaryOperator::Eq => "=",
            SqlBinaryOperator::Neq => "<>",
            SqlBinaryOperator::Gt => ">",
            SqlBinaryOperator::Gte => ">=",
            SqlBinaryOperator::Lt => "<",
            SqlBinaryOperator::Lte => "<=",
            SqlBinaryOperator::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    /// Complete join clauses in dependency order.
    pub joins: Vec<String>,
    /// ANDed together.
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Print `query` as one line. The row cap becomes `TOP n` or a trailing
    /// `LIMIT n` depending on the dialect.
    pub fn render_select(&self, query: &SelectQuery) -> String {
        let limit_style = self.dialect.limit_style();
        let mut parts: Vec<String> = Vec::with_capacity(8);

        let mut head = String::from("SELECT");
        if query.distinct {
            head.push_str(" DISTINCT");
        }
        if let (Some(n), LimitStyle::Top) = (query.limit, limit_style) {
            head.push_str(&format!(" TOP {n}"));
        }
        parts.push(head);

        let columns: Vec<String> = query.select.iter().map(|item| self.item(item)).collect();
        parts.push(columns.join(", "));
        parts.push(format!("FROM {}", self.table(&query.from)));
        parts.extend(query.joins.iter().map(|join| join.trim().to_string()));

        if let Some(predicate) = self.list(&query.filters, " AND ") {
            parts.push(format!("WHERE {predicate}"));
        }
        if let Some(groups) = self.list(&query.group_by, ", ") {
            parts.push(format!("GROUP BY {groups}"));
        }
        if !query.order_by.is_empty() {
            let keys: Vec<String> = query
                .order_by
                .iter()
                .map(|o| format!("{} {}", self.expr(&o.expr), o.direction))
                .collect();
            parts.push(format!("ORDER BY {}", keys.join(", ")));
        }
        if let (Some(n), LimitStyle::Limit) = (query.limit, limit_style) {
            parts.push(format!("LIMIT {n}"));
        }

        parts.join(" ")
    }

    fn item(&self, item: &SelectItem) -> String {
        let sql = self.expr(&item.expr);
        match &item.alias {
            Some(alias) => format!("{sql} AS {}", self.dialect.quote_ident(alias)),
            None => sql,
        }
    }

    fn table(&self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!("{} {alias}", table.name),
            None => table.name.clone(),
        }
    }

    fn list(&self, exprs: &[SqlExpr], separator: &str) -> Option<String> {
        if exprs.is_empty() {
            return None;
        }
        let rendered: Vec<String> = exprs.iter().map(|e| self.expr(e)).collect();
        Some(rendered.join(separator))
    }

    fn expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Raw(sql) => sql.clone(),
            SqlExpr::Alias(name) => self.dialect.quote_ident(name),
            SqlExpr::Literal(value) => self.dialect.render_literal(value),
            SqlExpr::Aggregate { agg, expr } => {
                self.dialect.render_aggregation(*agg, &self.expr(expr))
            }
            SqlExpr::BinaryOp { op, left, right } => {
                format!("({} {} {})", self.expr(left), op.as_sql(), self.expr(right))
            }
            SqlExpr::InList { expr, list } => match self.list(list, ", ") {
                Some(values) => format!("{} IN ({values})", self.expr(expr)),
                // `IN ()` is a syntax error everywhere; an empty list matches nothing.
                None => "1 = 0".to_string(),
            },
            SqlExpr::IsNotNull(expr) => format!("{} IS NOT NULL", self.expr(expr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DbType;
    use serde_json::json;

    fn base() -> SelectQuery {
        SelectQuery {
            select: vec![SelectItem {
                expr: SqlExpr::Raw("o.region".into()),
                alias: Some("dim_0".into()),
            }],
            from: TableRef {
                name: "orders".into(),
                alias: Some("o".into()),
            },
            limit: Some(10),
            ..Default::default()
        }
    }

    #[test]
    fn limit_placement_follows_dialect() {
        let query = base();
        assert_eq!(
            SqlRenderer::new(DbType::Postgresql.dialect()).render_select(&query),
            "SELECT o.region AS \"dim_0\" FROM orders o LIMIT 10"
        );
        assert_eq!(
            SqlRenderer::new(DbType::Mssql.dialect()).render_select(&query),
            "SELECT TOP 10 o.region AS [dim_0] FROM orders o"
        );
    }

    #[test]
    fn predicates_are_parenthesized_and_anded() {
        let mut query = base();
        query.filters = vec![
            SqlExpr::BinaryOp {
                op: SqlBinaryOperator::Neq,
                left: Box::new(SqlExpr::Raw("o.status".into())),
                right: Box::new(SqlExpr::Literal(json!("void"))),
            },
            SqlExpr::InList {
                expr: Box::new(SqlExpr::Raw("o.region".into())),
                list: vec![SqlExpr::Literal(json!("EU")), SqlExpr::Literal(json!(3))],
            },
        ];
        let sql = SqlRenderer::new(DbType::Mysql.dialect()).render_select(&query);
        assert!(
            sql.contains("WHERE (o.status <> 'void') AND o.region IN ('EU', 3) LIMIT 10"),
            "{sql}"
        );
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let mut query = base();
        query.filters = vec![SqlExpr::InList {
            expr: Box::new(SqlExpr::Raw("o.region".into())),
            list: vec![],
        }];
        let sql = SqlRenderer::new(DbType::Postgresql.dialect()).render_select(&query);
        assert!(sql.contains("WHERE 1 = 0"), "{sql}");
    }
}
