//! SQL Server dialect implementation.
//!
//! SQL Server has no `LIMIT`, so raw statements are bounded by editing the
//! parsed statement: the outermost SELECT gets (or has capped) a `TOP n`.
//! An ordered set operation takes `OFFSET 0 ROWS FETCH NEXT n ROWS ONLY`
//! instead, since a derived table may not carry a bare ORDER BY. Other
//! shapes that cannot carry a TOP directly (unordered set operations,
//! OFFSET/FETCH paging, percent or expression TOPs) are wrapped in a derived
//! table with any CTE hoisted in front of it.

use serde_json::Value;
use sqlparser::ast::{Expr, Ident, Query, SelectItem, SetExpr, Statement, Top, TopQuantity};
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::error::{ExecutionError, LumenError, Result};
use crate::models::Aggregation;

use super::{strip_trailing_semicolons, CatalogQueries, DbType, Dialect, LimitStyle};

#[derive(Debug, Default, Clone, Copy)]
pub struct MsSqlDialect;

impl Dialect for MsSqlDialect {
    fn db_type(&self) -> DbType {
        DbType::Mssql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Top
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::MsSqlDialect {})
    }

    fn render_aggregation(&self, agg: Aggregation, expr: &str) -> String {
        match agg {
            // AVG over an integer column truncates on SQL Server.
            Aggregation::Avg => format!("COALESCE(AVG(CAST({expr} AS FLOAT)), 0)"),
            Aggregation::Sum => format!("COALESCE(SUM({expr}), 0)"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
            Aggregation::Min => format!("COALESCE(MIN({expr}), 0)"),
            Aggregation::Max => format!("COALESCE(MAX({expr}), 0)"),
        }
    }

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Null => "NULL".to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.render_string(s),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            Value::Object(_) => self.render_string(&value.to_string()),
        }
    }

    fn version_query(&self) -> &'static str {
        "SELECT @@VERSION AS version, DB_NAME() AS [database], SUSER_SNAME() AS [user]"
    }

    fn table_count_query(&self) -> &'static str {
        "SELECT COUNT(*) AS table_count FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_TYPE = 'BASE TABLE'"
    }

    fn catalog_queries(&self) -> CatalogQueries {
        CatalogQueries {
            tables: r#"
                SELECT t.name AS table_name, 'table' AS table_type, SUM(p.rows) AS row_count
                FROM sys.tables t
                JOIN sys.partitions p ON p.object_id = t.object_id AND p.index_id IN (0, 1)
                WHERE t.schema_id = SCHEMA_ID()
                GROUP BY t.name
                UNION ALL
                SELECT v.name AS table_name, 'view' AS table_type, NULL AS row_count
                FROM sys.views v
                WHERE v.schema_id = SCHEMA_ID()
                ORDER BY table_name
            "#,
            columns: r#"
                SELECT c.TABLE_NAME AS table_name,
                    c.COLUMN_NAME AS column_name,
                    c.DATA_TYPE AS data_type,
                    CASE WHEN c.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS is_nullable,
                    CASE WHEN c.COLUMN_DEFAULT IS NULL THEN 0 ELSE 1 END AS has_default,
                    c.ORDINAL_POSITION AS position
                FROM INFORMATION_SCHEMA.COLUMNS c
                WHERE c.TABLE_SCHEMA = SCHEMA_NAME()
                ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
            "#,
            primary_keys: r#"
                SELECT kcu.TABLE_NAME AS table_name, kcu.COLUMN_NAME AS column_name
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                    ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
                WHERE tc.TABLE_SCHEMA = SCHEMA_NAME()
                    AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
            "#,
            unique_columns: r#"
                SELECT kcu.TABLE_NAME AS table_name, kcu.COLUMN_NAME AS column_name
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                    ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
                WHERE tc.TABLE_SCHEMA = SCHEMA_NAME()
                    AND tc.CONSTRAINT_TYPE = 'UNIQUE'
            "#,
            foreign_keys: r#"
                SELECT fk.name AS constraint_name,
                    tp.name AS source_table,
                    cp.name AS source_column,
                    tr.name AS target_table,
                    cr.name AS target_column
                FROM sys.foreign_keys fk
                JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
                JOIN sys.tables tp ON tp.object_id = fkc.parent_object_id
                JOIN sys.columns cp
                    ON cp.object_id = fkc.parent_object_id AND cp.column_id = fkc.parent_column_id
                JOIN sys.tables tr ON tr.object_id = fkc.referenced_object_id
                JOIN sys.columns cr
                    ON cr.object_id = fkc.referenced_object_id
                    AND cr.column_id = fkc.referenced_column_id
                WHERE tp.schema_id = SCHEMA_ID()
                ORDER BY tp.name, fk.name
            "#,
        }
    }

    fn apply_row_limit(&self, sql: &str, limit: u64) -> Result<String> {
        let stmt = strip_trailing_semicolons(sql);
        let mut statements = match Parser::parse_sql(&sqlparser::dialect::MsSqlDialect {}, stmt) {
            Ok(statements) => statements,
            Err(err) => return wrap_unparsed(stmt, limit, &err.to_string()),
        };
        if statements.len() != 1 {
            return Err(LumenError::Sandbox(
                "exactly one statement can be row-limited".to_string(),
            ));
        }
        match statements.pop() {
            Some(Statement::Query(mut query)) => Ok(inject_top(&mut query, limit)),
            _ => Err(LumenError::Sandbox(
                "only queries can be row-limited".to_string(),
            )),
        }
    }
}

fn inject_top(query: &mut Query, limit: u64) -> String {
    let paged = query.limit_clause.is_some() || query.fetch.is_some();
    if !paged {
        if let SetExpr::Select(select) = query.body.as_mut() {
            if let Some(top) = capped_top(select.top.as_ref(), limit) {
                select.top = Some(top);
                return query.to_string();
            }
        } else if query.order_by.is_some() && query.for_clause.is_none() {
            return format!("{query} OFFSET 0 ROWS FETCH NEXT {limit} ROWS ONLY");
        }
    }
    name_unnamed_columns(query.body.as_mut());
    let with = query.with.take();
    let inner = query.to_string();
    match with {
        Some(with) => format!("{with} SELECT TOP {limit} * FROM ({inner}) AS __result"),
        None => format!("SELECT TOP {limit} * FROM ({inner}) AS __result"),
    }
}

/// A derived table needs a name for every column. Set operations take their
/// column names from the leftmost SELECT, so only that one is aliased.
fn name_unnamed_columns(body: &mut SetExpr) {
    let select = match body {
        SetExpr::Select(select) => select,
        SetExpr::SetOperation { left, .. } => return name_unnamed_columns(left),
        SetExpr::Query(query) => return name_unnamed_columns(query.body.as_mut()),
        _ => return,
    };
    for (i, item) in select.projection.iter_mut().enumerate() {
        if let SelectItem::UnnamedExpr(expr) = item {
            if !matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_)) {
                *item = SelectItem::ExprWithAlias {
                    expr: expr.clone(),
                    alias: Ident::new(format!("column_{}", i + 1)),
                };
            }
        }
    }
}

/// `None` when the existing TOP cannot be compared against `limit`.
fn capped_top(existing: Option<&Top>, limit: u64) -> Option<Top> {
    match existing {
        None => Some(Top {
            with_ties: false,
            percent: false,
            quantity: Some(TopQuantity::Constant(limit)),
        }),
        Some(Top {
            with_ties,
            percent: false,
            quantity: Some(TopQuantity::Constant(n)),
        }) => Some(Top {
            with_ties: *with_ties,
            percent: false,
            quantity: Some(TopQuantity::Constant((*n).min(limit))),
        }),
        Some(_) => None,
    }
}

// T-SQL the parser does not understand still gets bounded, unless it opens
// with a CTE, which cannot be nested inside a derived table. Unnamed columns
// in such a statement still fail inside the wrapper.
fn wrap_unparsed(stmt: &str, limit: u64, parse_error: &str) -> Result<String> {
    let opens_with_cte = stmt
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("WITH"));
    if opens_with_cte {
        return Err(LumenError::Execution(ExecutionError::new(format!(
            "unable to apply row limit: {parse_error}"
        ))));
    }
    let keywords = outer_keywords(stmt);
    let has = |k: Keyword| keywords.contains(&k);
    if has(Keyword::ORDER) && !has(Keyword::OFFSET) && !has(Keyword::TOP) && !has(Keyword::FOR) {
        tracing::debug!(error = %parse_error, "statement not parseable, appending FETCH");
        return Ok(format!(
            "{stmt}\nOFFSET 0 ROWS FETCH NEXT {limit} ROWS ONLY"
        ));
    }
    tracing::debug!(error = %parse_error, "statement not parseable, wrapping in TOP derived table");
    Ok(format!(
        "SELECT TOP {limit} * FROM (\n{stmt}\n) AS __result"
    ))
}

/// Unquoted keywords outside any parentheses. Empty when the text does not
/// tokenize.
fn outer_keywords(stmt: &str) -> Vec<Keyword> {
    let dialect = sqlparser::dialect::MsSqlDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, stmt).tokenize() else {
        return Vec::new();
    };
    let mut depth = 0usize;
    let mut keywords = Vec::new();
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Word(word) if depth == 0 && word.keyword != Keyword::NoKeyword => {
                keywords.push(word.keyword)
            }
            _ => {}
        }
    }
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(sql: &str, n: u64) -> String {
        MsSqlDialect.apply_row_limit(sql, n).unwrap()
    }

    #[test]
    fn injects_top_into_bare_select() {
        let sql = limit("SELECT a FROM t", 10);
        assert_eq!(sql, "SELECT TOP 10 a FROM t");
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn keeps_distinct_before_top() {
        assert_eq!(
            limit("select distinct a from t;", 10),
            "SELECT DISTINCT TOP 10 a FROM t"
        );
    }

    #[test]
    fn caps_existing_top() {
        assert_eq!(limit("SELECT TOP 5 a FROM t", 10), "SELECT TOP 5 a FROM t");
        assert_eq!(limit("SELECT TOP 500 a FROM t", 10), "SELECT TOP 10 a FROM t");
        assert_eq!(
            limit("SELECT DISTINCT TOP 500 a FROM t", 10),
            "SELECT DISTINCT TOP 10 a FROM t"
        );
    }

    #[test]
    fn limits_outer_select_of_cte() {
        let sql = limit("WITH x AS (SELECT a FROM t) SELECT a FROM x", 10);
        assert_eq!(sql, "WITH x AS (SELECT a FROM t) SELECT TOP 10 a FROM x");
    }

    #[test]
    fn wraps_set_operations_and_hoists_cte() {
        let sql = limit(
            "WITH x AS (SELECT a FROM t) SELECT a FROM x UNION ALL SELECT a FROM u",
            10,
        );
        assert!(sql.starts_with("WITH x AS (SELECT a FROM t) SELECT TOP 10 * FROM ("));
        assert!(sql.ends_with(") AS __result"));
    }

    #[test]
    fn ordered_set_operation_is_fetched_not_wrapped() {
        assert_eq!(
            limit("SELECT a FROM t UNION SELECT a FROM u ORDER BY a", 10),
            "SELECT a FROM t UNION SELECT a FROM u ORDER BY a OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn paged_query_keeps_order_inside_wrapper() {
        let sql = limit(
            "SELECT a FROM t ORDER BY a OFFSET 5 ROWS FETCH NEXT 50 ROWS ONLY",
            10,
        );
        assert!(sql.starts_with("SELECT TOP 10 * FROM (SELECT a FROM t ORDER BY a OFFSET 5 ROWS"));
        assert!(sql.ends_with(") AS __result"));
    }

    #[test]
    fn wrapped_expressions_get_column_names() {
        assert_eq!(
            limit("SELECT COUNT(*), a FROM t UNION ALL SELECT 1, b FROM u", 10),
            "SELECT TOP 10 * FROM (SELECT COUNT(*) AS column_1, a FROM t UNION ALL SELECT 1, b FROM u) AS __result"
        );
        let sql = limit("SELECT TOP 50 PERCENT x.a, a + 1 FROM x", 10);
        assert!(sql.contains("x.a, a + 1 AS column_2"), "{sql}");
    }

    #[test]
    fn unparsed_ordered_statement_is_fetched() {
        let sql = wrap_unparsed(
            "SELECT a FROM t UNION SELECT a FROM u ORDER BY a",
            10,
            "parse error",
        )
        .unwrap();
        assert!(sql.ends_with("\nOFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"), "{sql}");

        let sql = wrap_unparsed("SELECT (SELECT a FROM t ORDER BY a) AS b", 10, "parse error")
            .unwrap();
        assert!(sql.starts_with("SELECT TOP 10 * FROM (\n"), "{sql}");
    }

    #[test]
    fn rejects_non_queries() {
        assert!(MsSqlDialect.apply_row_limit("DELETE FROM t", 10).is_err());
    }

    #[test]
    fn quotes_with_brackets_and_renders_bits() {
        assert_eq!(MsSqlDialect.quote_ident("dim_0"), "[dim_0]");
        assert_eq!(MsSqlDialect.render_literal(&serde_json::json!(true)), "1");
    }
}
