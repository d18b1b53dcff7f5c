//! SQL dialect abstractions for the supported database engines.
//!
//! A dialect owns everything engine-specific that is expressible as SQL text:
//! quoting, literal and aggregate rendering, the catalog queries used for
//! probing and introspection, and row-limit injection for raw statements.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LumenError, Result};
use crate::models::Aggregation;

mod mssql;
mod mysql;
mod postgres;

pub use mssql::MsSqlDialect;
pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;

static POSTGRES: PostgresDialect = PostgresDialect;
static MSSQL: MsSqlDialect = MsSqlDialect;
static MYSQL: MySqlDialect = MySqlDialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    #[serde(alias = "postgres")]
    Postgresql,
    #[serde(alias = "sqlserver")]
    Mssql,
    #[serde(alias = "mariadb")]
    Mysql,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgresql => "postgresql",
            DbType::Mssql => "mssql",
            DbType::Mysql => "mysql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DbType::Postgresql => 5432,
            DbType::Mssql => 1433,
            DbType::Mysql => 3306,
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        match self {
            DbType::Postgresql => &POSTGRES,
            DbType::Mssql => &MSSQL,
            DbType::Mysql => &MYSQL,
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = LumenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DbType::Postgresql),
            "mssql" | "sqlserver" => Ok(DbType::Mssql),
            "mysql" | "mariadb" => Ok(DbType::Mysql),
            other => Err(LumenError::Validation(format!(
                "unsupported database type: {other}"
            ))),
        }
    }
}

/// How a compiled SELECT expresses its row cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStyle {
    /// Trailing `LIMIT n`.
    Limit,
    /// `SELECT [DISTINCT] TOP n`.
    Top,
}

/// Catalog queries used for schema introspection.
///
/// Every query aliases its output columns to the lowercase names read by
/// `introspection::assemble`, so one assembler serves all engines.
#[derive(Debug, Clone, Copy)]
pub struct CatalogQueries {
    /// `table_name`, `table_type` ('table' | 'view'), `row_count`
    pub tables: &'static str,
    /// `table_name`, `column_name`, `data_type`, `is_nullable`, `has_default`, `position`
    pub columns: &'static str,
    /// `table_name`, `column_name`
    pub primary_keys: &'static str,
    /// `table_name`, `column_name`
    pub unique_columns: &'static str,
    /// `constraint_name`, `source_table`, `source_column`, `target_table`, `target_column`
    pub foreign_keys: &'static str,
}

pub trait Dialect: Send + Sync {
    fn db_type(&self) -> DbType;

    fn quote_ident(&self, ident: &str) -> String;

    fn limit_style(&self) -> LimitStyle {
        LimitStyle::Limit
    }

    /// Tokenizer/parser dialect for sandbox checks and AST rewrites.
    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect>;

    fn render_aggregation(&self, agg: Aggregation, expr: &str) -> String {
        match agg {
            Aggregation::Sum => format!("COALESCE(SUM({expr}), 0)"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
            Aggregation::Avg => format!("COALESCE(AVG({expr}), 0)"),
            Aggregation::Min => format!("COALESCE(MIN({expr}), 0)"),
            Aggregation::Max => format!("COALESCE(MAX({expr}), 0)"),
        }
    }

    fn render_string(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.render_string(s),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            Value::Object(_) => self.render_string(&value.to_string()),
        }
    }

    /// Single-row probe returning `version`, `database` and `user` columns.
    fn version_query(&self) -> &'static str;

    /// Single-row probe returning a `table_count` column.
    fn table_count_query(&self) -> &'static str;

    fn catalog_queries(&self) -> CatalogQueries;

    /// Bound a validated read-only statement to at most `limit` rows.
    fn apply_row_limit(&self, sql: &str, limit: u64) -> Result<String> {
        Ok(wrap_with_limit(sql, limit))
    }
}

/// Trim surrounding whitespace and any trailing semicolons.
pub fn strip_trailing_semicolons(sql: &str) -> &str {
    let mut stmt = sql.trim();
    while let Some(rest) = stmt.strip_suffix(';') {
        stmt = rest.trim_end();
    }
    stmt
}

/// Derived-table wrapper used by engines that support a trailing `LIMIT`.
/// The statement sits on its own lines so a trailing line comment cannot
/// swallow the closing parenthesis.
pub(crate) fn wrap_with_limit(sql: &str, limit: u64) -> String {
    let stmt = strip_trailing_semicolons(sql);
    format!("SELECT * FROM (\n{stmt}\n) AS __result LIMIT {limit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_type_parses_aliases() {
        assert_eq!("postgres".parse::<DbType>().unwrap(), DbType::Postgresql);
        assert_eq!("SQLServer".parse::<DbType>().unwrap(), DbType::Mssql);
        assert_eq!("mariadb".parse::<DbType>().unwrap(), DbType::Mysql);
        assert!("oracle".parse::<DbType>().is_err());
    }

    #[test]
    fn default_ports_per_engine() {
        assert_eq!(DbType::Postgresql.default_port(), 5432);
        assert_eq!(DbType::Mssql.default_port(), 1433);
        assert_eq!(DbType::Mysql.default_port(), 3306);
    }

    #[test]
    fn strips_trailing_semicolons_and_whitespace() {
        assert_eq!(strip_trailing_semicolons("  SELECT 1 ; ;\n"), "SELECT 1");
        assert_eq!(strip_trailing_semicolons("SELECT ';'"), "SELECT ';'");
    }

    #[test]
    fn wrapper_survives_trailing_line_comment() {
        let sql = wrap_with_limit("SELECT a FROM t -- note", 5);
        assert_eq!(sql, "SELECT * FROM (\nSELECT a FROM t -- note\n) AS __result LIMIT 5");
    }
}
