//! Read-only gate and executor for user-written SQL.
//!
//! Statements are checked on the dialect's token stream, so keywords inside
//! string literals, quoted identifiers and comments never trip the filter.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use crate::backends::BackendConnection;
use crate::config::SandboxConfig;
use crate::dialect::{strip_trailing_semicolons, DbType};
use crate::error::{ExecutionError, LumenError, Result};
use crate::executor::ColumnMeta;

const ALLOWED_LEADING: &[&str] = &["SELECT", "WITH"];

const BLOCKED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "EXEC", "EXECUTE", "MERGE", "CALL", "INTO",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSqlRequest {
    pub sql: String,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQueryResponse {
    pub rows: Vec<Map<String, Value>>,
    pub fields: Vec<ColumnMeta>,
    pub row_count: usize,
    pub truncated: bool,
    /// Wall-clock execution time in milliseconds.
    pub elapsed: u64,
    pub db_type: DbType,
}

pub struct SqlSandbox;

impl SqlSandbox {
    /// Accept a single read-only statement. Returns it with surrounding
    /// whitespace and trailing semicolons removed.
    pub fn validate(sql: &str, db_type: DbType) -> Result<String> {
        let stmt = strip_trailing_semicolons(sql);
        if stmt.is_empty() {
            return Err(LumenError::Sandbox("empty statement".to_string()));
        }

        let parser_dialect = db_type.dialect().parser_dialect();
        let tokens = Tokenizer::new(parser_dialect.as_ref(), stmt)
            .tokenize()
            .map_err(|e| LumenError::Sandbox(format!("unable to read statement: {e}")))?;

        let mut significant = tokens.iter().filter(|t| !is_trivia(t));

        match significant.next() {
            Some(Token::Word(word))
                if word.quote_style.is_none()
                    && ALLOWED_LEADING
                        .iter()
                        .any(|kw| word.value.eq_ignore_ascii_case(kw)) => {}
            _ => {
                return Err(LumenError::Sandbox(
                    "only SELECT or WITH statements are allowed".to_string(),
                ))
            }
        }

        let mut after_semicolon = false;
        for token in significant {
            if after_semicolon {
                return Err(LumenError::Sandbox(
                    "multiple statements are not allowed".to_string(),
                ));
            }
            match token {
                Token::SemiColon => after_semicolon = true,
                Token::Word(word) if word.quote_style.is_none() => {
                    if let Some(kw) = BLOCKED_KEYWORDS
                        .iter()
                        .find(|kw| word.value.eq_ignore_ascii_case(kw))
                    {
                        return Err(LumenError::Sandbox(format!("{kw} is not allowed")));
                    }
                }
                _ => {}
            }
        }

        Ok(stmt.to_string())
    }
}

fn is_trivia(token: &Token) -> bool {
    matches!(
        token,
        Token::Whitespace(
            Whitespace::Space
                | Whitespace::Newline
                | Whitespace::Tab
                | Whitespace::SingleLineComment { .. }
                | Whitespace::MultiLineComment(_)
        ) | Token::EOF
    )
}

/// Validate, row-limit and run a raw statement.
pub async fn execute_raw(
    backend: &dyn BackendConnection,
    sql: &str,
    config: &SandboxConfig,
) -> Result<RawQueryResponse> {
    let db_type = backend.db_type();
    let statement = SqlSandbox::validate(sql, db_type)?;
    let limited = backend
        .dialect()
        .apply_row_limit(&statement, config.row_limit)?;
    tracing::trace!(db_type = %db_type, sql = %limited, "executing raw SQL");

    let start = Instant::now();
    let result = backend
        .execute_sql(&limited, config.timeout())
        .await
        .map_err(|err| match err {
            LumenError::Execution(e) => {
                LumenError::Execution(position_in_request(e, sql, &statement, &limited))
            }
            other => other,
        })?;
    let elapsed = start.elapsed().as_millis() as u64;

    let row_count = result.rows.len();
    let truncated = row_count as u64 >= config.row_limit;
    tracing::debug!(db_type = %db_type, rows = row_count, truncated, ms = elapsed, "raw SQL executed");

    Ok(RawQueryResponse {
        rows: result.rows,
        fields: result.columns,
        row_count,
        truncated,
        elapsed,
        db_type,
    })
}

/// Error positions count characters of the statement that ran. Rebase them
/// onto the request text, dropping any that point into the row-limit wrapper.
fn position_in_request(
    mut err: ExecutionError,
    sql: &str,
    statement: &str,
    limited: &str,
) -> ExecutionError {
    let Some(position) = err.position else {
        return err;
    };
    err.position = limited.find(statement).and_then(|offset| {
        let prefix = limited[..offset].chars().count() as u32;
        let leading = sql.find(statement).map_or(0, |i| sql[..i].chars().count()) as u32;
        let len = statement.chars().count() as u32;
        (position > prefix && position <= prefix + len).then(|| position - prefix + leading)
    });
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(sql: &str) -> Result<String> {
        SqlSandbox::validate(sql, DbType::Postgresql)
    }

    #[test]
    fn trims_whitespace_and_semicolons() {
        assert_eq!(check("  SELECT 1 ;\n").unwrap(), "SELECT 1");
    }

    #[test]
    fn leading_comments_are_skipped() {
        assert!(check("-- top orders\n/* hint */ select * from orders").is_ok());
    }

    #[test]
    fn tokenizer_errors_are_sandbox_errors() {
        assert!(matches!(
            check("SELECT 'unterminated"),
            Err(LumenError::Sandbox(_))
        ));
    }

    #[test]
    fn empty_statement_is_rejected() {
        assert!(check(" ; ").is_err());
    }
}
