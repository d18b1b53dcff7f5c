//! Integration tests for raw SQL validation and execution.

mod common;

use std::sync::Arc;

use serde_json::json;

use lumen::config::SandboxConfig;
use lumen::sandbox::execute_raw;
use lumen::error::ExecutionError;
use lumen::{DbType, LumenError, SqlSandbox};

use common::{responder, result, MockBackend};

fn rejected(sql: &str) -> bool {
    matches!(
        SqlSandbox::validate(sql, DbType::Postgresql),
        Err(LumenError::Sandbox(_))
    )
}

#[test]
fn accepts_read_only_statements() {
    for sql in [
        "SELECT * FROM orders",
        "select id from orders where status = 'open';",
        "WITH recent AS (SELECT * FROM orders) SELECT COUNT(*) FROM recent",
        "SELECT 'please DROP TABLE orders' AS note",
        "SELECT \"update\" FROM audit_log",
        "SELECT created_at, updated_at FROM orders",
        "SELECT 1 -- delete me later",
    ] {
        assert!(
            SqlSandbox::validate(sql, DbType::Postgresql).is_ok(),
            "should accept: {sql}"
        );
    }
}

#[test]
fn rejects_writes_and_ddl() {
    for sql in [
        "DELETE FROM orders",
        "update orders set amount = 0",
        "INSERT INTO orders VALUES (1)",
        "DROP TABLE orders",
        "TRUNCATE orders",
        "CREATE TABLE t (id int)",
        "GRANT SELECT ON orders TO public",
        "SELECT * INTO backup FROM orders",
        "WITH gone AS (DELETE FROM orders RETURNING *) SELECT * FROM gone",
        "EXEC sp_who",
        "",
        "   ;  ",
    ] {
        assert!(rejected(sql), "should reject: {sql:?}");
    }
}

#[test]
fn rejects_stacked_statements() {
    assert!(rejected("SELECT 1; SELECT 2"));
    assert!(rejected("SELECT 1; DROP TABLE orders"));
    assert!(SqlSandbox::validate("SELECT 1;;", DbType::Postgresql).is_ok());
}

#[test]
fn sql_server_brackets_are_identifiers() {
    assert!(SqlSandbox::validate("SELECT [delete] FROM dbo.flags", DbType::Mssql).is_ok());
    assert!(SqlSandbox::validate("SELECT `drop` FROM flags", DbType::Mysql).is_ok());
}

#[tokio::test]
async fn execute_raw_wraps_limit_and_reports_truncation() {
    let backend = Arc::new(MockBackend::new(
        DbType::Postgresql,
        responder(|_| {
            Ok(result(
                &["id", "id"],
                vec![vec![json!(1), json!(10)], vec![json!(2), json!(20)]],
            ))
        }),
    ));
    let config = SandboxConfig {
        timeout_ms: 1_000,
        row_limit: 2,
    };

    let response = execute_raw(backend.as_ref(), "SELECT o.id, c.id FROM o, c;", &config)
        .await
        .unwrap();
    assert_eq!(
        backend.executed(),
        vec!["SELECT * FROM (\nSELECT o.id, c.id FROM o, c\n) AS __result LIMIT 2".to_string()]
    );
    assert_eq!(response.row_count, 2);
    assert!(response.truncated);
    assert_eq!(response.db_type, DbType::Postgresql);
    let names: Vec<&str> = response.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "id_1"]);
    assert_eq!(response.rows[1]["id_1"], json!(20));

    let body = serde_json::to_value(&response).unwrap();
    assert_eq!(body["rowCount"], json!(2));
    assert_eq!(body["dbType"], json!("postgresql"));
}

#[tokio::test]
async fn execute_raw_never_reaches_backend_when_rejected() {
    let backend = MockBackend::new(DbType::Mysql, common::empty_responder());
    let err = execute_raw(&backend, "DROP TABLE orders", &SandboxConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::Sandbox(_)));
    assert_eq!(err.status_code(), 403);
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn sql_server_limit_uses_top() {
    let backend = MockBackend::new(DbType::Mssql, common::empty_responder());
    let response = execute_raw(&backend, "SELECT name FROM sys.tables", &SandboxConfig::default())
        .await
        .unwrap();
    assert!(!response.truncated);
    assert_eq!(backend.executed(), vec!["SELECT TOP 1000 name FROM sys.tables".to_string()]);
}

fn syntax_error_at(token: &'static str) -> common::Responder {
    responder(move |sql| {
        let position = sql.find(token).map(|i| sql[..i].chars().count() as u32 + 1);
        Err(LumenError::Execution(
            ExecutionError::new(format!("syntax error at or near \"{token}\""))
                .with_code("42601")
                .with_position(position),
        ))
    })
}

fn error_position(err: LumenError) -> Option<u32> {
    match err {
        LumenError::Execution(e) => e.position,
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn error_position_points_into_submitted_text() {
    let config = SandboxConfig::default();

    let backend = MockBackend::new(DbType::Postgresql, syntax_error_at("FORM"));
    let err = execute_raw(&backend, "SELECT a FORM t", &config).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(error_position(err), Some(10));

    let err = execute_raw(&backend, "\n  SELECT a FORM t;", &config)
        .await
        .unwrap_err();
    assert_eq!(error_position(err), Some(13));
}

#[tokio::test]
async fn error_position_inside_limit_wrapper_is_dropped() {
    let backend = MockBackend::new(DbType::Postgresql, syntax_error_at("__result"));
    let err = execute_raw(&backend, "SELECT a FROM t", &SandboxConfig::default())
        .await
        .unwrap_err();
    assert_eq!(error_position(err), None);
}
