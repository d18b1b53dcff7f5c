//! Integration tests for the query compiler.
//!
//! These tests exercise the public API: QueryCompiler, QueryRequest, DbType.

mod common;

use serde_json::json;

use lumen::models::{SortDirection, SortSpec};
use lumen::{DbType, LumenError, MeasureRequest, QueryCompiler, QueryLimits, QueryRequest};

use common::orders_source;

fn request(dimensions: &[&str], measures: Vec<MeasureRequest>) -> QueryRequest {
    QueryRequest {
        source: "orders".to_string(),
        dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
        measures,
        ..Default::default()
    }
}

fn compile(req: &QueryRequest, db_type: DbType) -> lumen::Result<lumen::CompiledQuery> {
    QueryCompiler::default().compile(&orders_source(), req, db_type.dialect())
}

#[test]
fn revenue_by_region_postgres() {
    let req = request(&["region"], vec![MeasureRequest::field("revenue")]);
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT o.region AS \"dim_0\", COALESCE(SUM(o.amount), 0) AS \"measure_0\" \
         FROM orders o GROUP BY o.region ORDER BY \"measure_0\" DESC LIMIT 1000"
    );
    assert_eq!(compiled.limit, 1000);
    let keys: Vec<&str> = compiled.plan.outputs.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(keys, vec!["region", "revenue"]);
}

#[test]
fn sql_server_uses_top_and_brackets() {
    let req = request(&["region"], vec![MeasureRequest::field("revenue")]);
    let compiled = compile(&req, DbType::Mssql).unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT TOP 1000 o.region AS [dim_0], COALESCE(SUM(o.amount), 0) AS [measure_0] \
         FROM orders o GROUP BY o.region ORDER BY [measure_0] DESC"
    );
    assert!(!compiled.sql.contains("LIMIT"));
}

#[test]
fn mysql_quotes_with_backticks() {
    let req = request(&["region"], vec![MeasureRequest::field("order_count")]);
    let compiled = compile(&req, DbType::Mysql).unwrap();
    assert!(compiled.sql.contains("COUNT(o.id) AS `measure_0`"), "{}", compiled.sql);
    assert!(compiled.sql.ends_with("LIMIT 1000"));
}

#[test]
fn group_by_follows_dimension_order() {
    let req = request(&["status", "region"], vec![MeasureRequest::field("revenue")]);
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(compiled.sql.contains("GROUP BY o.status, o.region"), "{}", compiled.sql);
}

#[test]
fn dimensions_only_has_no_default_order() {
    let req = request(&["region"], vec![]);
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(!compiled.sql.contains("ORDER BY"), "{}", compiled.sql);
}

#[test]
fn unknown_aggregation_falls_back_to_sum() {
    let req = request(
        &["region"],
        vec![MeasureRequest::field("order_count").with_aggregation("median")],
    );
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(compiled.sql.contains("COALESCE(SUM(o.id), 0)"), "{}", compiled.sql);
}

#[test]
fn sql_server_average_casts_to_float() {
    let req = request(
        &["region"],
        vec![MeasureRequest::field("revenue").with_aggregation("avg")],
    );
    let compiled = compile(&req, DbType::Mssql).unwrap();
    assert!(
        compiled.sql.contains("COALESCE(AVG(CAST(o.amount AS FLOAT)), 0)"),
        "{}",
        compiled.sql
    );
}

#[test]
fn filters_render_typed_literals_and_lists() {
    let mut req = request(&["region"], vec![MeasureRequest::field("revenue")]);
    req.filters.insert("status".into(), json!(["shipped", "delivered"]));
    req.filters.insert("min_amount".into(), json!("10"));
    req.filters.insert("region".into(), json!(""));
    req.filters.insert("not_a_filter".into(), json!("x"));

    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(
        compiled
            .sql
            .contains("WHERE (o.amount >= 10) AND o.status IN ('shipped', 'delivered') GROUP BY"),
        "{}",
        compiled.sql
    );
    assert!(!compiled.sql.contains("not_a_filter"));
}

#[test]
fn string_filters_are_escaped() {
    let mut req = request(&["region"], vec![MeasureRequest::field("revenue")]);
    req.filters.insert("region".into(), json!("O'Brien"));
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(compiled.sql.contains("(o.region = 'O''Brien')"), "{}", compiled.sql);
}

#[test]
fn joins_are_added_with_their_dependencies() {
    let req = request(&["segment"], vec![MeasureRequest::field("revenue")]);
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(
        compiled.sql.contains(
            "FROM orders o LEFT JOIN customers c ON c.id = o.customer_id \
             LEFT JOIN segments s ON s.id = c.segment_id GROUP BY"
        ),
        "{}",
        compiled.sql
    );
}

#[test]
fn joins_are_emitted_once() {
    let mut req = request(
        &["customer_country", "segment"],
        vec![MeasureRequest::field("revenue")],
    );
    req.filters.insert("country".into(), json!("US"));
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert_eq!(compiled.sql.matches("LEFT JOIN customers").count(), 1);
}

#[test]
fn unused_joins_are_pruned() {
    let req = request(&["region"], vec![MeasureRequest::field("revenue")]);
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(!compiled.sql.contains("JOIN"));
}

#[test]
fn explicit_sort_uses_output_alias() {
    let mut req = request(
        &["region"],
        vec![MeasureRequest::field("revenue").with_alias("total")],
    );
    req.sort = Some(SortSpec {
        field: "region".into(),
        direction: SortDirection::Asc,
    });
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(compiled.sql.contains("ORDER BY \"dim_0\" ASC"), "{}", compiled.sql);
    assert_eq!(compiled.plan.outputs[1].key, "total");
}

#[test]
fn sorting_by_calculated_measure_is_rejected() {
    let mut req = request(
        &["region"],
        vec![
            MeasureRequest::field("revenue"),
            MeasureRequest::field("order_count"),
            MeasureRequest::calculated("{revenue} / {order_count}", "aov"),
        ],
    );
    req.sort = Some(SortSpec {
        field: "aov".into(),
        direction: SortDirection::Desc,
    });
    assert!(matches!(
        compile(&req, DbType::Postgresql),
        Err(LumenError::Validation(_))
    ));
}

#[test]
fn calculated_measures_stay_out_of_sql() {
    let req = request(
        &["region"],
        vec![
            MeasureRequest::field("revenue"),
            MeasureRequest::field("order_count"),
            MeasureRequest::calculated("{revenue} / {order_count}", "aov"),
        ],
    );
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(!compiled.sql.contains("aov"));
    assert_eq!(compiled.plan.calculated.len(), 1);
    assert_eq!(compiled.plan.calculated[0].key, "aov");
    assert!(compiled.plan.calculated[0].parsed.is_some());
}

#[test]
fn limits_are_clamped() {
    let mut req = request(&["region"], vec![MeasureRequest::field("revenue")]);
    req.limit = Some(50_000);
    assert!(compile(&req, DbType::Postgresql).unwrap().sql.ends_with("LIMIT 10000"));

    req.limit = Some(0);
    assert_eq!(compile(&req, DbType::Postgresql).unwrap().limit, 1);

    let tight = QueryCompiler::new(QueryLimits {
        default_limit: 20,
        max_limit: 100,
        distinct_limit: 5,
    });
    req.limit = None;
    let compiled = tight
        .compile(&orders_source(), &req, DbType::Mssql.dialect())
        .unwrap();
    assert!(compiled.sql.starts_with("SELECT TOP 20 "), "{}", compiled.sql);
}

#[test]
fn unknown_fields_are_invalid() {
    let req = request(&["planet"], vec![MeasureRequest::field("revenue")]);
    assert!(matches!(
        compile(&req, DbType::Postgresql),
        Err(LumenError::InvalidField(_))
    ));

    let req = request(&["region"], vec![MeasureRequest::field("profit")]);
    assert!(matches!(
        compile(&req, DbType::Postgresql),
        Err(LumenError::InvalidField(_))
    ));
}

#[test]
fn empty_and_duplicate_requests_are_rejected() {
    let req = request(&[], vec![]);
    assert!(matches!(
        compile(&req, DbType::Postgresql),
        Err(LumenError::Validation(_))
    ));

    let req = request(
        &["region"],
        vec![MeasureRequest::field("revenue"), MeasureRequest::field("revenue")],
    );
    assert!(matches!(
        compile(&req, DbType::Postgresql),
        Err(LumenError::Validation(_))
    ));

    let req = request(&[], vec![MeasureRequest::calculated("1 + 1", "two")]);
    assert!(matches!(
        compile(&req, DbType::Postgresql),
        Err(LumenError::Validation(_))
    ));
}

#[test]
fn request_json_deserializes() {
    let req: QueryRequest = serde_json::from_value(json!({
        "source": "orders",
        "dimensions": ["region"],
        "measures": [
            {"field": "revenue", "aggregation": "max"},
            {"type": "calculated", "expression": "{revenue} * 2", "alias": "double"}
        ],
        "sort": {"field": "revenue", "direction": "DESC"},
        "connectionId": "warehouse"
    }))
    .unwrap();
    assert_eq!(req.connection_id.as_deref(), Some("warehouse"));
    let compiled = compile(&req, DbType::Postgresql).unwrap();
    assert!(compiled.sql.contains("COALESCE(MAX(o.amount), 0)"));
    assert!(compiled.sql.contains("ORDER BY \"measure_0\" DESC"));
}

#[test]
fn distinct_values_query() {
    let compiler = QueryCompiler::default();
    let sql = compiler
        .distinct_values(&orders_source(), "region", DbType::Postgresql.dialect())
        .unwrap();
    assert_eq!(
        sql,
        "SELECT DISTINCT o.region AS \"value\" FROM orders o WHERE o.region IS NOT NULL \
         ORDER BY \"value\" ASC LIMIT 500"
    );

    let sql = compiler
        .distinct_values(&orders_source(), "country", DbType::Mssql.dialect())
        .unwrap();
    assert!(sql.starts_with("SELECT DISTINCT TOP 500 c.country AS [value] FROM orders o LEFT JOIN customers"), "{sql}");

    assert!(matches!(
        compiler.distinct_values(&orders_source(), "revenue", DbType::Postgresql.dialect()),
        Err(LumenError::InvalidField(_))
    ));
}
