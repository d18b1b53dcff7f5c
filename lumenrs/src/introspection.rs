//! Schema introspection: runs the dialect's catalog queries and assembles
//! one engine-neutral description of tables, columns and relationships.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backends::BackendConnection;
use crate::dialect::DbType;
use crate::error::Result;
use crate::executor::{value_as_bool, value_as_f64, value_as_string};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSchema {
    pub database: String,
    pub db_type: DbType,
    pub tables: Vec<TableInfo>,
    pub relationships: Vec<Relationship>,
    pub stats: SchemaStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TableKind,
    pub columns: Vec<ColumnInfo>,
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub has_default: bool,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub is_foreign_key: bool,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub name: String,
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStats {
    pub table_count: usize,
    pub view_count: usize,
    pub relationship_count: usize,
    pub total_columns: usize,
}

/// Raw catalog rows, one set per catalog query.
#[derive(Debug, Clone, Default)]
pub struct CatalogRows {
    pub tables: Vec<Map<String, Value>>,
    pub columns: Vec<Map<String, Value>>,
    pub primary_keys: Vec<Map<String, Value>>,
    pub unique_columns: Vec<Map<String, Value>>,
    pub foreign_keys: Vec<Map<String, Value>>,
}

pub async fn introspect(
    backend: &dyn BackendConnection,
    database: &str,
    timeout: Duration,
) -> Result<DatabaseSchema> {
    let queries = backend.dialect().catalog_queries();
    tracing::debug!(database, db_type = %backend.db_type(), "introspecting schema");
    let rows = CatalogRows {
        tables: backend.execute_sql(queries.tables, timeout).await?.rows,
        columns: backend.execute_sql(queries.columns, timeout).await?.rows,
        primary_keys: backend.execute_sql(queries.primary_keys, timeout).await?.rows,
        unique_columns: backend.execute_sql(queries.unique_columns, timeout).await?.rows,
        foreign_keys: backend.execute_sql(queries.foreign_keys, timeout).await?.rows,
    };
    Ok(assemble(database, backend.db_type(), rows))
}

fn text(row: &Map<String, Value>, key: &str) -> String {
    row.get(key).and_then(value_as_string).unwrap_or_default()
}

fn flag(row: &Map<String, Value>, key: &str) -> bool {
    row.get(key).is_some_and(value_as_bool)
}

fn count(row: &Map<String, Value>, key: &str) -> Option<u64> {
    row.get(key)
        .and_then(value_as_f64)
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64)
}

/// Combine catalog rows into a [`DatabaseSchema`]. Columns belonging to
/// tables outside the table list are dropped.
pub fn assemble(database: &str, db_type: DbType, rows: CatalogRows) -> DatabaseSchema {
    let key_set = |rows: &[Map<String, Value>]| -> HashSet<(String, String)> {
        rows.iter()
            .map(|r| (text(r, "table_name"), text(r, "column_name")))
            .collect()
    };
    let primary_keys = key_set(&rows.primary_keys);
    let unique_columns = key_set(&rows.unique_columns);

    let relationships: Vec<Relationship> = rows
        .foreign_keys
        .iter()
        .map(|r| Relationship {
            name: text(r, "constraint_name"),
            source_table: text(r, "source_table"),
            source_column: text(r, "source_column"),
            target_table: text(r, "target_table"),
            target_column: text(r, "target_column"),
        })
        .collect();
    let foreign_keys: HashSet<(&str, &str)> = relationships
        .iter()
        .map(|r| (r.source_table.as_str(), r.source_column.as_str()))
        .collect();

    let mut columns_by_table: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
    for r in &rows.columns {
        let table = text(r, "table_name");
        let name = text(r, "column_name");
        let key = (table.clone(), name.clone());
        let column = ColumnInfo {
            data_type: text(r, "data_type"),
            nullable: flag(r, "is_nullable"),
            has_default: flag(r, "has_default"),
            is_primary_key: primary_keys.contains(&key),
            is_unique: unique_columns.contains(&key),
            is_foreign_key: foreign_keys.contains(&(table.as_str(), name.as_str())),
            position: count(r, "position").unwrap_or(0) as u32,
            name,
        };
        columns_by_table.entry(table).or_default().push(column);
    }

    let tables: Vec<TableInfo> = rows
        .tables
        .iter()
        .map(|r| {
            let name = text(r, "table_name");
            let kind = if text(r, "table_type").eq_ignore_ascii_case("view") {
                TableKind::View
            } else {
                TableKind::Table
            };
            let mut columns = columns_by_table.remove(&name).unwrap_or_default();
            columns.sort_by_key(|c| c.position);
            TableInfo {
                row_count: match kind {
                    TableKind::Table => count(r, "row_count"),
                    TableKind::View => None,
                },
                name,
                kind,
                columns,
            }
        })
        .collect();

    let stats = SchemaStats {
        table_count: tables.iter().filter(|t| t.kind == TableKind::Table).count(),
        view_count: tables.iter().filter(|t| t.kind == TableKind::View).count(),
        relationship_count: relationships.len(),
        total_columns: tables.iter().map(|t| t.columns.len()).sum(),
    };

    DatabaseSchema {
        database: database.to_string(),
        db_type,
        tables,
        relationships,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Value) -> Vec<Map<String, Value>> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn assembles_tables_columns_and_keys() {
        let catalog = CatalogRows {
            tables: rows(json!([
                {"table_name": "customers", "table_type": "table", "row_count": 10},
                {"table_name": "orders", "table_type": "table", "row_count": "1200"},
                {"table_name": "order_summary", "table_type": "view", "row_count": null}
            ])),
            columns: rows(json!([
                {"table_name": "orders", "column_name": "customer_id", "data_type": "integer",
                 "is_nullable": 1, "has_default": 0, "position": 2},
                {"table_name": "orders", "column_name": "id", "data_type": "integer",
                 "is_nullable": false, "has_default": true, "position": 1},
                {"table_name": "customers", "column_name": "id", "data_type": "integer",
                 "is_nullable": "NO", "has_default": "YES", "position": 1},
                {"table_name": "dropped", "column_name": "x", "data_type": "text",
                 "is_nullable": true, "has_default": false, "position": 1}
            ])),
            primary_keys: rows(json!([
                {"table_name": "orders", "column_name": "id"},
                {"table_name": "customers", "column_name": "id"}
            ])),
            unique_columns: rows(json!([])),
            foreign_keys: rows(json!([
                {"constraint_name": "orders_customer_fk", "source_table": "orders",
                 "source_column": "customer_id", "target_table": "customers", "target_column": "id"}
            ])),
        };

        let schema = assemble("sales", DbType::Postgresql, catalog);
        assert_eq!(schema.stats.table_count, 2);
        assert_eq!(schema.stats.view_count, 1);
        assert_eq!(schema.stats.relationship_count, 1);
        assert_eq!(schema.stats.total_columns, 3);

        let orders = schema.tables.iter().find(|t| t.name == "orders").unwrap();
        assert_eq!(orders.row_count, Some(1200));
        assert_eq!(orders.columns[0].name, "id");
        assert!(orders.columns[0].is_primary_key);
        assert!(orders.columns[0].has_default);
        assert!(orders.columns[1].is_foreign_key);
        assert!(orders.columns[1].nullable);

        let customers = schema.tables.iter().find(|t| t.name == "customers").unwrap();
        assert!(!customers.columns[0].nullable);

        let view = schema.tables.iter().find(|t| t.kind == TableKind::View).unwrap();
        assert_eq!(view.row_count, None);
        assert!(view.columns.is_empty());
    }

    #[test]
    fn serializes_camel_case() {
        let schema = assemble("d", DbType::Mysql, CatalogRows::default());
        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["dbType"], json!("mysql"));
        assert_eq!(value["stats"]["totalColumns"], json!(0));
    }
}
