//! PostgreSQL dialect implementation.

use super::{CatalogQueries, DbType, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn db_type(&self) -> DbType {
        DbType::Postgresql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::PostgreSqlDialect {})
    }

    fn version_query(&self) -> &'static str {
        "SELECT version() AS version, current_database() AS database, current_user AS \"user\""
    }

    fn table_count_query(&self) -> &'static str {
        r#"
            SELECT COUNT(*)::bigint AS table_count
            FROM information_schema.tables
            WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
                AND table_type = 'BASE TABLE'
        "#
    }

    fn catalog_queries(&self) -> CatalogQueries {
        CatalogQueries {
            tables: r#"
                SELECT t.table_name::text AS table_name,
                    CASE WHEN t.table_type = 'VIEW' THEN 'view' ELSE 'table' END AS table_type,
                    GREATEST(COALESCE(c.reltuples, 0), 0)::bigint AS row_count
                FROM information_schema.tables t
                LEFT JOIN pg_catalog.pg_class c
                    ON c.oid = format('%I.%I', t.table_schema, t.table_name)::regclass
                WHERE t.table_schema = current_schema()
                ORDER BY t.table_name
            "#,
            columns: r#"
                SELECT c.table_name::text AS table_name,
                    c.column_name::text AS column_name,
                    c.data_type::text AS data_type,
                    (c.is_nullable = 'YES') AS is_nullable,
                    (c.column_default IS NOT NULL) AS has_default,
                    c.ordinal_position::int AS position
                FROM information_schema.columns c
                WHERE c.table_schema = current_schema()
                ORDER BY c.table_name, c.ordinal_position
            "#,
            primary_keys: r#"
                SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE tc.table_schema = current_schema()
                    AND tc.constraint_type = 'PRIMARY KEY'
            "#,
            unique_columns: r#"
                SELECT kcu.table_name::text AS table_name, kcu.column_name::text AS column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE tc.table_schema = current_schema()
                    AND tc.constraint_type = 'UNIQUE'
            "#,
            foreign_keys: r#"
                SELECT tc.constraint_name::text AS constraint_name,
                    kcu.table_name::text AS source_table,
                    kcu.column_name::text AS source_column,
                    ccu.table_name::text AS target_table,
                    ccu.column_name::text AS target_column
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                JOIN information_schema.constraint_column_usage ccu
                    ON tc.constraint_name = ccu.constraint_name
                    AND tc.table_schema = ccu.table_schema
                WHERE tc.table_schema = current_schema()
                    AND tc.constraint_type = 'FOREIGN KEY'
                ORDER BY kcu.table_name, tc.constraint_name
            "#,
        }
    }
}
