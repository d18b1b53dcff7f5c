//! MySQL dialect implementation.

use super::{CatalogQueries, DbType, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn db_type(&self) -> DbType {
        DbType::Mysql
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn parser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        Box::new(sqlparser::dialect::MySqlDialect {})
    }

    // Backslash is an escape character in MySQL string literals.
    fn render_string(&self, s: &str) -> String {
        format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn version_query(&self) -> &'static str {
        "SELECT VERSION() AS version, DATABASE() AS `database`, CURRENT_USER() AS `user`"
    }

    fn table_count_query(&self) -> &'static str {
        r#"
            SELECT COUNT(*) AS table_count
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
        "#
    }

    fn catalog_queries(&self) -> CatalogQueries {
        CatalogQueries {
            tables: r#"
                SELECT TABLE_NAME AS table_name,
                    CASE WHEN TABLE_TYPE = 'VIEW' THEN 'view' ELSE 'table' END AS table_type,
                    TABLE_ROWS AS row_count
                FROM information_schema.TABLES
                WHERE TABLE_SCHEMA = DATABASE()
                ORDER BY TABLE_NAME
            "#,
            columns: r#"
                SELECT TABLE_NAME AS table_name,
                    COLUMN_NAME AS column_name,
                    DATA_TYPE AS data_type,
                    CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS is_nullable,
                    CASE WHEN COLUMN_DEFAULT IS NULL THEN 0 ELSE 1 END AS has_default,
                    ORDINAL_POSITION AS position
                FROM information_schema.COLUMNS
                WHERE TABLE_SCHEMA = DATABASE()
                ORDER BY TABLE_NAME, ORDINAL_POSITION
            "#,
            primary_keys: r#"
                SELECT kcu.TABLE_NAME AS table_name, kcu.COLUMN_NAME AS column_name
                FROM information_schema.TABLE_CONSTRAINTS tc
                JOIN information_schema.KEY_COLUMN_USAGE kcu
                    ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
                    AND tc.TABLE_NAME = kcu.TABLE_NAME
                WHERE tc.TABLE_SCHEMA = DATABASE()
                    AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
            "#,
            unique_columns: r#"
                SELECT kcu.TABLE_NAME AS table_name, kcu.COLUMN_NAME AS column_name
                FROM information_schema.TABLE_CONSTRAINTS tc
                JOIN information_schema.KEY_COLUMN_USAGE kcu
                    ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
                    AND tc.TABLE_NAME = kcu.TABLE_NAME
                WHERE tc.TABLE_SCHEMA = DATABASE()
                    AND tc.CONSTRAINT_TYPE = 'UNIQUE'
            "#,
            foreign_keys: r#"
                SELECT CONSTRAINT_NAME AS constraint_name,
                    TABLE_NAME AS source_table,
                    COLUMN_NAME AS source_column,
                    REFERENCED_TABLE_NAME AS target_table,
                    REFERENCED_COLUMN_NAME AS target_column
                FROM information_schema.KEY_COLUMN_USAGE
                WHERE TABLE_SCHEMA = DATABASE()
                    AND REFERENCED_TABLE_NAME IS NOT NULL
                ORDER BY TABLE_NAME, CONSTRAINT_NAME
            "#,
        }
    }
}
