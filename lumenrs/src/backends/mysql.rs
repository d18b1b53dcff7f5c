//! MySQL / MariaDB backend implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Column, Conn, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, SslOpts, Value as MySqlValue};
use serde_json::Value;

use crate::connections::ConnectionDescriptor;
use crate::dialect::DbType;
use crate::error::{ExecutionError, LumenError, Result};
use crate::executor::{decimal_to_json, float_to_json, QueryResult};

use super::{with_timeout, BackendConnection, PoolOptions};

/// Collation id MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

pub struct MySqlConnection {
    pool: Pool,
    connect_timeout: Duration,
    connection_id: String,
}

impl MySqlConnection {
    pub fn connect(
        descriptor: &ConnectionDescriptor,
        password: Option<&str>,
        options: PoolOptions,
    ) -> Result<Self> {
        tracing::info!(
            connection = %descriptor.id,
            host = %descriptor.host,
            database = %descriptor.database,
            max_size = options.max_size,
            "creating MySQL connection pool"
        );

        let constraints = PoolConstraints::new(0, options.max_size.max(1)).ok_or_else(|| {
            LumenError::Config(format!("invalid MySQL pool size {}", options.max_size))
        })?;
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(descriptor.host.clone())
            .tcp_port(descriptor.effective_port())
            .user(Some(descriptor.username.clone()))
            .pass(password.map(str::to_string))
            .db_name(Some(descriptor.database.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));
        if descriptor.ssl {
            opts = opts.ssl_opts(Some(SslOpts::default()));
        }

        Ok(Self {
            pool: Pool::new(opts),
            connect_timeout: options.connect_timeout,
            connection_id: descriptor.id.clone(),
        })
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<Conn> {
        match tokio::time::timeout(self.connect_timeout, self.pool.get_conn()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                tracing::error!(connection = %self.connection_id, error = %e, "failed to get MySQL connection");
                Err(LumenError::Connection(format!("get mysql connection: {e}")))
            }
            Err(_) => Err(LumenError::Connection(format!(
                "get mysql connection: timed out after {} ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl BackendConnection for MySqlConnection {
    fn db_type(&self) -> DbType {
        DbType::Mysql
    }

    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
        let start = Instant::now();
        tracing::trace!(connection = %self.connection_id, sql = %sql, "executing MySQL query");

        let mut conn = self.get_conn().await?;
        let thread_id = conn.id();
        let pool = self.pool.clone();

        let result = with_timeout(timeout, run_query(&mut conn, sql), || async move {
            kill_query(&pool, thread_id).await;
        })
        .await?;

        tracing::debug!(
            connection = %self.connection_id,
            rows = result.rows.len(),
            columns = result.columns.len(),
            ms = start.elapsed().as_millis(),
            "mysql execute_sql"
        );
        Ok(result)
    }

    async fn close(&self) {
        tracing::info!(connection = %self.connection_id, "closing MySQL pool");
        if let Err(e) = self.pool.clone().disconnect().await {
            tracing::warn!(connection = %self.connection_id, error = %e, "error while closing MySQL pool");
        }
    }
}

async fn run_query(conn: &mut Conn, sql: &str) -> Result<QueryResult> {
    let mut result = conn.query_iter(sql).await.map_err(map_mysql_error)?;
    let columns: Vec<Column> = result.columns_ref().to_vec();
    let rows: Vec<Row> = result.collect_and_drop().await.map_err(map_mysql_error)?;

    let names = columns.iter().map(|c| c.name_str().into_owned()).collect();
    let values = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, column)| match row.get_opt::<MySqlValue, usize>(idx) {
                    Some(Ok(value)) => mysql_value_to_json(value, column),
                    _ => Value::Null,
                })
                .collect()
        })
        .collect();
    Ok(QueryResult::from_positional(names, values))
}

/// Ask the server to stop the statement running on `thread_id`.
async fn kill_query(pool: &Pool, thread_id: u32) {
    match pool.get_conn().await {
        Ok(mut conn) => {
            if let Err(e) = conn.query_drop(format!("KILL QUERY {thread_id}")).await {
                tracing::warn!(thread_id, error = %e, "failed to kill MySQL query");
            }
        }
        Err(e) => tracing::warn!(thread_id, error = %e, "no connection available to kill MySQL query"),
    }
}

fn map_mysql_error(e: mysql_async::Error) -> LumenError {
    match e {
        mysql_async::Error::Server(server) => {
            tracing::debug!(code = server.code, state = %server.state, "MySQL error");
            LumenError::Execution(
                ExecutionError::new(server.message).with_code(server.code.to_string()),
            )
        }
        mysql_async::Error::Io(io) => LumenError::Connection(format!("mysql io error: {io}")),
        other => LumenError::Execution(ExecutionError::new(other.to_string())),
    }
}

/// Convert a MySQL value to JSON. The text protocol sends everything as
/// bytes, so the column type decides how to read them.
fn mysql_value_to_json(value: MySqlValue, column: &Column) -> Value {
    match value {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Int(i) => Value::from(i),
        MySqlValue::UInt(u) => Value::from(u),
        MySqlValue::Float(f) => float_to_json(f as f64),
        MySqlValue::Double(d) => float_to_json(d),
        MySqlValue::Date(y, m, d, h, min, s, micros) => {
            Value::String(datetime_string(y, m, d, h, min, s, micros))
        }
        MySqlValue::Time(is_neg, d, h, m, s, micros) => {
            Value::String(time_string(is_neg, d, h, m, s, micros))
        }
        MySqlValue::Bytes(bytes) => bytes_to_json(bytes, column),
    }
}

/// `YYYY-MM-DD`, with a time part only when one is set and fractional
/// seconds only when nonzero.
fn datetime_string(y: u16, m: u8, d: u8, h: u8, min: u8, s: u8, micros: u32) -> String {
    if h == 0 && min == 0 && s == 0 && micros == 0 {
        format!("{y:04}-{m:02}-{d:02}")
    } else if micros == 0 {
        format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}")
    } else {
        format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}.{micros:06}")
    }
}

fn time_string(is_neg: bool, d: u32, h: u8, m: u8, s: u8, micros: u32) -> String {
    let sign = if is_neg { "-" } else { "" };
    let total_hours = d * 24 + u32::from(h);
    if micros == 0 {
        format!("{sign}{total_hours}:{m:02}:{s:02}")
    } else {
        format!("{sign}{total_hours}:{m:02}:{s:02}.{micros:06}")
    }
}

fn bytes_to_json(bytes: Vec<u8>, column: &Column) -> Value {
    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR
        | ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL
        | ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE => match std::str::from_utf8(&bytes) {
            Ok(text) => decimal_to_json(text),
            Err(_) => Value::String(hex::encode(bytes)),
        },
        ColumnType::MYSQL_TYPE_JSON => {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
        ColumnType::MYSQL_TYPE_BIT => {
            let n = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            Value::from(n)
        }
        _ if column.character_set() == BINARY_CHARSET && is_binary_type(column.column_type()) => {
            Value::String(hex::encode(bytes))
        }
        _ => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::String(hex::encode(e.into_bytes())),
        },
    }
}

fn is_binary_type(ty: ColumnType) -> bool {
    matches!(
        ty,
        ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
    )
}
