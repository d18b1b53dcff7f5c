//! SQL Server backend implementation.
//!
//! tiberius ships no pool of its own; connections are pooled through a
//! `deadpool` managed pool.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, Object, RecycleError, RecycleResult};
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::connections::ConnectionDescriptor;
use crate::dialect::DbType;
use crate::error::{ExecutionError, LumenError, Result};
use crate::executor::{decimal_to_json, float_to_json, QueryResult};

use super::{with_timeout, BackendConnection, PoolOptions};

type MsSqlClient = Client<Compat<TcpStream>>;

pub struct TiberiusManager {
    config: Config,
    connect_timeout: Duration,
}

impl managed::Manager for TiberiusManager {
    type Type = MsSqlClient;
    type Error = LumenError;

    async fn create(&self) -> Result<MsSqlClient> {
        let connect = async {
            let tcp = TcpStream::connect(self.config.get_addr())
                .await
                .map_err(|e| LumenError::Connection(format!("connect to sql server: {e}")))?;
            tcp.set_nodelay(true)?;
            Client::connect(self.config.clone(), tcp.compat_write())
                .await
                .map_err(map_mssql_error)
        };
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(client) => client,
            Err(_) => Err(LumenError::Connection(format!(
                "connect to sql server: timed out after {} ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    async fn recycle(&self, client: &mut MsSqlClient, _: &Metrics) -> RecycleResult<LumenError> {
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| RecycleError::Backend(map_mssql_error(e)))?
            .into_results()
            .await
            .map_err(|e| RecycleError::Backend(map_mssql_error(e)))?;
        Ok(())
    }
}

pub struct MsSqlConnection {
    pool: managed::Pool<TiberiusManager>,
    connection_id: String,
}

impl MsSqlConnection {
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
            "creating SQL Server connection pool"
        );

        let mut config = Config::new();
        config.host(&descriptor.host);
        config.port(descriptor.effective_port());
        config.database(&descriptor.database);
        config.application_name("lumen");
        config.authentication(AuthMethod::sql_server(
            &descriptor.username,
            password.unwrap_or_default(),
        ));
        if descriptor.ssl {
            config.encryption(EncryptionLevel::Required);
        } else {
            // Self-hosted servers commonly present self-signed certificates
            // during the login handshake.
            config.trust_cert();
        }

        let manager = TiberiusManager {
            config,
            connect_timeout: options.connect_timeout,
        };
        let pool = managed::Pool::builder(manager)
            .max_size(options.max_size.max(1))
            .wait_timeout(Some(options.connect_timeout))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| {
                tracing::error!(connection = %descriptor.id, error = %e, "failed to create SQL Server pool");
                LumenError::Connection(format!("create sql server pool: {e}"))
            })?;

        Ok(Self {
            pool,
            connection_id: descriptor.id.clone(),
        })
    }
}

#[async_trait]
impl BackendConnection for MsSqlConnection {
    fn db_type(&self) -> DbType {
        DbType::Mssql
    }

    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
        let start = Instant::now();
        tracing::trace!(connection = %self.connection_id, sql = %sql, "executing SQL Server query");

        let mut client = self.pool.get().await.map_err(|e| {
            tracing::error!(connection = %self.connection_id, error = %e, "failed to get SQL Server connection");
            match e {
                managed::PoolError::Backend(inner) => inner,
                other => LumenError::Connection(format!("get sql server connection: {other}")),
            }
        })?;

        // TDS has no out-of-band cancel here; a timed-out connection is
        // detached from the pool and dropped, which ends the session.
        let result = with_timeout(timeout, run_query(&mut client, sql), || async {}).await;
        if matches!(result, Err(LumenError::Timeout { .. })) {
            drop(Object::take(client));
        }
        let result = result?;

        tracing::debug!(
            connection = %self.connection_id,
            rows = result.rows.len(),
            columns = result.columns.len(),
            ms = start.elapsed().as_millis(),
            "mssql execute_sql"
        );
        Ok(result)
    }

    async fn close(&self) {
        tracing::info!(connection = %self.connection_id, "closing SQL Server pool");
        self.pool.close();
    }
}

async fn run_query(client: &mut MsSqlClient, sql: &str) -> Result<QueryResult> {
    let mut stream = client.simple_query(sql).await.map_err(map_mssql_error)?;
    let names: Vec<String> = stream
        .columns()
        .await
        .map_err(map_mssql_error)?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = stream.into_first_result().await.map_err(map_mssql_error)?;

    let values = rows
        .into_iter()
        .map(|row| row.into_iter().map(|data| column_data_to_json(&data)).collect())
        .collect();
    Ok(QueryResult::from_positional(names, values))
}

fn map_mssql_error(e: tiberius::error::Error) -> LumenError {
    match e {
        tiberius::error::Error::Server(token) => {
            tracing::debug!(code = token.code(), line = token.line(), "SQL Server error");
            LumenError::Execution(
                ExecutionError::new(token.message()).with_code(token.code().to_string()),
            )
        }
        tiberius::error::Error::Io { kind, message } => {
            LumenError::Connection(format!("sql server io error ({kind:?}): {message}"))
        }
        tiberius::error::Error::Routing { host, port } => LumenError::Connection(format!(
            "sql server redirected to {host}:{port}"
        )),
        other => LumenError::Execution(ExecutionError::new(other.to_string())),
    }
}

fn chrono_string<'a, T>(data: &'a ColumnData<'static>, render: impl Fn(T) -> String) -> Value
where
    T: FromSql<'a>,
{
    match T::from_sql(data) {
        Ok(Some(v)) => Value::String(render(v)),
        _ => Value::Null,
    }
}

/// Convert a SQL Server value to JSON.
fn column_data_to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| float_to_json(f as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(float_to_json).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(hex::encode(b)))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v
            .map(|n| decimal_to_json(&n.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.clone().into_owned().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono_string(data, |t: chrono::NaiveDateTime| {
                t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
            })
        }
        ColumnData::DateTimeOffset(_) => {
            chrono_string(data, |t: chrono::DateTime<chrono::Utc>| t.to_rfc3339())
        }
        ColumnData::Date(_) => chrono_string(data, |d: chrono::NaiveDate| d.to_string()),
        ColumnData::Time(_) => chrono_string(data, |t: chrono::NaiveTime| t.to_string()),
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
