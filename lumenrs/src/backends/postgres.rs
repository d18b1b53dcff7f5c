//! PostgreSQL backend implementation.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::types::{FromSql, Type};

use crate::connections::ConnectionDescriptor;
use crate::dialect::DbType;
use crate::error::{ExecutionError, LumenError, Result};
use crate::executor::{decimal_to_json, float_to_json, QueryResult};

use super::{with_timeout, BackendConnection, PoolOptions};

pub struct PostgresConnection {
    pool: deadpool_postgres::Pool,
    connection_id: String,
}

impl PostgresConnection {
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
            "creating PostgreSQL connection pool"
        );

        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(descriptor.host.clone());
        cfg.port = Some(descriptor.effective_port());
        cfg.dbname = Some(descriptor.database.clone());
        cfg.user = Some(descriptor.username.clone());
        cfg.password = password.map(str::to_string);
        cfg.application_name = Some("lumen".to_string());
        cfg.connect_timeout = Some(options.connect_timeout);
        if descriptor.ssl {
            // No TLS connector is linked in, so `require` fails at connect
            // time rather than silently downgrading to plaintext.
            cfg.ssl_mode = Some(deadpool_postgres::SslMode::Require);
        }
        let mut pool_cfg = deadpool_postgres::PoolConfig::new(options.max_size);
        pool_cfg.timeouts.wait = Some(options.connect_timeout);
        pool_cfg.timeouts.create = Some(options.connect_timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )
            .map_err(|e| {
                tracing::error!(connection = %descriptor.id, error = %e, "failed to create PostgreSQL pool");
                LumenError::Connection(format!("create postgres pool: {e}"))
            })?;

        Ok(Self {
            pool,
            connection_id: descriptor.id.clone(),
        })
    }
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    fn db_type(&self) -> DbType {
        DbType::Postgresql
    }

    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
        let start = Instant::now();
        let pool_status = self.pool.status();
        tracing::debug!(
            connection = %self.connection_id,
            available = pool_status.available,
            size = pool_status.size,
            max_size = pool_status.max_size,
            sql_len = sql.len(),
            "acquiring PostgreSQL connection for query"
        );
        tracing::trace!(sql = %sql, "executing PostgreSQL query");

        let client = self.pool.get().await.map_err(|e| {
            tracing::error!(connection = %self.connection_id, error = %e, "failed to get PostgreSQL connection");
            LumenError::Connection(format!("get postgres connection: {e}"))
        })?;
        let cancel_token = client.cancel_token();

        let result = with_timeout(timeout, run_query(&client, sql), || async move {
            if let Err(e) = cancel_token.cancel_query(tokio_postgres::NoTls).await {
                tracing::warn!(error = %e, "failed to cancel PostgreSQL query");
            }
        })
        .await?;

        tracing::debug!(
            connection = %self.connection_id,
            rows = result.rows.len(),
            columns = result.columns.len(),
            ms = start.elapsed().as_millis(),
            "postgres execute_sql"
        );
        Ok(result)
    }

    async fn close(&self) {
        tracing::info!(connection = %self.connection_id, "closing PostgreSQL pool");
        self.pool.close();
    }
}

async fn run_query(client: &tokio_postgres::Client, sql: &str) -> Result<QueryResult> {
    let statement = client.prepare(sql).await.map_err(map_pg_error)?;
    let rows = client.query(&statement, &[]).await.map_err(map_pg_error)?;

    let names = statement
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let values = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| pg_value_to_json(row, idx, col.type_()))
                .collect()
        })
        .collect();
    Ok(QueryResult::from_positional(names, values))
}

fn map_pg_error(e: tokio_postgres::Error) -> LumenError {
    match e.as_db_error() {
        Some(db) => {
            let position = match db.position() {
                Some(tokio_postgres::error::ErrorPosition::Original(p)) => Some(*p),
                Some(tokio_postgres::error::ErrorPosition::Internal { position, .. }) => {
                    Some(*position)
                }
                None => None,
            };
            tracing::debug!(code = db.code().code(), message = db.message(), "PostgreSQL error");
            LumenError::Execution(
                ExecutionError::new(db.message())
                    .with_code(db.code().code())
                    .with_position(position),
            )
        }
        None if e.is_closed() => LumenError::Connection(format!("postgres connection closed: {e}")),
        None => LumenError::Execution(ExecutionError::new(e.to_string())),
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL value to JSON.
fn pg_value_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    match *ty {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| float_to_json(v as f64)),
        Type::FLOAT8 => get::<f64>(row, idx).map(float_to_json),
        Type::NUMERIC => get::<PgNumeric>(row, idx).map(|n| decimal_to_json(&n.0)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, idx).map(Value::String)
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx).map(|t| Value::String(t.to_rfc3339()))
        }
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(|b| Value::String(hex::encode(b))),
        _ => get::<String>(row, idx).map(Value::String).or_else(|| {
            tracing::trace!(column = idx, ty = %ty, "unsupported PostgreSQL type, returning null");
            None
        }),
    }
    .unwrap_or(Value::Null)
}

/// NUMERIC decoded from the binary wire format into its exact decimal text.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let word = |i: usize| -> std::result::Result<u16, Box<dyn StdError + Sync + Send>> {
            raw.get(i..i + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated numeric".into())
        };
        let ndigits = word(0)? as usize;
        let weight = word(2)? as i16 as i32;
        let sign = word(4)?;
        let dscale = word(6)? as usize;
        let mut digits = Vec::with_capacity(ndigits);
        for i in 0..ndigits {
            digits.push(word(8 + i * 2)?);
        }

        match sign {
            0xC000 => return Ok(PgNumeric("NaN".to_string())),
            0xD000 => return Ok(PgNumeric("Infinity".to_string())),
            0xF000 => return Ok(PgNumeric("-Infinity".to_string())),
            _ => {}
        }

        let digit = |i: i32| -> u16 {
            if i >= 0 && (i as usize) < digits.len() {
                digits[i as usize]
            } else {
                0
            }
        };

        let mut text = String::new();
        if sign == 0x4000 && digits.iter().any(|d| *d != 0) {
            text.push('-');
        }
        if weight < 0 {
            text.push('0');
        } else {
            for i in 0..=weight {
                if i == 0 {
                    text.push_str(&digit(i).to_string());
                } else {
                    text.push_str(&format!("{:04}", digit(i)));
                }
            }
        }
        if dscale > 0 {
            let mut frac = String::with_capacity(dscale + 4);
            let mut i = weight + 1;
            while frac.len() < dscale {
                frac.push_str(&format!("{:04}", digit(i)));
                i += 1;
            }
            frac.truncate(dscale);
            text.push('.');
            text.push_str(&frac);
        }
        Ok(PgNumeric(text))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}
