//! Database backend implementations.
//!
//! Each backend owns one driver pool for one external connection and is
//! gated behind a feature flag. [`DriverPoolFactory`] picks the backend
//! matching a descriptor's `db_type`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::connections::{ConnectionDescriptor, CredentialResolver};
use crate::dialect::{DbType, Dialect};
use crate::error::{LumenError, Result};
use crate::executor::QueryResult;

/// Unified interface for all database backends.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn db_type(&self) -> DbType;

    fn dialect(&self) -> &'static dyn Dialect {
        self.db_type().dialect()
    }

    /// Run one statement with a hard timeout. On expiry the driver-side query
    /// is cancelled and [`LumenError::Timeout`] returned.
    async fn execute_sql(&self, sql: &str, timeout: Duration) -> Result<QueryResult>;

    /// Close the pool. Checked-out connections finish their work first.
    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_size: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds pooled backends from descriptors. The pool manager goes through
/// this seam so tests can count and fake pool creation.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn create_pool(
        &self,
        descriptor: &ConnectionDescriptor,
        options: PoolOptions,
    ) -> Result<Arc<dyn BackendConnection>>;
}

/// Factory backed by the compiled-in drivers.
pub struct DriverPoolFactory {
    credentials: Arc<dyn CredentialResolver>,
}

impl DriverPoolFactory {
    pub fn new(credentials: Arc<dyn CredentialResolver>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl PoolFactory for DriverPoolFactory {
    async fn create_pool(
        &self,
        descriptor: &ConnectionDescriptor,
        options: PoolOptions,
    ) -> Result<Arc<dyn BackendConnection>> {
        let password = self.credentials.password(descriptor)?;
        match descriptor.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgresql => Ok(Arc::new(PostgresConnection::connect(
                descriptor,
                password.as_deref(),
                options,
            )?)),
            #[cfg(feature = "mysql")]
            DbType::Mysql => Ok(Arc::new(MySqlConnection::connect(
                descriptor,
                password.as_deref(),
                options,
            )?)),
            #[cfg(feature = "mssql")]
            DbType::Mssql => Ok(Arc::new(MsSqlConnection::connect(
                descriptor,
                password.as_deref(),
                options,
            )?)),
            #[allow(unreachable_patterns)]
            other => {
                let _ = (password, options);
                Err(LumenError::Connection(format!(
                    "driver for {other} is not compiled in"
                )))
            }
        }
    }
}

/// Run a driver future under `timeout`, invoking `cancel` if it expires.
pub(crate) async fn with_timeout<T, F, C, CF>(timeout: Duration, query: F, cancel: C) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
    C: FnOnce() -> CF,
    CF: std::future::Future<Output = ()>,
{
    let outcome = tokio::time::timeout(timeout, query).await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            tracing::warn!(timeout_ms, "query timed out, cancelling");
            cancel().await;
            Err(LumenError::Timeout { timeout_ms })
        }
    }
}

// Feature-gated backend implementations
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresConnection;

#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "mysql")]
pub use mysql::MySqlConnection;

#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mssql")]
pub use mssql::MsSqlConnection;
