//! Per-connection pool registry.
//!
//! One pooled backend per connection id, created lazily and shared by every
//! request targeting that connection. Requests without a connection id fall
//! back to the catalog's default connection, then to the application
//! database.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::backends::{BackendConnection, PoolFactory, PoolOptions};
use crate::config::{LumenConfig, APP_DATABASE_ID};
use crate::connections::{ConnectionCatalog, ConnectionDescriptor};
use crate::dialect::DbType;
use crate::error::{LumenError, Result};
use crate::executor::{value_as_f64, value_as_string};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    AppDatabase,
    Connection(String),
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::AppDatabase => f.write_str(APP_DATABASE_ID),
            PoolKey::Connection(id) => f.write_str(id),
        }
    }
}

/// A connection chosen for a request, with the descriptor it resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub key: PoolKey,
    pub descriptor: ConnectionDescriptor,
}

/// Result of probing a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestReport {
    pub success: bool,
    pub version: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub table_count: Option<u64>,
    pub db_type: DbType,
}

struct PoolEntry {
    descriptor: ConnectionDescriptor,
    backend: Arc<dyn BackendConnection>,
}

pub struct ConnectionPoolManager {
    pools: RwLock<HashMap<PoolKey, PoolEntry>>,
    /// Serializes pool creation per key so the map lock is never held while
    /// a driver connects.
    creating: Mutex<HashMap<PoolKey, Arc<Mutex<()>>>>,
    catalog: Arc<dyn ConnectionCatalog>,
    factory: Arc<dyn PoolFactory>,
    app_database: Option<ConnectionDescriptor>,
    config: LumenConfig,
}

impl ConnectionPoolManager {
    pub fn new(
        catalog: Arc<dyn ConnectionCatalog>,
        factory: Arc<dyn PoolFactory>,
        config: LumenConfig,
    ) -> Result<Self> {
        let app_database = config
            .app_database
            .as_ref()
            .map(|app| app.descriptor())
            .transpose()?;
        Ok(Self {
            pools: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            catalog,
            factory,
            app_database,
            config,
        })
    }

    pub fn config(&self) -> &LumenConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn ConnectionCatalog> {
        &self.catalog
    }

    /// Pick the connection for a request: the explicit id, else the default
    /// connection, else the application database.
    pub fn resolve_target(&self, connection_id: Option<&str>) -> Result<ResolvedTarget> {
        if let Some(id) = connection_id {
            let descriptor = self.catalog.get(id)?.ok_or_else(|| {
                LumenError::Validation(format!("connection '{id}' does not exist"))
            })?;
            if !descriptor.is_active {
                return Err(LumenError::Validation(format!(
                    "connection '{id}' is inactive"
                )));
            }
            return Ok(ResolvedTarget {
                key: PoolKey::Connection(descriptor.id.clone()),
                descriptor,
            });
        }
        if let Some(descriptor) = self.catalog.default_connection()? {
            return Ok(ResolvedTarget {
                key: PoolKey::Connection(descriptor.id.clone()),
                descriptor,
            });
        }
        match &self.app_database {
            Some(descriptor) => Ok(ResolvedTarget {
                key: PoolKey::AppDatabase,
                descriptor: descriptor.clone(),
            }),
            None => Err(LumenError::Config(
                "no connection given, no default connection and no application database configured"
                    .to_string(),
            )),
        }
    }

    /// Shared backend for `target`, created on first use. A cached pool whose
    /// endpoint or credentials no longer match the descriptor is replaced.
    pub async fn acquire(&self, target: &ResolvedTarget) -> Result<Arc<dyn BackendConnection>> {
        // Fast path: pool exists and is current (read lock)
        if let Some(backend) = self.current(target).await {
            return Ok(backend);
        }

        // Slow path: one creator per key, other keys stay unblocked
        let guard = self
            .creating
            .lock()
            .await
            .entry(target.key.clone())
            .or_default()
            .clone();
        let _creating = guard.lock().await;

        // Double-check in case another task created the pool while we were waiting
        if let Some(backend) = self.current(target).await {
            tracing::debug!(connection = %target.key, "pool created by another task");
            return Ok(backend);
        }

        let options = self.pool_options(&target.key);
        tracing::info!(
            connection = %target.key,
            db_type = %target.descriptor.db_type,
            max_size = options.max_size,
            "creating connection pool"
        );
        let backend = self.factory.create_pool(&target.descriptor, options).await?;
        let stale = self.pools.write().await.insert(
            target.key.clone(),
            PoolEntry {
                descriptor: target.descriptor.clone(),
                backend: backend.clone(),
            },
        );
        if let Some(stale) = stale {
            tracing::info!(connection = %target.key, "connection settings changed, replacing pool");
            close_in_background(stale.backend);
        }
        Ok(backend)
    }

    async fn current(&self, target: &ResolvedTarget) -> Option<Arc<dyn BackendConnection>> {
        let pools = self.pools.read().await;
        pools
            .get(&target.key)
            .filter(|entry| entry.descriptor.same_endpoint(&target.descriptor))
            .map(|entry| entry.backend.clone())
    }

    /// Cached backend, if any. Never creates one.
    pub async fn get(&self, key: &PoolKey) -> Option<Arc<dyn BackendConnection>> {
        self.pools
            .read()
            .await
            .get(key)
            .map(|entry| entry.backend.clone())
    }

    /// Drop the cached pool for a connection that was edited or deleted.
    /// Closing happens in the background; handles already checked out stay
    /// usable until they are released.
    pub async fn evict(&self, key: &PoolKey) -> bool {
        let removed = self.pools.write().await.remove(key);
        match removed {
            Some(entry) => {
                tracing::info!(connection = %key, "evicting connection pool");
                close_in_background(entry.backend);
                true
            }
            None => false,
        }
    }

    /// Close every pool and wait for them to finish.
    pub async fn shutdown(&self) {
        let entries: Vec<(PoolKey, PoolEntry)> = self.pools.write().await.drain().collect();
        tracing::info!(pools = entries.len(), "shutting down connection pools");
        futures::future::join_all(entries.iter().map(|(_, entry)| entry.backend.close())).await;
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Probe a connection on a private single-connection pool that is closed
    /// afterwards whatever the outcome.
    pub async fn test_connection(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionTestReport> {
        let options = PoolOptions {
            max_size: 1,
            ..self.pool_options(&PoolKey::Connection(descriptor.id.clone()))
        };
        let backend = self.factory.create_pool(descriptor, options).await?;
        let outcome = probe(backend.as_ref(), self.config.defaults.query.timeout()).await;
        backend.close().await;
        match &outcome {
            Ok(report) => tracing::info!(
                connection = %descriptor.id,
                version = report.version.as_deref().unwrap_or(""),
                "connection test succeeded"
            ),
            Err(e) => tracing::warn!(connection = %descriptor.id, error = %e, "connection test failed"),
        }
        outcome
    }

    fn pool_options(&self, key: &PoolKey) -> PoolOptions {
        self.config.for_connection(&key.to_string()).pool.options()
    }
}

fn close_in_background(backend: Arc<dyn BackendConnection>) {
    tokio::spawn(async move {
        backend.close().await;
    });
}

async fn probe(
    backend: &dyn BackendConnection,
    timeout: std::time::Duration,
) -> Result<ConnectionTestReport> {
    let dialect = backend.dialect();
    let version = backend.execute_sql(dialect.version_query(), timeout).await?;
    let tables = backend
        .execute_sql(dialect.table_count_query(), timeout)
        .await?;
    Ok(ConnectionTestReport {
        success: true,
        version: version.scalar("version").and_then(value_as_string),
        database: version.scalar("database").and_then(value_as_string),
        user: version.scalar("user").and_then(value_as_string),
        table_count: tables
            .scalar("table_count")
            .and_then(value_as_f64)
            .map(|n| n as u64),
        db_type: backend.db_type(),
    })
}
