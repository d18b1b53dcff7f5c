//! The engine facade the HTTP layer calls: semantic queries, filter values,
//! raw SQL, introspection and connection management.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::ResolvedConnectionConfig;
use crate::connections::{ConnectionDescriptor, ConnectionStatus, TestOutcome};
use crate::error::{LumenError, Result};
use crate::introspection::{self, DatabaseSchema};
use crate::models::{QueryMeta, QueryRequest, QueryResponse, SourceSchema};
use crate::pool_manager::{ConnectionPoolManager, ConnectionTestReport, PoolKey, ResolvedTarget};
use crate::query_builder::{CompiledQuery, QueryCompiler};
use crate::registry::{PublicSource, SourceRegistry};
use crate::sandbox::{self, RawQueryResponse, RawSqlRequest, SqlSandbox};
use crate::schema_cache::SchemaCache;

pub struct QueryEngine {
    registry: Arc<SourceRegistry>,
    pools: Arc<ConnectionPoolManager>,
    schema_cache: Mutex<SchemaCache>,
}

/// A compiled query bound to the connection it will run on.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub target: ResolvedTarget,
    pub compiled: CompiledQuery,
}

impl QueryEngine {
    pub fn new(registry: Arc<SourceRegistry>, pools: Arc<ConnectionPoolManager>) -> Self {
        let schema_cache = SchemaCache::with_config(&pools.config().defaults.schema_cache);
        Self {
            registry,
            pools,
            schema_cache: Mutex::new(schema_cache),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn pools(&self) -> &ConnectionPoolManager {
        &self.pools
    }

    pub fn public_schema(&self) -> BTreeMap<String, PublicSource> {
        self.registry.public_schema()
    }

    fn source(&self, name: &str) -> Result<&SourceSchema> {
        self.registry
            .get_source(name)
            .ok_or_else(|| LumenError::Validation(format!("unknown source '{name}'")))
    }

    fn settings(&self, target: &ResolvedTarget) -> ResolvedConnectionConfig {
        self.pools.config().for_connection(&target.key.to_string())
    }

    /// Validate and compile without touching the database.
    pub fn prepare(&self, request: &QueryRequest) -> Result<PreparedQuery> {
        let source = self.source(&request.source)?;
        let connection_id = request
            .connection_id
            .as_deref()
            .or(source.connection_id.as_deref());
        let target = self.pools.resolve_target(connection_id)?;
        let settings = self.settings(&target);
        let compiled = QueryCompiler::new(settings.query.limits()).compile(
            source,
            request,
            target.descriptor.db_type.dialect(),
        )?;
        Ok(PreparedQuery { target, compiled })
    }

    pub async fn run_query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let prepared = self.prepare(request)?;
        let settings = self.settings(&prepared.target);
        let backend = self.pools.acquire(&prepared.target).await?;

        let result = backend
            .execute_sql(&prepared.compiled.sql, settings.query.timeout())
            .await?;
        let data = prepared.compiled.plan.shape_rows(result.rows);
        tracing::debug!(
            source = %request.source,
            connection = %prepared.target.key,
            rows = data.len(),
            "query complete"
        );
        Ok(QueryResponse {
            meta: QueryMeta { total: data.len() },
            data,
        })
    }

    /// Distinct non-null values of a dimension or filter column, ascending.
    pub async fn distinct_values(
        &self,
        source_name: &str,
        field: &str,
        connection_id: Option<&str>,
    ) -> Result<Vec<Value>> {
        let source = self.source(source_name)?;
        let target = self
            .pools
            .resolve_target(connection_id.or(source.connection_id.as_deref()))?;
        let settings = self.settings(&target);
        let sql = QueryCompiler::new(settings.query.limits()).distinct_values(
            source,
            field,
            target.descriptor.db_type.dialect(),
        )?;
        let backend = self.pools.acquire(&target).await?;
        let result = backend.execute_sql(&sql, settings.query.timeout()).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|mut row| row.remove("value"))
            .filter(|v| !v.is_null())
            .collect())
    }

    pub async fn execute_raw(&self, request: &RawSqlRequest) -> Result<RawQueryResponse> {
        let target = self.pools.resolve_target(request.connection_id.as_deref())?;
        // Reject before a pool is created for a connection that may not exist yet.
        SqlSandbox::validate(&request.sql, target.descriptor.db_type)?;
        let settings = self.settings(&target);
        let backend = self.pools.acquire(&target).await?;
        sandbox::execute_raw(backend.as_ref(), &request.sql, &settings.sandbox).await
    }

    /// Schema of the target connection, from cache unless `refresh` is set.
    pub async fn introspect(
        &self,
        connection_id: Option<&str>,
        refresh: bool,
    ) -> Result<DatabaseSchema> {
        let target = self.pools.resolve_target(connection_id)?;
        if !refresh {
            if let Some(schema) = self.schema_cache.lock().await.get(&target.key) {
                tracing::debug!(connection = %target.key, "schema cache hit");
                return Ok(schema.clone());
            }
        }
        let settings = self.settings(&target);
        let backend = self.pools.acquire(&target).await?;
        let schema = introspection::introspect(
            backend.as_ref(),
            &target.descriptor.database,
            settings.query.timeout(),
        )
        .await?;
        self.schema_cache
            .lock()
            .await
            .insert(target.key.clone(), schema.clone());
        Ok(schema)
    }

    /// Probe an unsaved descriptor.
    pub async fn test_connection(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionTestReport> {
        self.pools.test_connection(descriptor).await
    }

    /// Probe a saved connection and record the outcome in the catalog.
    pub async fn test_saved_connection(&self, id: &str) -> Result<ConnectionTestReport> {
        let descriptor = self
            .pools
            .catalog()
            .get(id)?
            .ok_or_else(|| LumenError::Validation(format!("connection '{id}' does not exist")))?;
        let result = self.pools.test_connection(&descriptor).await;
        let outcome = TestOutcome {
            status: if result.is_ok() {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Failed
            },
            tested_at: Utc::now(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = self.pools.catalog().record_test_result(id, &outcome) {
            tracing::warn!(connection = id, error = %e, "failed to record connection test result");
        }
        result
    }

    /// Call after a saved connection is edited or deleted.
    pub async fn connection_changed(&self, id: &str) {
        let key = PoolKey::Connection(id.to_string());
        self.pools.evict(&key).await;
        self.schema_cache.lock().await.invalidate(&key);
    }

    pub async fn shutdown(&self) {
        self.pools.shutdown().await;
        self.schema_cache.lock().await.clear();
    }
}
