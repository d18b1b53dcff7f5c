//! Semantic query engine and multi-database execution layer.
//!
//! Sources are declared in YAML, compiled into dialect-specific SQL and run
//! on pooled PostgreSQL, MySQL or SQL Server connections.

pub mod backends;
pub mod config;
pub mod connections;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod expr_parser;
pub mod introspection;
pub mod models;
pub mod pool_manager;
pub mod query_builder;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod schema_cache;
pub mod sql_ast;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub use backends::{BackendConnection, DriverPoolFactory, PoolFactory, PoolOptions};
pub use config::LumenConfig;
pub use connections::{
    ConnectionCatalog, ConnectionDescriptor, CredentialResolver, InMemoryCatalog,
    PlaintextCredentials,
};
pub use dialect::{DbType, Dialect};
pub use error::{LumenError, Result};
pub use executor::QueryResult;
pub use models::{MeasureRequest, QueryRequest, QueryResponse, SourceSchema};
pub use pool_manager::{ConnectionPoolManager, PoolKey};
pub use query_builder::{CompiledQuery, QueryCompiler, QueryLimits};
pub use registry::SourceRegistry;
pub use runtime::QueryEngine;
pub use sandbox::{RawQueryResponse, RawSqlRequest, SqlSandbox};

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
