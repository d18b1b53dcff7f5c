//! Configuration system for Lumen.
//!
//! Supports TOML-based configuration with global defaults and per-connection overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backends::PoolOptions;
use crate::connections::ConnectionDescriptor;
use crate::dialect::DbType;
use crate::error::{LumenError, Result};
use crate::query_builder::QueryLimits;

/// Pool-map id reserved for the application's own database.
pub const APP_DATABASE_ID: &str = "__app__";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LumenConfig {
    /// Global defaults applied to all connections unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-connection overrides keyed by connection id.
    pub connections: HashMap<String, ConnectionOverrides>,

    /// Database used when neither the request nor the catalog names one.
    pub app_database: Option<AppDatabaseConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub sandbox: SandboxConfig,
    pub pool: PoolConfig,
    pub schema_cache: SchemaCacheConfig,
}

/// Compiled (semantic) query execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Query timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Hard ceiling on rows per query (default: 10000).
    pub max_row_limit: u64,
    /// Row limit when the request names none (default: 1000).
    pub default_row_limit: u64,
    /// Cap on distinct filter values (default: 500).
    pub distinct_value_limit: u64,
}

/// Raw SQL execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Statement timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Rows returned before `truncated` is set (default: 1000).
    pub row_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum pool size per connection (default: 10).
    pub size: usize,
    /// Time allowed to open or check out a connection (default: 10000).
    pub connect_timeout_ms: u64,
}

/// Introspection cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Cache TTL in seconds (default: 300).
    pub ttl_secs: u64,
    /// Maximum cached schemas (default: 100).
    pub max_size: usize,
}

/// Per-connection configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionOverrides {
    pub query: Option<QueryConfig>,
    pub sandbox: Option<SandboxConfig>,
    pub pool: Option<PoolConfig>,
}

/// The application's own database.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppDatabaseConfig {
    pub db_type: DbType,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    /// Read the password from this environment variable instead.
    pub password_env: Option<String>,
    #[serde(default)]
    pub ssl: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_row_limit: 10_000,
            default_row_limit: 1_000,
            distinct_value_limit: 500,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            row_limit: 1_000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_size: 100,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn limits(&self) -> QueryLimits {
        QueryLimits {
            default_limit: self.default_row_limit,
            max_limit: self.max_row_limit,
            distinct_limit: self.distinct_value_limit,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            max_size: self.size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

impl AppDatabaseConfig {
    /// Descriptor for the pool manager. The password is carried in the
    /// descriptor's secret slot and resolved like any saved connection's.
    pub fn descriptor(&self) -> Result<ConnectionDescriptor> {
        let password = match (&self.password_env, &self.password) {
            (Some(var), _) => Some(std::env::var(var).map_err(|_| {
                LumenError::Config(format!("app database password variable {var} is not set"))
            })?),
            (None, password) => password.clone(),
        };
        let mut descriptor = ConnectionDescriptor::new(
            APP_DATABASE_ID,
            self.db_type,
            &self.host,
            &self.database,
            &self.username,
        )
        .with_ssl(self.ssl);
        descriptor.name = "application database".to_string();
        descriptor.port = self.port;
        descriptor.encrypted_password = password;
        Ok(descriptor)
    }
}

impl LumenConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LumenError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(toml_str)
            .map_err(|e| LumenError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `LUMEN_CONFIG` environment variable
    /// 2. `./lumen.toml` (current directory)
    /// 3. `~/.config/lumen/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("LUMEN_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from LUMEN_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring LUMEN_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("lumen.toml") {
            tracing::info!("loaded config from ./lumen.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("lumen").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Resolved config for a connection id (merges global defaults).
    pub fn for_connection(&self, id: &str) -> ResolvedConnectionConfig {
        let overrides = self.connections.get(id);
        ResolvedConnectionConfig {
            query: overrides
                .and_then(|o| o.query.clone())
                .unwrap_or_else(|| self.defaults.query.clone()),
            sandbox: overrides
                .and_then(|o| o.sandbox.clone())
                .unwrap_or_else(|| self.defaults.sandbox.clone()),
            pool: overrides
                .and_then(|o| o.pool.clone())
                .unwrap_or_else(|| self.defaults.pool.clone()),
        }
    }

    fn validate(&self) -> Result<()> {
        let query_configs = std::iter::once(&self.defaults.query)
            .chain(self.connections.values().filter_map(|o| o.query.as_ref()));
        for query in query_configs {
            if query.max_row_limit == 0 || query.default_row_limit == 0 {
                return Err(LumenError::Config(
                    "query row limits must be positive".to_string(),
                ));
            }
        }
        let pools = std::iter::once(&self.defaults.pool)
            .chain(self.connections.values().filter_map(|o| o.pool.as_ref()));
        for pool in pools {
            if pool.size == 0 {
                return Err(LumenError::Config("pool size must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Fully resolved configuration for a connection (no Option fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnectionConfig {
    pub query: QueryConfig,
    pub sandbox: SandboxConfig,
    pub pool: PoolConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = LumenConfig::default();
        assert_eq!(cfg.defaults.query.timeout_ms, 30_000);
        assert_eq!(cfg.defaults.query.max_row_limit, 10_000);
        assert_eq!(cfg.defaults.sandbox.row_limit, 1_000);
        assert_eq!(cfg.defaults.pool.size, 10);
        assert_eq!(cfg.defaults.schema_cache.ttl_secs, 300);
        assert!(cfg.app_database.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[defaults.query]
timeout_ms = 60000
max_row_limit = 50000

[app_database]
db_type = "postgres"
host = "localhost"
database = "lumen"
username = "lumen"
password = "pw"
"#;
        let cfg = LumenConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.defaults.query.timeout_ms, 60_000);
        assert_eq!(cfg.defaults.query.max_row_limit, 50_000);
        assert_eq!(cfg.defaults.query.default_row_limit, 1_000);

        let app = cfg.app_database.unwrap().descriptor().unwrap();
        assert_eq!(app.id, APP_DATABASE_ID);
        assert_eq!(app.db_type, DbType::Postgresql);
        assert_eq!(app.effective_port(), 5432);
        assert_eq!(app.encrypted_password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_connection_override() {
        let toml = r#"
[defaults.pool]
size = 8

[connections.warehouse.pool]
size = 32

[connections.warehouse.sandbox]
timeout_ms = 120000
"#;
        let cfg = LumenConfig::from_toml(toml).unwrap();

        let default_resolved = cfg.for_connection("unknown");
        assert_eq!(default_resolved.pool.size, 8);

        let warehouse = cfg.for_connection("warehouse");
        assert_eq!(warehouse.pool.size, 32);
        assert_eq!(warehouse.sandbox.timeout(), Duration::from_secs(120));
        assert_eq!(warehouse.sandbox.row_limit, 1_000);
        assert_eq!(warehouse.query, QueryConfig::default());
    }

    #[test]
    fn test_rejects_zero_limits() {
        assert!(LumenConfig::from_toml("[defaults.pool]\nsize = 0\n").is_err());
        assert!(LumenConfig::from_toml("[defaults.query]\nmax_row_limit = 0\n").is_err());
    }

    #[test]
    fn test_missing_password_env_is_config_error() {
        let app = AppDatabaseConfig {
            db_type: DbType::Mysql,
            host: "h".into(),
            port: None,
            database: "d".into(),
            username: "u".into(),
            password: None,
            password_env: Some("LUMEN_TEST_SURELY_UNSET_PASSWORD".into()),
            ssl: false,
        };
        assert!(matches!(app.descriptor(), Err(LumenError::Config(_))));
    }
}
