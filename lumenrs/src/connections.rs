//! External connection descriptors and the traits through which the engine
//! reads them. Persistence lives outside this crate; the engine only reads
//! descriptors and reports test outcomes back.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dialect::DbType;
use crate::error::{LumenError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Untested,
    Connected,
    Failed,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub id: String,
    pub name: String,
    pub db_type: DbType,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    /// Stored secret; turned into a password by a [`CredentialResolver`].
    #[serde(default, skip_serializing)]
    pub encrypted_password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub status: ConnectionStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

fn default_true() -> bool {
    true
}

// Hand-written so the stored secret never reaches logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("ssl", &self.ssl)
            .field("is_default", &self.is_default)
            .field("is_active", &self.is_active)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl ConnectionDescriptor {
    pub fn new(
        id: impl Into<String>,
        db_type: DbType,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            db_type,
            host: host.into(),
            port: None,
            database: database.into(),
            username: username.into(),
            encrypted_password: None,
            ssl: false,
            is_default: false,
            is_active: true,
            status: ConnectionStatus::Untested,
            last_tested_at: None,
            last_error: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_password(mut self, encrypted_password: impl Into<String>) -> Self {
        self.encrypted_password = Some(encrypted_password.into());
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.db_type.default_port())
    }

    /// True when a pool built from `other` would talk to the same server with
    /// the same credentials. Status and labels do not matter.
    pub fn same_endpoint(&self, other: &ConnectionDescriptor) -> bool {
        self.db_type == other.db_type
            && self.host == other.host
            && self.effective_port() == other.effective_port()
            && self.database == other.database
            && self.username == other.username
            && self.encrypted_password == other.encrypted_password
            && self.ssl == other.ssl
    }
}

/// Outcome of a connection test, written back to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub status: ConnectionStatus,
    pub tested_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Read access to saved connections.
pub trait ConnectionCatalog: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<ConnectionDescriptor>>;

    /// The operator-chosen default: `is_default && is_active`.
    fn default_connection(&self) -> Result<Option<ConnectionDescriptor>>;

    fn record_test_result(&self, _id: &str, _outcome: &TestOutcome) -> Result<()> {
        Ok(())
    }
}

/// Turns a stored secret into a usable password.
pub trait CredentialResolver: Send + Sync {
    fn password(&self, descriptor: &ConnectionDescriptor) -> Result<Option<String>>;
}

/// Passwords stored as-is. For tests and local setups.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCredentials;

impl CredentialResolver for PlaintextCredentials {
    fn password(&self, descriptor: &ConnectionDescriptor) -> Result<Option<String>> {
        Ok(descriptor.encrypted_password.clone())
    }
}

/// Catalog held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    connections: RwLock<HashMap<String, ConnectionDescriptor>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: impl IntoIterator<Item = ConnectionDescriptor>) -> Self {
        let catalog = Self::new();
        for descriptor in connections {
            // Lock cannot be poisoned before the catalog is shared.
            let _ = catalog.upsert(descriptor);
        }
        catalog
    }

    /// Insert or replace. A new default clears the flag on every other entry.
    pub fn upsert(&self, descriptor: ConnectionDescriptor) -> Result<()> {
        let mut connections = self.connections.write().map_err(poisoned)?;
        if descriptor.is_default {
            for other in connections.values_mut() {
                other.is_default = false;
            }
        }
        connections.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Option<ConnectionDescriptor>> {
        Ok(self.connections.write().map_err(poisoned)?.remove(id))
    }
}

fn poisoned<T>(_: T) -> LumenError {
    LumenError::Config("connection catalog lock poisoned".to_string())
}

impl ConnectionCatalog for InMemoryCatalog {
    fn get(&self, id: &str) -> Result<Option<ConnectionDescriptor>> {
        Ok(self.connections.read().map_err(poisoned)?.get(id).cloned())
    }

    fn default_connection(&self) -> Result<Option<ConnectionDescriptor>> {
        Ok(self
            .connections
            .read()
            .map_err(poisoned)?
            .values()
            .find(|c| c.is_default && c.is_active)
            .cloned())
    }

    fn record_test_result(&self, id: &str, outcome: &TestOutcome) -> Result<()> {
        let mut connections = self.connections.write().map_err(poisoned)?;
        if let Some(descriptor) = connections.get_mut(id) {
            descriptor.status = outcome.status;
            descriptor.last_tested_at = Some(outcome.tested_at);
            descriptor.last_error = outcome.error.clone();
        }
        Ok(())
    }
}
