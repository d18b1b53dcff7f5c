//! Fake backends shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lumen::connections::ConnectionDescriptor;
use lumen::error::{LumenError, Result};
use lumen::{BackendConnection, DbType, PoolFactory, PoolOptions, QueryResult, SourceSchema};

pub type Responder = Arc<dyn Fn(&str) -> Result<QueryResult> + Send + Sync>;

pub struct MockBackend {
    db_type: DbType,
    responder: Responder,
    pub executed: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl MockBackend {
    pub fn new(db_type: DbType, responder: Responder) -> Self {
        Self {
            db_type,
            responder,
            executed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnection for MockBackend {
    fn db_type(&self) -> DbType {
        self.db_type
    }

    async fn execute_sql(&self, sql: &str, _timeout: Duration) -> Result<QueryResult> {
        self.executed.lock().unwrap().push(sql.to_string());
        (self.responder)(sql)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Counts pool creations and keeps every backend it hands out.
pub struct MockFactory {
    responder: Responder,
    delay: Duration,
    pub created: AtomicUsize,
    pub backends: Mutex<Vec<Arc<MockBackend>>>,
    pub options: Mutex<Vec<PoolOptions>>,
}

impl MockFactory {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            delay: Duration::ZERO,
            created: AtomicUsize::new(0),
            backends: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn backend(&self, index: usize) -> Arc<MockBackend> {
        self.backends.lock().unwrap()[index].clone()
    }

    pub fn all_executed(&self) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.executed())
            .collect()
    }
}

#[async_trait]
impl PoolFactory for MockFactory {
    async fn create_pool(
        &self,
        descriptor: &ConnectionDescriptor,
        options: PoolOptions,
    ) -> Result<Arc<dyn BackendConnection>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.options.lock().unwrap().push(options);
        let backend = Arc::new(MockBackend::new(descriptor.db_type, self.responder.clone()));
        self.backends.lock().unwrap().push(backend.clone());
        Ok(backend)
    }
}

pub fn responder<F>(f: F) -> Responder
where
    F: Fn(&str) -> Result<QueryResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn empty_responder() -> Responder {
    responder(|_| Ok(QueryResult::default()))
}

pub fn failing_responder() -> Responder {
    responder(|_| Err(LumenError::Connection("connection refused".to_string())))
}

pub fn result(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
    QueryResult::from_positional(columns.iter().map(|c| c.to_string()).collect(), rows)
}

pub fn pg(id: &str) -> ConnectionDescriptor {
    ConnectionDescriptor::new(id, DbType::Postgresql, "db.internal", "sales", "analyst")
        .with_password("secret")
}

pub const ORDERS_YAML: &str = r#"
name: orders
label: Orders
table: orders
alias: o
dimensions:
  region: o.region
  status: o.status
  customer_country:
    expr: c.country
    join: customers
  segment:
    expr: s.name
    join: segments
measures:
  revenue:
    expr: o.amount
    label: Revenue
  order_count:
    expr: o.id
    default_agg: count
joins:
  customers: LEFT JOIN customers c ON c.id = o.customer_id
  segments:
    sql: LEFT JOIN segments s ON s.id = c.segment_id
    requires: [customers]
filter_columns:
  region: o.region
  status: o.status
  min_amount:
    column: o.amount
    type: number
    op: ">="
  country:
    column: c.country
    join: customers
"#;

pub fn orders_source() -> SourceSchema {
    serde_yaml::from_str(ORDERS_YAML).unwrap()
}
