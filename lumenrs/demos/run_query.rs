//! Runs a request file against the application database configured in
//! `lumen.toml` (or `$LUMEN_CONFIG`).

use std::{env, fs, sync::Arc};

use lumen::{
    ConnectionPoolManager, DriverPoolFactory, InMemoryCatalog, LumenConfig, PlaintextCredentials,
    QueryEngine, QueryRequest, RawSqlRequest, SourceRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lumen::init_tracing();

    let request_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/requests/revenue_by_region.json".to_string());

    let config = LumenConfig::load_default();
    if config.app_database.is_none() {
        anyhow::bail!("configure [app_database] in lumen.toml to run this demo");
    }

    let registry = Arc::new(SourceRegistry::load_from_dir("demos/sources")?);
    let factory = Arc::new(DriverPoolFactory::new(Arc::new(PlaintextCredentials)));
    let pools = Arc::new(ConnectionPoolManager::new(
        Arc::new(InMemoryCatalog::new()),
        factory,
        config,
    )?);
    let engine = QueryEngine::new(registry, pools);

    let request: QueryRequest = serde_json::from_str(&fs::read_to_string(&request_path)?)?;
    let prepared = engine.prepare(&request)?;
    println!("SQL: {}", prepared.compiled.sql);

    let response = engine.run_query(&request).await?;
    println!("rows: {}", response.meta.total);
    for row in &response.data {
        println!("{}", serde_json::to_string(row)?);
    }

    let regions = engine.distinct_values("orders", "region", None).await?;
    println!("regions: {regions:?}");

    let raw = engine
        .execute_raw(&RawSqlRequest {
            sql: "SELECT COUNT(*) AS n FROM orders".to_string(),
            connection_id: None,
        })
        .await?;
    println!("raw: {:?} in {}ms", raw.rows, raw.elapsed);

    engine.shutdown().await;
    Ok(())
}
