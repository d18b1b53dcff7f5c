//! Integration tests for loading and validating source definitions.

mod common;

use std::fs;

use lumen::models::Aggregation;
use lumen::{LumenError, SourceRegistry};

use common::{orders_source, ORDERS_YAML};

#[test]
fn loads_yaml_sources_from_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("orders.yml"), ORDERS_YAML)?;
    fs::write(
        dir.path().join("customers.yaml"),
        "name: customers\ntable: customers\ndimensions:\n  country: country\n",
    )?;
    fs::write(dir.path().join("notes.txt"), "ignored")?;

    let registry = SourceRegistry::load_from_dir(dir.path())?;
    assert_eq!(registry.source_names(), vec!["customers", "orders"]);

    let orders = registry
        .get_source("orders")
        .ok_or_else(|| anyhow::anyhow!("orders not loaded"))?;
    assert_eq!(orders.alias.as_deref(), Some("o"));
    assert_eq!(orders.dimensions["region"].expr, "o.region");
    assert_eq!(orders.measures["order_count"].default_agg, Aggregation::Count);
    assert_eq!(orders.measures["revenue"].default_agg, Aggregation::Sum);
    assert_eq!(orders.joins["segments"].requires, vec!["customers"]);
    Ok(())
}

#[test]
fn malformed_yaml_is_reported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("broken.yml"), "name: [unclosed")?;
    let err = SourceRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, LumenError::Yaml(_)));
    Ok(())
}

#[test]
fn missing_directory_is_config_error() {
    let err = SourceRegistry::load_from_dir("/definitely/not/here").unwrap_err();
    assert!(matches!(err, LumenError::Config(_)));
}

#[test]
fn duplicate_source_names_are_rejected() {
    let err = SourceRegistry::from_sources(vec![orders_source(), orders_source()]).unwrap_err();
    assert!(matches!(err, LumenError::Schema(_)));
}

#[test]
fn dimension_referencing_unknown_join_is_rejected() {
    let mut source = orders_source();
    source.dimensions.get_mut("region").unwrap().join = Some("warehouses".to_string());
    let err = SourceRegistry::from_sources(vec![source]).unwrap_err();
    assert!(err.to_string().contains("warehouses"), "{err}");
}

#[test]
fn cyclic_join_requirements_are_rejected() {
    let mut source = orders_source();
    source
        .joins
        .get_mut("customers")
        .unwrap()
        .requires
        .push("segments".to_string());
    let err = SourceRegistry::from_sources(vec![source]).unwrap_err();
    match err {
        LumenError::Schema(msg) => assert!(msg.contains("cyclic"), "{msg}"),
        other => panic!("expected schema error, got {other:?}"),
    }
}

#[test]
fn public_schema_hides_sql() {
    let registry = SourceRegistry::from_sources(vec![orders_source()]).unwrap();
    let schema = registry.public_schema();
    let orders = &schema["orders"];
    assert_eq!(orders.label, "Orders");
    let revenue = orders.measures.iter().find(|m| m.key == "revenue").unwrap();
    assert_eq!(revenue.label, "Revenue");
    let region = orders.dimensions.iter().find(|d| d.key == "region").unwrap();
    assert_eq!(region.label, "region");

    let json = serde_json::to_string(&schema).unwrap();
    assert!(!json.contains("o.amount"));
    assert!(!json.contains("LEFT JOIN"));
}
