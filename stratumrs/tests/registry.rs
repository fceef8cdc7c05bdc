use std::fs;
use std::path::Path;

use stratum::schema::{DimensionFilter, Granularity, RelationKind};
use stratum::{ConfigError, Metric, SchemaRegistry, StratumError};

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn write_catalog(root: &Path) {
    write(
        root,
        "sources/orders.yml",
        r#"
name: orders
connection: main
table: fact_orders
primary_key: id
columns: [id, customer_id, country, total, created_at]
relations:
  customer:
    target: customers
    kind: belongs_to
    foreign_key: customer_id
dimensions:
  country:
    column: country
    except: ["test"]
  created_at:
    column: created_at
    granularity: week
"#,
    );
    write(
        root,
        "sources/customers.yaml",
        r#"
name: customers
connection: main
dimensions:
  segment: segment
"#,
    );
    write(
        root,
        "metrics/orders.yml",
        r#"
metrics:
  - type: aggregation
    key: revenue
    source: orders
    column: total
    function: sum
  - type: aggregation
    key: order_count
    source: orders
    column: id
    function: count
  - type: computed
    key: avg_order_value
    source: orders
    expression: revenue / NULLIF(order_count, 0)
"#,
    );
}

#[test]
fn loads_sources_and_metrics_from_yaml() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path());
    let registry = SchemaRegistry::load_from_dir(dir.path()).unwrap();

    let orders = registry.source("orders").unwrap();
    assert_eq!(orders.table, "fact_orders");
    assert_eq!(orders.primary_keys, vec!["id".to_string()]);
    match &orders.relations["customer"].kind {
        RelationKind::BelongsTo { foreign_key, owner_key } => {
            assert_eq!((foreign_key.as_str(), owner_key.as_str()), ("customer_id", "id"));
        }
        other => panic!("unexpected relation {other:?}"),
    }

    let created = orders.dimension("created_at").unwrap();
    assert_eq!(created.time.map(|t| t.granularity), Some(Granularity::Week));
    let country = orders.dimension("country").unwrap();
    assert_eq!(
        country.filters.to_filters(),
        vec![DimensionFilter::Except(vec![serde_json::json!("test")])]
    );

    // customers gained an inferred edge back to orders.
    let customers = registry.source("customers").unwrap();
    assert!(customers.relations.values().any(|r| r.target == "orders" && r.inferred));

    let keys: Vec<&str> = registry.metrics().map(Metric::key).collect();
    assert_eq!(keys, vec!["revenue", "order_count", "avg_order_value"]);
    assert_eq!(
        registry.metric("avg_order_value").unwrap().dependencies(),
        &["revenue".to_string(), "order_count".to_string()]
    );
}

#[test]
fn rejects_metrics_on_uncatalogued_columns() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path());
    write(
        dir.path(),
        "metrics/extra.yml",
        r#"
metrics:
  - type: aggregation
    key: tax
    source: orders
    column: tax
    function: sum
"#,
    );
    let err = SchemaRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(
        err,
        StratumError::Config(ConfigError::UnknownColumn { ref column, .. }) if column == "tax"
    ));
}

#[test]
fn rejects_duplicate_metric_keys_across_files() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path());
    write(
        dir.path(),
        "metrics/dupe.yml",
        r#"
metrics:
  - type: aggregation
    key: revenue
    source: orders
    column: total
    function: max
"#,
    );
    let err = SchemaRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, StratumError::Config(ConfigError::DuplicateMetric(_))));
}

#[test]
fn rejects_undeclared_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(dir.path());
    write(
        dir.path(),
        "metrics/bad.yml",
        r#"
metrics:
  - type: computed
    key: margin
    source: orders
    expression: profit / revenue
"#,
    );
    let err = SchemaRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(
        err,
        StratumError::Config(ConfigError::UnknownDependency { ref dependency, .. })
            if dependency == "profit"
    ));
}

#[test]
fn malformed_yaml_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "sources/broken.yml", "name: [unterminated\n");
    let err = SchemaRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, StratumError::Yaml(_)));
}
