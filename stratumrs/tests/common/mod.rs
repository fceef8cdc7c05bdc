#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use stratum::schema::{Dimension, Granularity, Relation, Source, TimePrecision};
use stratum::{
    AggregationFn, Capabilities, ConnectionManager, Engine, EngineConfig, MemoryBackend, Metric,
    Row, SchemaRegistry,
};

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

pub fn sources() -> Vec<Source> {
    vec![
        Source::new("customers", "main")
            .with_dimension("segment", Dimension::column("segment")),
        Source::new("orders", "main")
            .with_relation("customer", Relation::belongs_to("customers", "customer_id", "id"))
            .with_relation("items", Relation::has_many("order_items", "id", "order_id"))
            .with_dimension("country", Dimension::column("country"))
            .with_dimension(
                "created_at",
                Dimension::time("created_at", Granularity::Month, TimePrecision::Timestamp),
            ),
        Source::new("order_items", "main").with_dimension("sku", Dimension::column("sku")),
        Source::new("events", "analytics").with_dimension("kind", Dimension::column("kind")),
    ]
}

pub fn metrics() -> Vec<Metric> {
    vec![
        Metric::aggregation("revenue", "orders", "total", AggregationFn::Sum),
        Metric::aggregation("discount", "orders", "discount", AggregationFn::Sum),
        Metric::aggregation("order_count", "orders", "id", AggregationFn::Count),
        Metric::aggregation("item_revenue", "order_items", "price", AggregationFn::Sum),
        Metric::aggregation("item_count", "order_items", "id", AggregationFn::Count),
        Metric::aggregation("avg_price", "order_items", "price", AggregationFn::Avg),
        Metric::aggregation("event_count", "events", "id", AggregationFn::Count),
        Metric::computed("discount_rate", "orders", "discount / revenue").unwrap(),
        Metric::computed("avg_order_value", "orders", "revenue / order_count").unwrap(),
        Metric::computed("avg_order_value_cents", "orders", "avg_order_value * 100").unwrap(),
        Metric::computed("revenue_per_item", "orders", "revenue / item_count").unwrap(),
    ]
}

pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::from_parts(sources(), metrics()).unwrap())
}

pub fn tables() -> Vec<(&'static str, Vec<Row>)> {
    vec![
        (
            "customers",
            vec![
                row(json!({"id": 1, "segment": "retail"})),
                row(json!({"id": 2, "segment": "wholesale"})),
            ],
        ),
        (
            "orders",
            vec![
                row(json!({
                    "id": 1, "customer_id": 1, "country": "US", "total": 100, "discount": 10,
                    "created_at": "2024-01-05 09:00:00"
                })),
                row(json!({
                    "id": 2, "customer_id": 2, "country": "CA", "total": 200, "discount": 0,
                    "created_at": "2024-01-20 17:30:00"
                })),
                row(json!({
                    "id": 3, "customer_id": 1, "country": "US", "total": 50, "discount": 5,
                    "created_at": "2024-02-02 12:00:00"
                })),
                row(json!({
                    "id": 4, "customer_id": 2, "country": "MX", "total": 0, "discount": 0,
                    "created_at": "2024-02-11 08:15:00"
                })),
            ],
        ),
        (
            "order_items",
            vec![
                row(json!({"id": 10, "order_id": 1, "sku": "A", "price": 50})),
                row(json!({"id": 11, "order_id": 1, "sku": "B", "price": 25})),
                row(json!({"id": 12, "order_id": 3, "sku": "A", "price": 5})),
            ],
        ),
    ]
}

pub fn memory_backend() -> MemoryBackend {
    tables()
        .into_iter()
        .fold(MemoryBackend::new("duckdb"), |backend, (name, rows)| {
            backend.with_table(name, rows)
        })
}

pub fn engine_with(backend: MemoryBackend, config: EngineConfig) -> Engine {
    let mut connections = ConnectionManager::new();
    connections.insert("main", Arc::new(backend));
    let analytics = MemoryBackend::new("duckdb").with_table("events", vec![]);
    connections.insert("analytics", Arc::new(analytics));
    Engine::new(registry(), connections).with_config(config)
}

/// Engine whose backend joins natively.
pub fn native_engine() -> Engine {
    engine_with(memory_backend(), EngineConfig::default())
}

/// Engine whose backend cannot join, forcing the software path.
pub fn software_engine() -> Engine {
    engine_with(
        memory_backend().with_capabilities(Capabilities::new("duckdb").without_joins()),
        EngineConfig::default(),
    )
}
