use std::{fs, sync::Arc};

use serde_json::{json, Value};
use stratum::{
    logging, Capabilities, ConnectionManager, Engine, MemoryBackend, QueryRequest, Row,
    SchemaRegistry,
};

fn rows(values: Value) -> Vec<Row> {
    match values {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn demo_backend(capabilities: Capabilities) -> MemoryBackend {
    MemoryBackend::new("duckdb")
        .with_capabilities(capabilities)
        .with_table(
            "customers",
            rows(json!([
                {"id": 1, "segment": "retail"},
                {"id": 2, "segment": "wholesale"}
            ])),
        )
        .with_table(
            "orders",
            rows(json!([
                {"id": 1, "customer_id": 1, "country": "US", "total": 100.0,
                 "created_at": "2024-01-05 09:00:00"},
                {"id": 2, "customer_id": 2, "country": "CA", "total": 200.0,
                 "created_at": "2024-01-20 17:30:00"},
                {"id": 3, "customer_id": 1, "country": "US", "total": 50.0,
                 "created_at": "2024-02-02 12:00:00"}
            ])),
        )
        .with_table(
            "order_items",
            rows(json!([
                {"id": 10, "order_id": 1, "sku": "A", "price": 50.0},
                {"id": 11, "order_id": 1, "sku": "B", "price": 25.0},
                {"id": 12, "order_id": 3, "sku": "A", "price": 5.0}
            ])),
        )
}

async fn run(
    registry: Arc<SchemaRegistry>,
    backend: MemoryBackend,
    request: &QueryRequest,
) -> anyhow::Result<()> {
    let mut connections = ConnectionManager::new();
    connections.insert("main", Arc::new(backend));
    let engine = Engine::new(registry, connections);
    let result = engine.run(request).await?;
    println!("plan: {:?}", result.plan_kind);
    for row in result.rows {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing("stratum=debug")?;

    let registry = Arc::new(SchemaRegistry::load_from_dir("demo/catalog")?);
    let request: QueryRequest =
        serde_json::from_str(&fs::read_to_string("demo/requests/revenue_by_country.json")?)?;

    println!("-- native join");
    run(registry.clone(), demo_backend(Capabilities::new("duckdb")), &request).await?;
    println!("-- software join");
    run(registry, demo_backend(Capabilities::new("duckdb").without_joins()), &request).await?;
    Ok(())
}
