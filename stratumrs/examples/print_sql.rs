use std::{env, fs, path::PathBuf, sync::Arc};

use stratum::{ConnectionManager, Engine, MemoryBackend, QueryRequest, SchemaRegistry};

fn usage() {
    eprintln!("Usage: print_sql <catalog_dir> <request_json> [dialect]");
    eprintln!(
        "Example: cargo run --example print_sql -- \
         demo/catalog demo/requests/revenue_by_country.json postgres"
    );
}

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let catalog_dir = PathBuf::from(args.remove(0));
    let request_path = PathBuf::from(args.remove(0));
    let dialect = args.pop().unwrap_or_else(|| "duckdb".to_string());

    let registry = Arc::new(SchemaRegistry::load_from_dir(catalog_dir)?);
    // Rendering only needs capabilities, so empty backends stand in.
    let mut connections = ConnectionManager::new();
    for source in registry.sources() {
        connections.insert(source.connection.clone(), Arc::new(MemoryBackend::new(&dialect)));
    }

    let request: QueryRequest = serde_json::from_str(&fs::read_to_string(request_path)?)?;
    let engine = Engine::new(registry, connections);
    println!("{}", engine.explain_sql(&request)?);
    Ok(())
}
