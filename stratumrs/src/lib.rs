pub mod aggregate;
pub mod backend;
pub mod config;
pub mod dependency;
pub mod error;
pub mod expr;
pub mod grammar;
pub mod join;
pub mod logging;
pub mod metrics;
pub mod plan;
pub mod planner;
pub mod post_process;
pub mod registry;
pub mod render;
pub mod request;
pub mod result;
pub mod runtime;
pub mod schema;
pub mod software_join;
pub mod value;

pub use backend::{Backend, Capabilities, ConnectionManager, MemoryBackend};
#[cfg(feature = "duckdb")]
pub use backend::DuckDbBackend;
pub use config::EngineConfig;
pub use dependency::{Classification, DependencyLevel, DependencyResolver};
pub use error::{ConfigError, Result, StratumError};
pub use grammar::{Grammar, GrammarRegistry};
pub use join::{JoinGraphBuilder, JoinPathFinder, JoinPlan, JoinSpecification};
pub use metrics::{AggregationFn, Metric};
pub use plan::{PlanKind, PlannedQuery, QueryPlan};
pub use planner::QueryPlanner;
pub use post_process::PostProcessor;
pub use registry::SchemaRegistry;
pub use render::SqlRenderer;
pub use request::{DimensionRef, QueryRequest, RequestFilter};
pub use result::{ColumnKind, ColumnMeta, QueryResult};
pub use runtime::Engine;
pub use schema::{Dimension, Granularity, Relation, Source};
pub use software_join::SoftwareJoinExecutor;
pub use value::Row;
