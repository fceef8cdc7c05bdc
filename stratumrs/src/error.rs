use thiserror::Error;

pub type Result<T> = std::result::Result<T, StratumError>;

#[derive(Debug, Error)]
pub enum StratumError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("source {source_name} cannot be joined to any of [{}]", .connected.join(", "))]
    JoinResolution {
        source_name: String,
        connected: Vec<String>,
    },
    #[error("execution error on source {source_name}: {message}")]
    Execution {
        source_name: String,
        message: String,
    },
    #[error("query exceeded timeout of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("no backend registered for connection {0}")]
    UnknownConnection(String),
    #[error("backend {backend} does not support {operation}")]
    Unsupported { backend: String, operation: String },
    #[error("metric {metric} evaluated before its dependency {dependency} was available")]
    MissingValue { metric: String, dependency: String },
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fatal, non-retryable problems with the schema or metric catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("dependency cycle involving metric {metric}")]
    DependencyCycle { metric: String },
    #[error("metric {metric} depends on unknown metric {dependency}")]
    UnknownDependency { metric: String, dependency: String },
    #[error("unknown metric {0}")]
    UnknownMetric(String),
    #[error("duplicate metric key {0}")]
    DuplicateMetric(String),
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("duplicate source {0}")]
    DuplicateSource(String),
    #[error("source {source_name} has no column {column}")]
    UnknownColumn { source_name: String, column: String },
    #[error("source {source_name} has no dimension {dimension}")]
    UnknownDimension {
        source_name: String,
        dimension: String,
    },
    #[error("relation {source_name}.{relation} targets unknown source {target}")]
    UnknownRelationTarget {
        source_name: String,
        relation: String,
        target: String,
    },
    #[error("invalid expression for metric {metric}: {reason}")]
    InvalidExpression { metric: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

impl StratumError {
    pub(crate) fn execution(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        StratumError::Execution {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}
