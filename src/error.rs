//! Error types for the graph pool.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {key}={value}: {reason}")]
    ParseError {
        key: String,
        value: String,
        reason: String,
    },
}

/// Admission and lifecycle errors returned by the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Dispatch queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Failed to load graph engine: {reason}")]
    EngineLoad { reason: String },

    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Job record errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },
}

/// Errors raised by a graph engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Graph execution failed: {0}")]
    Failed(String),

    #[error("Graph engine unavailable: {0}")]
    Unavailable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
