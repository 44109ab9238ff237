use thiserror::Error;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding or decoding runtime-state snapshots
    #[error("State serialization error: {0}")]
    State(#[from] serde_json::Error),

    /// Requested point or variable was not found in the store
    #[error("Point not found: {0}")]
    PointNotFound(String),

    /// Returned value type does not match the expected type
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Expression could not be parsed or evaluated
    #[error("Expression error: {0}")]
    Expression(String),

    /// Evaluation-time failure that only affects the current tick
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenient alias over [`Result`] using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;
