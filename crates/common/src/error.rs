//! Shared error taxonomy for the pipeline engine

use thiserror::Error;

/// Fatal configuration errors, raised while resolving a description or
/// constructing an algorithm graph, before any data flows.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown {capability} type: {name}")]
    UnknownType {
        capability: &'static str,
        name: String,
    },

    #[error("Malformed description `{fragment}`: {reason}")]
    Malformed { fragment: String, reason: String },

    #[error("{type_name} has no parameter named `{name}`")]
    UnknownParameter { type_name: String, name: String },

    #[error("Invalid value `{value}` for parameter `{name}` (expected {expected})")]
    InvalidParameter {
        name: String,
        value: String,
        expected: &'static str,
    },

    #[error("Model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-item processing errors. These are contained at batch dispatch
/// boundaries and converted into flagged empty results; they never abort a
/// run on their own.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Missing metadata key: {0}")]
    MissingKey(String),

    #[error("Invalid conversion of `{key}` from {value}")]
    InvalidConversion { key: String, value: String },

    #[error("Expected {expected} channel(s), found {actual}")]
    ChannelCount { expected: usize, actual: usize },

    #[error("Channel shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open {0}")]
    OpenFailed(String),

    #[error("Source exhausted")]
    SourceExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for per-item processing operations
pub type Result<T> = std::result::Result<T, ProcessError>;
