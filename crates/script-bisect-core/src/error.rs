//! Error taxonomy for script bisection.

use std::fmt;

/// Which end of the commit range an invariant check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Good,
    Bad,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Good => f.write_str("good"),
            Endpoint::Bad => f.write_str("bad"),
        }
    }
}

/// Fatal errors. Per-commit problems resolve to a verdict instead.
#[derive(Debug, thiserror::Error)]
pub enum BisectError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("range error: {0}")]
    Range(String),

    #[error("invariant violation: {endpoint} ref '{reference}' {detail}")]
    InvariantViolation {
        endpoint: Endpoint,
        reference: String,
        detail: String,
    },

    #[error("execution error: {reason} (command: {command})")]
    Execution { command: String, reason: String },

    #[error("git error: {0}")]
    Git(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bisection operations.
pub type Result<T> = std::result::Result<T, BisectError>;
