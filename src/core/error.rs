//! Error types for the terrain core
//!
//! Only configuration and startup problems surface as errors. Everything that
//! can go wrong while streaming (stale results, backend failures, numerical
//! anomalies) is recovered where it happens and logged.

use thiserror::Error;

use crate::streaming::compute::ComputeError;

/// Main error type for the terrain core
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Compute backend error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Task error: {0}")]
    Task(String),
}
