//! Error types for every failure the engine can observe
//!
//! Failures are split by where they happen. Startup problems are `EngineError`,
//! input preparation problems are `StagingError`, and problems with the isolation
//! substrate itself are `BackendError`. A request that never reaches a session
//! ends in a `RequestError`; a request that does always ends in an
//! `ExecutionResult`, so `BackendError` is never handed to a caller directly.

use thiserror::Error;

use crate::validator::Rejection;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Requested backend is unavailable: {0}")]
    BackendUnavailable(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

/// Input preparation failed; no session was spawned.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Binding name '{name}' is not a usable variable name: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Binding name '{0}' is declared more than once")]
    DuplicateName(String),
    #[error("Too many datasets: {count} declared, at most {limit} allowed")]
    TooManyDatasets { count: usize, limit: usize },
    #[error("Dataset '{name}' has no recognised format")]
    UnknownFormat { name: String },
    #[error("Dataset '{name}' could not be read: {reason}")]
    Unreadable { name: String, reason: String },
    #[error("Dataset '{name}' is {size} bytes, above the {limit} byte ceiling")]
    DatasetTooLarge { name: String, size: u64, limit: u64 },
    #[error("Datasets total {size} bytes, above the {limit} byte ceiling")]
    TotalTooLarge { size: u64, limit: u64 },
    #[error("I/O error while staging: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not write session manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl StagingError {
    /// True for the size ceilings, which callers usually report differently.
    pub fn is_size_limit(&self) -> bool {
        matches!(
            self,
            StagingError::DatasetTooLarge { .. }
                | StagingError::TotalTooLarge { .. }
                | StagingError::TooManyDatasets { .. }
        )
    }
}

// Specific error for the isolation substrate
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("Failed to spawn sandbox process: {0}")]
    Spawn(String),
    #[error("I/O error during sandbox operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Container runtime is not reachable: {0}")]
    RuntimeUnavailable(String),
    #[error("Sandbox output could not be collected: {0}")]
    Collection(String),
}

/// Terminal outcomes for requests that never produced a session result.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Script rejected by validator: {0}")]
    ValidationRejected(Rejection),
    #[error("Dataset staging failed: {0}")]
    Staging(#[from] StagingError),
    #[error("All {capacity} sandbox slots are busy")]
    Backpressure { capacity: usize },
    #[error("Request was cancelled before the session finished")]
    Cancelled,
}

impl From<Rejection> for RequestError {
    fn from(rejection: Rejection) -> Self {
        RequestError::ValidationRejected(rejection)
    }
}
