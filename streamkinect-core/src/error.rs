//! Core error types.

use thiserror::Error;

/// Errors raised by devices and their frame sources.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn frame thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised when constructing a compression pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("compression pipeline requires a tokio runtime")]
    NoRuntime,
}
