//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] streamkinect_protocol::ProtocolError),

    #[error("device error: {0}")]
    Device(#[from] streamkinect_core::DeviceError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] streamkinect_core::PipelineError),

    #[error("advertiser error: {0}")]
    Advertiser(#[from] AdvertiserError),

    #[error("server {0}")]
    InvalidState(&'static str),

    #[error("device already registered: {0}")]
    DuplicateDevice(String),

    #[error("device {0} is stopped")]
    DeviceStopped(String),

    #[error("server requires a tokio runtime")]
    NoRuntime,
}

impl ServerError {
    /// Returns whether this error was caused by calling an operation in the
    /// wrong lifecycle state.
    pub fn is_state_error(&self) -> bool {
        matches!(self, ServerError::InvalidState(_))
    }
}

/// Service advertisement errors.
#[derive(Debug, Error)]
pub enum AdvertiserError {
    #[error("failed to create service advertiser: {0}")]
    Construction(String),

    #[error("failed to register service '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error("failed to resolve service '{name}': {reason}")]
    Resolution { name: String, reason: String },
}
