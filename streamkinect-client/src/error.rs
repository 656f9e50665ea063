//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] streamkinect_protocol::ProtocolError),

    #[error("invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server error: {0}")]
    ServerError(String),

    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: streamkinect_protocol::MessageType,
        actual: streamkinect_protocol::MessageType,
    },

    #[error("reply has no payload")]
    MissingPayload,

    #[error("discovery error: {0}")]
    Discovery(String),
}

impl ClientError {
    /// Returns whether retrying the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }
}
