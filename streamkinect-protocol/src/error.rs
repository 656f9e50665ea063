//! Protocol error types.

use thiserror::Error;

/// Transport-level errors that can occur while framing, parsing or encoding
/// messages. These close the offending connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'SKMP', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("invalid message flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u32 },

    #[error("too many frames: {count} (max {max})")]
    TooManyFrames { count: usize, max: usize },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("malformed message body: {0}")]
    MalformedBody(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("depth frame too short: {0} bytes")]
    TruncatedDepthHeader(usize),

    #[error("depth frame sample count mismatch: expected {expected}, got {actual}")]
    SampleCountMismatch { expected: usize, actual: usize },
}

/// Rejections of a structurally valid message whose content is not a
/// well-formed control request. These are answered with an ERROR reply and
/// the connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Invalid message length of {0}.")]
    InvalidMessageLength(usize),

    #[error("Message type frame has invalid length: {0}")]
    InvalidTypeFrameLength(usize),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
}
