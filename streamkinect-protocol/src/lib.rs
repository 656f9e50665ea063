//! # streamkinect-protocol
//!
//! Wire protocol implementation for streamkinect.
//!
//! This crate provides:
//! - Multipart message framing with length prefixes and CRC32C validation
//! - Control message types (PING/WHO and their replies) and JSON payloads
//! - Request validation with human-readable rejection reasons
//! - Depth frame encoding (big-endian samples, LZ4 compressed)

pub mod codec;
pub mod depth;
pub mod error;
pub mod message;
pub mod multipart;

pub use codec::{Decoder, Encoder};
pub use depth::{
    decode_depth_frame, encode_depth_frame, peek_depth_header, DecodedDepthFrame, DEPTH_HEADER_SIZE,
};
pub use error::{FramingError, ProtocolError};
pub use message::{
    DeviceRecord, ErrorPayload, MePayload, MessageType, Reply, Request, CONTROL_ENDPOINT,
    DEPTH_ENDPOINT,
};
pub use multipart::{MessageFlags, Multipart, MAGIC, MESSAGE_HEADER_SIZE};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Version number carried in ME payloads.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// DNS-SD service type advertised by servers.
pub const SERVICE_TYPE: &str = "_kinect2._tcp";

/// Maximum message body size (64 MiB).
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum number of frames in one multipart message.
pub const MAX_FRAMES: usize = 255;
