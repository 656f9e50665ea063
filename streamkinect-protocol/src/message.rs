//! Control message types, request validation and JSON payloads.

use crate::error::{FramingError, ProtocolError};
use crate::multipart::Multipart;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Endpoint key for a server's control channel.
pub const CONTROL_ENDPOINT: &str = "control";

/// Endpoint key for a device's depth stream.
pub const DEPTH_ENDPOINT: &str = "depth";

/// Control message type, carried as the single byte of the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Error = 0x00,
    Ping = 0x01,
    Pong = 0x02,
    Who = 0x03,
    Me = 0x04,
    Invalid = 0xFF,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, FramingError> {
        match value {
            0x00 => Ok(MessageType::Error),
            0x01 => Ok(MessageType::Ping),
            0x02 => Ok(MessageType::Pong),
            0x03 => Ok(MessageType::Who),
            0x04 => Ok(MessageType::Me),
            0xFF => Ok(MessageType::Invalid),
            other => Err(FramingError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Error => write!(f, "ERROR"),
            MessageType::Ping => write!(f, "PING"),
            MessageType::Pong => write!(f, "PONG"),
            MessageType::Who => write!(f, "WHO"),
            MessageType::Me => write!(f, "ME"),
            MessageType::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Parses the type frame shared by requests and replies.
fn parse_type_frame(message: &Multipart) -> Result<MessageType, FramingError> {
    let count = message.len();
    if count != 1 && count != 2 {
        return Err(FramingError::InvalidMessageLength(count));
    }

    let type_frame = &message.frames[0];
    if type_frame.len() != 1 {
        return Err(FramingError::InvalidTypeFrameLength(type_frame.len()));
    }

    MessageType::try_from(type_frame[0])
}

/// A validated control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: MessageType,
    /// Optional second frame. Requests defined so far carry none.
    pub payload: Option<Bytes>,
}

impl Request {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn who() -> Self {
        Self::new(MessageType::Who)
    }

    /// Validates a received multipart message as a control request.
    ///
    /// The message must have one or two frames, the first of which is exactly
    /// one byte holding a known message type.
    pub fn parse(message: &Multipart) -> Result<Self, FramingError> {
        let kind = parse_type_frame(message)?;
        Ok(Self {
            kind,
            payload: message.frames.get(1).cloned(),
        })
    }

    pub fn into_multipart(self) -> Multipart {
        let mut frames = vec![Bytes::copy_from_slice(&[self.kind.as_byte()])];
        if let Some(payload) = self.payload {
            frames.push(payload);
        }
        Multipart::new(frames)
    }
}

/// A control reply: a type byte and an optional UTF-8 JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: MessageType,
    pub payload: Option<Bytes>,
}

impl Reply {
    /// Creates a reply without a payload.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    /// Creates a reply carrying `value` serialized as JSON.
    pub fn with_json<T: Serialize>(kind: MessageType, value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self {
            kind,
            payload: Some(Bytes::from(payload)),
        })
    }

    /// Creates an ERROR reply with the given reason.
    pub fn error(reason: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "reason": reason.into() }).to_string();
        Self {
            kind: MessageType::Error,
            payload: Some(Bytes::from(payload)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    /// Returns the reason carried by an ERROR reply.
    pub fn error_reason(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        self.payload_json::<ErrorPayload>()
            .ok()
            .flatten()
            .map(|p| p.reason)
    }

    /// Deserializes the payload frame, if present.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<Option<T>, ProtocolError> {
        match &self.payload {
            Some(payload) => {
                let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(serde_json::from_str(text)?))
            }
            None => Ok(None),
        }
    }

    pub fn into_multipart(self) -> Multipart {
        let mut frames = vec![Bytes::copy_from_slice(&[self.kind.as_byte()])];
        if let Some(payload) = self.payload {
            frames.push(payload);
        }
        Multipart::new(frames)
    }

    /// Interprets a received multipart message as a reply.
    pub fn from_multipart(message: Multipart) -> Result<Self, ProtocolError> {
        let kind = parse_type_frame(&message)?;
        let payload = message.frames.into_iter().nth(1);
        Ok(Self { kind, payload })
    }
}

/// Payload of an ERROR reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub reason: String,
}

/// One device entry in an ME payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(mut self, kind: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(kind.into(), address.into());
        self
    }

    pub fn depth_endpoint(&self) -> Option<&str> {
        self.endpoints.get(DEPTH_ENDPOINT).map(String::as_str)
    }
}

/// Payload of an ME reply: the server's self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MePayload {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

impl MePayload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: crate::DESCRIPTOR_VERSION,
            name: name.into(),
            endpoints: BTreeMap::new(),
            devices: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, kind: impl Into<String>, address: impl Into<String>) -> Self {
        self.endpoints.insert(kind.into(), address.into());
        self
    }

    pub fn control_endpoint(&self) -> Option<&str> {
        self.endpoints.get(CONTROL_ENDPOINT).map(String::as_str)
    }
}
