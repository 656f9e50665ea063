//! Multipart message format shared by the control and depth channels.
//!
//! Message layout (18 bytes header + body):
//!
//! ```text
//! +--------+---------+--------+-------------+----------+--------+
//! | magic  | version | flags  | frame_count | body_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |   2 bytes   |  4 bytes | 4 bytes|
//! +--------+---------+--------+-------------+----------+--------+
//! | body: frame_count x ( frame_len u32 | frame bytes )          |
//! +-------------------------------------------------------------+
//! ```
//!
//! Any frame count up to [`MAX_FRAMES`](crate::MAX_FRAMES) is representable,
//! including zero. Whether a count makes sense is decided by the layer above.

use crate::error::ProtocolError;
use crate::{MAX_BODY_SIZE, MAX_FRAMES};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying multipart messages: "SKMP"
pub const MAGIC: [u8; 4] = *b"SKMP";

/// Size of the fixed message header in bytes (4+2+2+2+4+4 = 18).
pub const MESSAGE_HEADER_SIZE: usize = 18;

/// Size of the per-frame length prefix inside the body.
const FRAME_LEN_SIZE: usize = 4;

/// Message flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(u16);

impl MessageFlags {
    /// CRC32C checksum of the body is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u16 = 0x0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A multipart message: an ordered list of opaque byte frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    /// Protocol version.
    pub version: u16,
    /// Message flags.
    pub flags: MessageFlags,
    /// Message frames, in order.
    pub frames: Vec<Bytes>,
}

impl Multipart {
    /// Creates a new message from the given frames.
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: MessageFlags::new().with_crc(),
            frames,
        }
    }

    /// Creates a message carrying exactly one frame.
    pub fn single(frame: impl Into<Bytes>) -> Self {
        Self::new(vec![frame.into()])
    }

    /// Returns the number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Returns the frame at `index`, if present.
    pub fn frame(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    /// Consumes the message, returning its frames.
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    fn body_len(&self) -> usize {
        self.frames
            .iter()
            .map(|f| FRAME_LEN_SIZE + f.len())
            .sum::<usize>()
    }

    /// Encodes the message into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.frames.len() > MAX_FRAMES {
            return Err(ProtocolError::TooManyFrames {
                count: self.frames.len(),
                max: MAX_FRAMES,
            });
        }

        let body_len = self.body_len();
        if body_len > MAX_BODY_SIZE as usize {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len as u64,
                max: MAX_BODY_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body_len);

        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.frames.len() as u16);
        buf.put_u32(body_len as u32);

        // CRC is filled in once the body has been written.
        let crc_pos = buf.len();
        buf.put_u32(0);

        for frame in &self.frames {
            buf.put_u32(frame.len() as u32);
            buf.put_slice(frame);
        }

        if self.flags.has_crc() {
            let crc = crc32c::crc32c(&buf[MESSAGE_HEADER_SIZE..]);
            buf[crc_pos..crc_pos + 4].copy_from_slice(&crc.to_be_bytes());
        }

        Ok(buf)
    }

    /// Decodes a message from bytes.
    ///
    /// Returns `Ok(Some(message))` if a complete message was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = MessageFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let frame_count = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        if frame_count > MAX_FRAMES {
            return Err(ProtocolError::TooManyFrames {
                count: frame_count,
                max: MAX_FRAMES,
            });
        }

        let body_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len as u64,
                max: MAX_BODY_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);

        let total_len = MESSAGE_HEADER_SIZE + body_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(MESSAGE_HEADER_SIZE);
        let mut body = buf.split_to(body_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&body);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            if body.remaining() < FRAME_LEN_SIZE {
                return Err(ProtocolError::MalformedBody(format!(
                    "missing length prefix for frame {}",
                    index
                )));
            }
            let len = body.get_u32() as usize;
            if body.remaining() < len {
                return Err(ProtocolError::MalformedBody(format!(
                    "frame {} declares {} bytes, {} remaining",
                    index,
                    len,
                    body.remaining()
                )));
            }
            frames.push(body.split_to(len));
        }

        if body.has_remaining() {
            return Err(ProtocolError::MalformedBody(format!(
                "{} trailing bytes after {} frames",
                body.remaining(),
                frame_count
            )));
        }

        Ok(Some(Self {
            version,
            flags,
            frames,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_roundtrip() {
        let message = Multipart::new(vec![Bytes::from_static(&[0x03]), Bytes::from("{}")]);

        let mut buf = message.encode().unwrap();
        let decoded = Multipart::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.version, crate::PROTOCOL_VERSION);
        assert!(decoded.flags.has_crc());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.frame(0).unwrap().as_ref(), &[0x03]);
        assert_eq!(decoded.frame(1).unwrap().as_ref(), b"{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_zero_frames_are_representable() {
        let message = Multipart::new(Vec::new());
        let mut buf = message.encode().unwrap();
        assert_eq!(buf.len(), MESSAGE_HEADER_SIZE);

        let decoded = Multipart::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_empty_frame_preserved() {
        let message = Multipart::new(vec![Bytes::new(), Bytes::from_static(b"x")]);
        let mut buf = message.encode().unwrap();
        let decoded = Multipart::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame(0).unwrap().len(), 0);
        assert_eq!(decoded.frame(1).unwrap().as_ref(), b"x");
    }

    #[test]
    fn test_crc_validation() {
        let message = Multipart::single(Bytes::from_static(b"payload"));
        let mut encoded = message.encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Multipart::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf =
            BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Multipart::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_incomplete_header() {
        let mut buf = BytesMut::from(&b"SKMP\x00\x01\x00\x01"[..]);
        assert!(Multipart::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_incomplete_body() {
        let message = Multipart::single(Bytes::from_static(b"0123456789"));
        let encoded = message.encode().unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(Multipart::decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[encoded.len() - 3..]);
        let decoded = Multipart::decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.frame(0).unwrap().as_ref(), b"0123456789");
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf =
            BytesMut::from(&b"SKMP\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Multipart::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_flags() {
        let result = MessageFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));
    }

    #[test]
    fn test_too_many_frames() {
        let frames = vec![Bytes::new(); MAX_FRAMES + 1];
        let result = Multipart::new(frames).encode();
        assert!(matches!(result, Err(ProtocolError::TooManyFrames { .. })));
    }

    #[test]
    fn test_frame_length_overruns_body() {
        let mut message = Multipart::single(Bytes::from_static(b"abcd"));
        message.flags = MessageFlags::new();
        let mut encoded = message.encode().unwrap();

        // Declare a frame longer than the body.
        encoded[MESSAGE_HEADER_SIZE + 3] = 0x10;

        let result = Multipart::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::MalformedBody(_))));
    }

    #[test]
    fn test_message_without_crc() {
        let mut message = Multipart::single(Bytes::from_static(b"no crc"));
        message.flags = MessageFlags::new();

        let mut buf = message.encode().unwrap();
        let decoded = Multipart::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_multiple_messages_in_buffer() {
        let first = Multipart::single(Bytes::from_static(&[0x01]));
        let second = Multipart::single(Bytes::from_static(&[0x03]));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode().unwrap());
        buf.extend_from_slice(&second.encode().unwrap());

        let decoded = Multipart::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame(0).unwrap().as_ref(), &[0x01]);

        let decoded = Multipart::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame(0).unwrap().as_ref(), &[0x03]);
    }
}
