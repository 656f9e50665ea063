//! Encoder and decoder for multipart messages over a byte stream.

use crate::error::ProtocolError;
use crate::message::{Reply, Request};
use crate::multipart::Multipart;
use bytes::{Bytes, BytesMut};

/// Encodes requests and replies into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes an arbitrary multipart message.
    pub fn encode_message(message: &Multipart) -> Result<BytesMut, ProtocolError> {
        message.encode()
    }

    /// Encodes a control request.
    pub fn encode_request(request: Request) -> Result<BytesMut, ProtocolError> {
        request.into_multipart().encode()
    }

    /// Encodes a control reply.
    pub fn encode_reply(reply: Reply) -> Result<BytesMut, ProtocolError> {
        reply.into_multipart().encode()
    }

    /// Encodes a single-frame message, as used on depth streams.
    pub fn encode_single(frame: Bytes) -> Result<BytesMut, ProtocolError> {
        Multipart::single(frame).encode()
    }
}

/// Accumulates bytes read from a stream and yields complete messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next multipart message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Multipart>, ProtocolError> {
        Multipart::decode(&mut self.buffer)
    }

    /// Attempts to decode the next reply from the buffer.
    pub fn decode_reply(&mut self) -> Result<Option<Reply>, ProtocolError> {
        match self.decode_message()? {
            Some(message) => Ok(Some(Reply::from_multipart(message)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn test_request_reaches_decoder() {
        let encoded = Encoder::encode_request(Request::ping()).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let message = decoder.decode_message().unwrap().unwrap();
        let request = Request::parse(&message).unwrap();
        assert_eq!(request.kind, MessageType::Ping);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_message_decoding() {
        let encoded = Encoder::encode_reply(Reply::error("Unknown message")).unwrap();

        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_reply().unwrap().is_none());

        decoder.extend(&encoded[10..]);
        let reply = decoder.decode_reply().unwrap().unwrap();
        assert_eq!(reply.error_reason().as_deref(), Some("Unknown message"));
    }

    #[test]
    fn test_decode_reply_rejects_bad_type_frame() {
        let encoded = Encoder::encode_single(Bytes::from_static(&[0x01, 0x02])).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let result = decoder.decode_reply();
        assert!(matches!(result, Err(ProtocolError::Framing(_))));
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = Decoder::default();
        decoder.extend(b"SKMP");
        assert_eq!(decoder.buffered(), 4);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }
}
