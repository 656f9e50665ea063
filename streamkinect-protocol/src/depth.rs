//! Depth frame wire encoding.
//!
//! A depth message is a single frame: a 4-byte header holding width and
//! height (u16 big-endian each), followed by an LZ4 frame-format stream of
//! the samples, each written as a big-endian u16, row-major.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{Read, Write};

/// Size of the width/height header preceding the compressed samples.
pub const DEPTH_HEADER_SIZE: usize = 4;

/// A depth frame recovered from its wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDepthFrame {
    pub width: u16,
    pub height: u16,
    pub samples: Vec<u16>,
}

/// Compresses a depth frame into its wire encoding.
pub fn encode_depth_frame(width: u16, height: u16, samples: &[u16]) -> Result<Bytes, ProtocolError> {
    let mut raw = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        raw.extend_from_slice(&sample.to_be_bytes());
    }

    let mut out = BytesMut::with_capacity(DEPTH_HEADER_SIZE + raw.len() / 4);
    out.put_u16(width);
    out.put_u16(height);

    let mut encoder = FrameEncoder::new(out.writer());
    encoder.write_all(&raw)?;
    let out = encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))?
        .into_inner();

    Ok(out.freeze())
}

/// Reads the width and height from an encoded depth frame.
pub fn peek_depth_header(data: &[u8]) -> Result<(u16, u16), ProtocolError> {
    if data.len() < DEPTH_HEADER_SIZE {
        return Err(ProtocolError::TruncatedDepthHeader(data.len()));
    }
    let width = u16::from_be_bytes([data[0], data[1]]);
    let height = u16::from_be_bytes([data[2], data[3]]);
    Ok((width, height))
}

/// Decompresses an encoded depth frame.
pub fn decode_depth_frame(data: &[u8]) -> Result<DecodedDepthFrame, ProtocolError> {
    let (width, height) = peek_depth_header(data)?;

    let mut raw = Vec::new();
    FrameDecoder::new(&data[DEPTH_HEADER_SIZE..])
        .read_to_end(&mut raw)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    let expected = width as usize * height as usize;
    if raw.len() != expected * 2 {
        return Err(ProtocolError::SampleCountMismatch {
            expected,
            actual: raw.len() / 2,
        });
    }

    let samples = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    Ok(DecodedDepthFrame {
        width,
        height,
        samples,
    })
}
